// Structured logging at plugin scope
//
// Every line carries the plugin name and user id so operators can slice
// plugin output without trusting the plugin to identify itself.

use serde_json::Value;
use tracing::{debug, error, info, warn};

pub struct LogCapability {
    plugin_name: String,
    user_id: String,
}

impl LogCapability {
    pub fn new(plugin_name: &str, user_id: &str) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            user_id: user_id.to_string(),
        }
    }

    pub fn debug(&self, message: &str) {
        debug!(plugin = %self.plugin_name, user_id = %self.user_id, "{message}");
    }

    pub fn info(&self, message: &str) {
        info!(plugin = %self.plugin_name, user_id = %self.user_id, "{message}");
    }

    pub fn warn(&self, message: &str) {
        warn!(plugin = %self.plugin_name, user_id = %self.user_id, "{message}");
    }

    pub fn error(&self, message: &str) {
        error!(plugin = %self.plugin_name, user_id = %self.user_id, "{message}");
    }

    /// Info with a structured payload
    pub fn info_with(&self, message: &str, fields: &Value) {
        info!(plugin = %self.plugin_name, user_id = %self.user_id, fields = %fields, "{message}");
    }
}

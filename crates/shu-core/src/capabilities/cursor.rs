// Opaque per-feed cursor storage
//
// Cursors are keyed by the schedule bound at host construction, or by an
// explicit key (e.g. a KB id) when the plugin tracks several streams.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::traits::CursorStore;

pub struct CursorCapability {
    store: Arc<dyn CursorStore>,
    plugin_name: String,
    schedule_id: Option<String>,
}

impl CursorCapability {
    pub fn new(store: Arc<dyn CursorStore>, plugin_name: &str, schedule_id: Option<String>) -> Self {
        Self {
            store,
            plugin_name: plugin_name.to_string(),
            schedule_id,
        }
    }

    fn scope_key(&self, key: Option<&str>) -> Result<String> {
        match (key, &self.schedule_id) {
            (Some(k), _) => Ok(k.to_string()),
            (None, Some(sid)) => Ok(format!("schedule:{sid}")),
            (None, None) => Err(CoreError::config(
                "cursor access requires a key when no schedule is bound",
            )),
        }
    }

    pub async fn get(&self, key: Option<&str>) -> Result<Option<Value>> {
        let scope = self.scope_key(key)?;
        self.store.get_cursor(&self.plugin_name, &scope).await
    }

    pub async fn set(&self, key: Option<&str>, value: Value) -> Result<()> {
        let scope = self.scope_key(key)?;
        self.store.set_cursor(&self.plugin_name, &scope, value).await
    }

    pub async fn delete(&self, key: Option<&str>) -> Result<()> {
        let scope = self.scope_key(key)?;
        self.store.delete_cursor(&self.plugin_name, &scope).await
    }
}

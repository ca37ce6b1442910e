// Secret lookup scoped to the plugin and (optionally) the executing user

use std::sync::Arc;

use crate::error::Result;
use crate::traits::SecretStore;

pub struct SecretsCapability {
    store: Arc<dyn SecretStore>,
    plugin_name: String,
    user_id: String,
}

impl SecretsCapability {
    pub fn new(store: Arc<dyn SecretStore>, plugin_name: &str, user_id: &str) -> Self {
        Self {
            store,
            plugin_name: plugin_name.to_string(),
            user_id: user_id.to_string(),
        }
    }

    /// Plugin-scoped secret shared by all users
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.store.get_secret(&self.plugin_name, None, key).await
    }

    /// Secret scoped to the plugin and the executing user
    pub async fn get_for_user(&self, key: &str) -> Result<Option<String>> {
        self.store
            .get_secret(&self.plugin_name, Some(&self.user_id), key)
            .await
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        self.store.has_secret(&self.plugin_name, None, key).await
    }
}

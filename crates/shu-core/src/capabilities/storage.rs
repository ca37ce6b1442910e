// Per-plugin object-store namespace

use std::sync::Arc;

use crate::error::Result;
use crate::traits::ObjectStore;

pub struct StorageCapability {
    store: Arc<dyn ObjectStore>,
    plugin_name: String,
}

impl StorageCapability {
    pub fn new(store: Arc<dyn ObjectStore>, plugin_name: &str) -> Self {
        Self {
            store,
            plugin_name: plugin_name.to_string(),
        }
    }

    pub async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.store.put_object(&self.plugin_name, key, bytes).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store.get_object(&self.plugin_name, key).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.store.delete_object(&self.plugin_name, key).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.store.list_objects(&self.plugin_name, prefix).await
    }
}

// Plugin registry: manifests on disk, enablement in the definition store
//
// Two authoritative views: the on-disk manifests own the code, the persisted
// PluginDefinition rows own enablement and published schemas. resolve()
// re-verifies enablement on every call so a runtime disable toggle takes
// effect immediately, evicting the cached instance.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::error::Result;
use crate::loader::PluginLoader;
use crate::manifest::PluginRecord;
use crate::plugin::LoadedPlugin;
use crate::traits::{DefinitionStore, PluginDefinition};

/// Counts reported by a sync pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub purged: usize,
    pub discovered: usize,
}

pub struct PluginRegistry {
    loader: PluginLoader,
    manifest: Mutex<HashMap<String, PluginRecord>>,
    cache: Mutex<HashMap<String, LoadedPlugin>>,
}

impl PluginRegistry {
    pub fn new(loader: PluginLoader) -> Self {
        Self {
            loader,
            manifest: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Re-discover manifests and drop every cached instance.
    pub fn refresh(&self) {
        let records = self.loader.discover();
        *self.manifest.lock().unwrap() = records;
        self.cache.lock().unwrap().clear();
    }

    /// Current manifest view, refreshing when empty.
    pub fn get_manifest(&self) -> HashMap<String, PluginRecord> {
        if self.manifest.lock().unwrap().is_empty() {
            self.refresh();
        }
        self.manifest.lock().unwrap().clone()
    }

    /// Upsert one PluginDefinition per discovered manifest.
    ///
    /// - creates missing rows with enabled=false
    /// - refreshes stored schemas when the plugin publishes them
    /// - purges rows whose manifest disappeared
    /// - never changes `enabled`
    ///
    /// Idempotent: a second sync over the same disk state is a no-op.
    pub async fn sync(&self, store: &dyn DefinitionStore) -> Result<SyncReport> {
        let records = self.get_manifest();
        let mut report = SyncReport {
            discovered: records.len(),
            ..Default::default()
        };

        for (name, record) in &records {
            let loaded = match self.loader.load(record) {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(plugin = %name, error = %e, "Skipping plugin during sync");
                    continue;
                }
            };
            let input_schema = loaded.input_schema();
            let output_schema = loaded.output_schema();

            match store.get_definition(name).await? {
                None => {
                    let created = store
                        .create_definition(PluginDefinition {
                            name: name.clone(),
                            version: record.version().to_string(),
                            enabled: false,
                            input_schema,
                            output_schema,
                            limits: None,
                        })
                        .await?;
                    if created {
                        report.created += 1;
                    }
                }
                Some(_) => {
                    if store
                        .update_schemas(name, input_schema, output_schema)
                        .await?
                    {
                        report.updated += 1;
                    }
                }
            }
        }

        for definition in store.list_definitions().await? {
            if !records.contains_key(&definition.name)
                && store.delete_definition(&definition.name).await?
            {
                report.purged += 1;
            }
        }

        Ok(report)
    }

    /// Resolve a usable plugin instance iff an enabled definition row exists.
    ///
    /// Enablement is re-read from the store on every call; a disabled row
    /// evicts the cached instance and resolves to None.
    pub async fn resolve(
        &self,
        name: &str,
        store: &dyn DefinitionStore,
    ) -> Result<Option<LoadedPlugin>> {
        let cached = self.cache.lock().unwrap().get(name).cloned();
        if let Some(plugin) = cached {
            if store.is_enabled(name).await? {
                return Ok(Some(plugin));
            }
            self.cache.lock().unwrap().remove(name);
            info!(plugin = %name, "Evicted cached plugin after disable toggle");
            return Ok(None);
        }

        let record = match self.get_manifest().get(name) {
            Some(record) => record.clone(),
            None => {
                warn!(plugin = %name, "Plugin not found in discovered manifests");
                return Ok(None);
            }
        };

        if !store.is_enabled(name).await? {
            warn!(plugin = %name, "Plugin is disabled or not registered");
            return Ok(None);
        }

        match self.loader.load(&record) {
            Ok(plugin) => {
                self.cache
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), plugin.clone());
                Ok(Some(plugin))
            }
            Err(e) => {
                warn!(plugin = %name, error = %e, "Plugin failed to load");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::capabilities::Host;
    use crate::memory::MemoryDefinitionStore;
    use crate::plugin::{ExecuteContext, Plugin, PluginResult};

    struct DemoPlugin;

    #[async_trait]
    impl Plugin for DemoPlugin {
        fn name(&self) -> &str {
            "demo"
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        fn input_schema(&self) -> Option<Value> {
            Some(json!({
                "type": "object",
                "properties": {"op": {"type": "string", "enum": ["run"]}},
                "required": ["op"],
            }))
        }

        async fn execute(
            &self,
            _params: Value,
            _context: &ExecuteContext,
            _host: &Host,
        ) -> anyhow::Result<PluginResult> {
            Ok(PluginResult::ok(json!({})))
        }
    }

    fn write_manifest(dir: &Path, name: &str) {
        let plugin_dir = dir.join(name);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join("manifest.json"),
            json!({"name": name, "version": "1.0.0", "entry": name}).to_string(),
        )
        .unwrap();
    }

    fn registry_with_demo(dir: &Path) -> PluginRegistry {
        write_manifest(dir, "demo");
        let mut loader = PluginLoader::new(dir);
        loader.register_factory("demo", || Ok(Arc::new(DemoPlugin)));
        PluginRegistry::new(loader)
    }

    #[tokio::test]
    async fn sync_creates_disabled_rows_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with_demo(tmp.path());
        let store = MemoryDefinitionStore::default();

        let first = registry.sync(&store).await.unwrap();
        assert_eq!(first.created, 1);
        assert_eq!(first.discovered, 1);

        let row = store.get_definition("demo").await.unwrap().unwrap();
        assert!(!row.enabled);
        assert!(row.input_schema.is_some());

        let second = registry.sync(&store).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.purged, 0);
    }

    #[tokio::test]
    async fn sync_purges_rows_without_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with_demo(tmp.path());
        let store = MemoryDefinitionStore::default();
        store
            .create_definition(PluginDefinition {
                name: "ghost".to_string(),
                version: "0".to_string(),
                enabled: true,
                input_schema: None,
                output_schema: None,
                limits: None,
            })
            .await
            .unwrap();

        let report = registry.sync(&store).await.unwrap();
        assert_eq!(report.purged, 1);
        assert!(store.get_definition("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_honors_runtime_enable_toggles() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with_demo(tmp.path());
        let store = MemoryDefinitionStore::default();
        registry.sync(&store).await.unwrap();

        // Disabled by default
        assert!(registry.resolve("demo", &store).await.unwrap().is_none());

        store.set_enabled("demo", true);
        let plugin = registry.resolve("demo", &store).await.unwrap();
        assert!(plugin.is_some());

        // Disable evicts the cached instance
        store.set_enabled("demo", false);
        assert!(registry.resolve("demo", &store).await.unwrap().is_none());

        // Re-enable resolves again
        store.set_enabled("demo", true);
        assert!(registry.resolve("demo", &store).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn resolve_unknown_plugin_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with_demo(tmp.path());
        let store = MemoryDefinitionStore::default();
        assert!(registry.resolve("nope", &store).await.unwrap().is_none());
    }
}

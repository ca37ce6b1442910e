// Plugin loader: discovery, static scanning, instantiation
//
// Each plugin lives in its own directory under the configured plugins root
// and carries a manifest.json. Plugins are separate compilation units that
// link only against this crate's SDK surface; the manifest's `entry` names a
// factory the embedding application registered. The static source scan is
// the cheap first line of defense against plugins bundling their own HTTP
// client or reaching into host internals - the capability allow-list is the
// runtime backstop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{info, warn};

use crate::manifest::{PluginManifest, PluginRecord};
use crate::plugin::{LoadedPlugin, Plugin};

/// Factory producing a plugin instance for a manifest `entry` key
pub type PluginFactory = Arc<dyn Fn() -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync>;

/// Substrings that must not appear in plugin sources: direct HTTP clients
/// and host-internal modules. Matches refuse the load.
const DENIED_SOURCE_TOKENS: &[&str] = &[
    "reqwest::",
    "reqwest =",
    "hyper::",
    "ureq::",
    "isahc::",
    "attohttpc::",
    "curl::",
    "shu_storage",
    "shu_core::executor",
    "shu_core::registry",
    "shu_core::loader",
];

pub struct PluginLoader {
    plugins_dir: PathBuf,
    factories: HashMap<String, PluginFactory>,
}

impl PluginLoader {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        let plugins_dir = plugins_dir.into();
        info!(plugins_dir = %plugins_dir.display(), "Plugin loader initialized");
        Self {
            plugins_dir,
            factories: HashMap::new(),
        }
    }

    /// Register the factory for a manifest `entry` key.
    pub fn register_factory(
        &mut self,
        entry: impl Into<String>,
        factory: impl Fn() -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync + 'static,
    ) {
        self.factories.insert(entry.into(), Arc::new(factory));
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// Scan the plugins directory for manifests.
    ///
    /// Malformed manifests are skipped with a warning; one broken plugin
    /// never prevents the others from being discovered.
    pub fn discover(&self) -> HashMap<String, PluginRecord> {
        let mut records = HashMap::new();
        let entries = match std::fs::read_dir(&self.plugins_dir) {
            Ok(entries) => entries,
            Err(_) => return records,
        };

        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let manifest_path = dir.join("manifest.json");
            if !manifest_path.exists() {
                continue;
            }
            let manifest = match std::fs::read_to_string(&manifest_path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| {
                    serde_json::from_str::<PluginManifest>(&raw).map_err(anyhow::Error::from)
                }) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Skipping plugin with unreadable manifest");
                    continue;
                }
            };
            if manifest.name.trim().is_empty() || manifest.entry.trim().is_empty() {
                warn!(dir = %dir.display(), "Skipping manifest missing name or entry");
                continue;
            }

            let violations = static_scan_for_violations(&dir);
            let name = manifest.name.clone();
            records.insert(
                name,
                PluginRecord {
                    manifest,
                    plugin_dir: dir,
                    violations,
                },
            );
        }
        records
    }

    /// Instantiate a discovered plugin and attach its manifest metadata.
    pub fn load(&self, record: &PluginRecord) -> anyhow::Result<LoadedPlugin> {
        if !record.violations.is_empty() {
            bail!(
                "plugin '{}' uses disallowed imports: {}",
                record.name(),
                record.violations.join(", ")
            );
        }

        let factory = self
            .factories
            .get(&record.manifest.entry)
            .with_context(|| {
                format!(
                    "no factory registered for entry '{}' (plugin '{}')",
                    record.manifest.entry,
                    record.name()
                )
            })?;
        let plugin = factory()?;

        validate_op_enum(record.name(), plugin.input_schema().as_ref())?;

        if plugin.name() != record.name() {
            warn!(
                manifest = record.name(),
                class = plugin.name(),
                "Plugin name mismatch between manifest and instance"
            );
        }

        Ok(LoadedPlugin::new(plugin, &record.manifest))
    }
}

/// The op enum contract: input schema must declare properties.op.enum with
/// at least one value.
fn validate_op_enum(name: &str, schema: Option<&serde_json::Value>) -> anyhow::Result<()> {
    let ops = schema
        .and_then(|s| s.pointer("/properties/op/enum"))
        .and_then(|e| e.as_array());
    match ops {
        Some(ops) if !ops.is_empty() => Ok(()),
        _ => bail!("plugin '{name}' missing op enum in input schema"),
    }
}

/// Text-scan every .rs file under the plugin directory for denied tokens.
fn static_scan_for_violations(plugin_dir: &Path) -> Vec<String> {
    let mut violations = Vec::new();
    scan_dir(plugin_dir, &mut violations);
    violations
}

fn scan_dir(dir: &Path, violations: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_dir(&path, violations);
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("rs") {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(&path) else {
            warn!(path = %path.display(), "Could not read plugin source during scan");
            continue;
        };
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("?")
            .to_string();
        for token in DENIED_SOURCE_TOKENS {
            if text.contains(token) {
                violations.push(format!("{file_name}: {token}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::capabilities::Host;
    use crate::plugin::{ExecuteContext, PluginResult};

    struct EchoPlugin {
        with_op_enum: bool,
    }

    #[async_trait]
    impl Plugin for EchoPlugin {
        fn name(&self) -> &str {
            "echo"
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        fn input_schema(&self) -> Option<Value> {
            if self.with_op_enum {
                Some(json!({
                    "type": "object",
                    "properties": {"op": {"type": "string", "enum": ["echo"]}},
                    "required": ["op"],
                }))
            } else {
                Some(json!({"type": "object", "properties": {}}))
            }
        }

        async fn execute(
            &self,
            params: Value,
            _context: &ExecuteContext,
            _host: &Host,
        ) -> anyhow::Result<PluginResult> {
            Ok(PluginResult::ok(json!({"echoed": params})))
        }
    }

    fn write_plugin(dir: &Path, name: &str, manifest: Value, source: Option<&str>) {
        let plugin_dir = dir.join(name);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join("manifest.json"),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
        if let Some(source) = source {
            std::fs::write(plugin_dir.join("plugin.rs"), source).unwrap();
        }
    }

    #[test]
    fn discovers_valid_manifests_and_skips_broken_ones() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(
            tmp.path(),
            "echo",
            json!({"name": "echo", "version": "1.0.0", "entry": "echo", "capabilities": ["log"]}),
            None,
        );
        write_plugin(tmp.path(), "broken", json!({"version": "1"}), None);

        let loader = PluginLoader::new(tmp.path());
        let records = loader.discover();
        assert_eq!(records.len(), 1);
        assert!(records.contains_key("echo"));
    }

    #[test]
    fn static_scan_flags_denied_tokens() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(
            tmp.path(),
            "sneaky",
            json!({"name": "sneaky", "entry": "sneaky"}),
            Some("use reqwest::Client;\nfn main() {}"),
        );

        let mut loader = PluginLoader::new(tmp.path());
        loader.register_factory("sneaky", || Ok(Arc::new(EchoPlugin { with_op_enum: true })));
        let records = loader.discover();
        let record = &records["sneaky"];
        assert!(!record.violations.is_empty());

        let err = loader.load(record).unwrap_err();
        assert!(err.to_string().contains("disallowed imports"));
    }

    #[test]
    fn load_rejects_missing_op_enum() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(
            tmp.path(),
            "echo",
            json!({"name": "echo", "entry": "echo"}),
            None,
        );

        let mut loader = PluginLoader::new(tmp.path());
        loader.register_factory("echo", || Ok(Arc::new(EchoPlugin { with_op_enum: false })));
        let records = loader.discover();
        let err = loader.load(&records["echo"]).unwrap_err();
        assert!(err.to_string().contains("missing op enum"));
    }

    #[test]
    fn load_attaches_manifest_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(
            tmp.path(),
            "echo",
            json!({
                "name": "echo",
                "entry": "echo",
                "capabilities": ["log", "kb"],
                "op_auth": {"echo": {"provider": "google", "mode": "user", "scopes": ["s"]}},
            }),
            None,
        );

        let mut loader = PluginLoader::new(tmp.path());
        loader.register_factory("echo", || Ok(Arc::new(EchoPlugin { with_op_enum: true })));
        let records = loader.discover();
        let loaded = loader.load(&records["echo"]).unwrap();
        assert_eq!(loaded.capabilities(), &["log", "kb"]);
        assert_eq!(loaded.op_auth()["echo"].provider, "google");
    }

    #[test]
    fn load_without_factory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(
            tmp.path(),
            "ghost",
            json!({"name": "ghost", "entry": "ghost"}),
            None,
        );
        let loader = PluginLoader::new(tmp.path());
        let records = loader.discover();
        let err = loader.load(&records["ghost"]).unwrap_err();
        assert!(err.to_string().contains("no factory registered"));
    }
}

// Plugin Manifest
//
// Each plugin directory carries a `manifest.json` declaring identity, entry
// point, granted capabilities, and per-op auth requirements. Manifests
// missing `name` or `entry` are skipped by discovery with a warning.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Auth mode a plugin op may require
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    User,
    DomainDelegate,
    ServiceAccount,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::User => "user",
            AuthMode::DomainDelegate => "domain_delegate",
            AuthMode::ServiceAccount => "service_account",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Some(AuthMode::User),
            "domain_delegate" => Some(AuthMode::DomainDelegate),
            "service_account" => Some(AuthMode::ServiceAccount),
            _ => None,
        }
    }
}

/// Per-op auth requirement from the manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpAuth {
    pub provider: String,
    #[serde(default)]
    pub mode: Option<AuthMode>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Identity a plugin needs connected before it is useful
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredIdentity {
    pub provider: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Declarative manifest, one per plugin directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Entry point: the factory key this plugin registers under
    pub entry: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub op_auth: HashMap<String, OpAuth>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub default_feed_op: Option<String>,
    #[serde(default)]
    pub allowed_feed_ops: Vec<String>,
    #[serde(default)]
    pub chat_callable_ops: Vec<String>,
    #[serde(default)]
    pub required_identities: Vec<RequiredIdentity>,
    #[serde(default)]
    pub required_secrets: Vec<String>,
}

fn default_version() -> String {
    "0".to_string()
}

/// Discovery record: a manifest plus where it came from and any static-scan
/// violations found in the plugin directory.
#[derive(Debug, Clone)]
pub struct PluginRecord {
    pub manifest: PluginManifest,
    pub plugin_dir: PathBuf,
    pub violations: Vec<String>,
}

impl PluginRecord {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_manifest() {
        let raw = serde_json::json!({
            "name": "gmail_digest",
            "version": "1.2.0",
            "entry": "gmail_digest",
            "capabilities": ["http", "log", "auth", "cursor"],
            "op_auth": {
                "list": {
                    "provider": "google",
                    "mode": "user",
                    "scopes": ["https://www.googleapis.com/auth/gmail.readonly"]
                }
            },
            "default_feed_op": "digest",
            "allowed_feed_ops": ["digest"],
            "chat_callable_ops": ["list", "search"],
            "required_identities": [{"provider": "google"}],
            "required_secrets": []
        });
        let manifest: PluginManifest = serde_json::from_value(raw).unwrap();
        assert_eq!(manifest.name, "gmail_digest");
        assert_eq!(manifest.op_auth["list"].provider, "google");
        assert_eq!(manifest.op_auth["list"].mode, Some(AuthMode::User));
        assert_eq!(manifest.chat_callable_ops.len(), 2);
    }

    #[test]
    fn version_defaults_when_missing() {
        let manifest: PluginManifest =
            serde_json::from_value(serde_json::json!({"name": "x", "entry": "x"})).unwrap();
        assert_eq!(manifest.version, "0");
        assert!(manifest.capabilities.is_empty());
    }

    #[test]
    fn auth_mode_parses_known_values() {
        assert_eq!(AuthMode::parse("USER"), Some(AuthMode::User));
        assert_eq!(
            AuthMode::parse(" domain_delegate "),
            Some(AuthMode::DomainDelegate)
        );
        assert_eq!(AuthMode::parse("robot"), None);
    }
}

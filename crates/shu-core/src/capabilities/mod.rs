// Host Capability Layer
//
// The only surface plugins may use to reach outside their compilation unit.
// Every capability is an object exposed on the Host value; accessing a
// capability the plugin's manifest did not grant returns CapabilityDenied.
//
// Design decisions:
// - The capability set is closed; unknown names in a manifest are ignored
// - Scoping fields (plugin_name, user_id, KB bindings, schedule id, OCR
//   mode) are private and set only at construction - there is no setter
//   surface, so a plugin cannot widen its own scope after handoff
// - Capability objects for ungranted names are never constructed, so denial
//   has no side effects

pub mod auth;
pub mod cache;
pub mod cursor;
pub mod http;
pub mod identity;
pub mod kb;
pub mod log;
pub mod ocr;
pub mod secrets;
pub mod storage;
pub mod utils;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::traits::{
    CursorStore, KbAccess, KbSearchService, ObjectStore, ProviderIdentity, SecretStore,
    TextExtractor, TokenBroker,
};

pub use auth::AuthCapability;
pub use cache::CacheCapability;
pub use cursor::CursorCapability;
pub use http::{HttpCapability, HttpErrorCategory, HttpRequest, HttpRequestFailed, HttpResponse, RetryPolicy};
pub use identity::IdentityCapability;
pub use kb::KbCapability;
pub use log::LogCapability;
pub use ocr::OcrCapability;
pub use secrets::SecretsCapability;
pub use storage::StorageCapability;
pub use utils::UtilsCapability;

// ============================================================================
// Capability names (the closed set)
// ============================================================================

pub mod capability_id {
    pub const HTTP: &str = "http";
    pub const LOG: &str = "log";
    pub const SECRETS: &str = "secrets";
    pub const AUTH: &str = "auth";
    pub const CACHE: &str = "cache";
    pub const CURSOR: &str = "cursor";
    pub const KB: &str = "kb";
    pub const STORAGE: &str = "storage";
    pub const OCR: &str = "ocr";
    pub const IDENTITY: &str = "identity";
    pub const UTILS: &str = "utils";

    pub const ALL: &[&str] = &[
        HTTP, LOG, SECRETS, AUTH, CACHE, CURSOR, KB, STORAGE, OCR, IDENTITY, UTILS,
    ];
}

/// Raised when a plugin touches a capability its manifest did not grant.
/// Propagates through the plugin's anyhow error channel; the executor maps
/// it to a plugin_execute_error result.
#[derive(Debug, Clone, Error)]
#[error("capability '{capability}' not granted")]
pub struct CapabilityDenied {
    pub capability: String,
}

impl CapabilityDenied {
    fn new(capability: &str) -> Self {
        Self {
            capability: capability.to_string(),
        }
    }
}

// ============================================================================
// Host context (the parsed __host overlay)
// ============================================================================

/// Auth instructions for one provider, from `auth.<provider>` in the overlay
#[derive(Debug, Clone, Default)]
pub struct AuthSection {
    pub mode: Option<String>,
    pub subject: Option<String>,
    pub scopes: Vec<String>,
}

/// Parsed execution context with the reserved sections the host understands.
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    pub auth: HashMap<String, AuthSection>,
    pub schedule_id: Option<String>,
    pub knowledge_base_ids: Vec<String>,
    pub ocr_mode: Option<String>,
}

impl HostContext {
    /// Parse the reserved sections out of a host overlay value.
    ///
    /// KB IDs that are not strings, or are empty strings, are dropped.
    pub fn parse(overlay: &Value) -> Self {
        let mut ctx = HostContext::default();

        if let Some(auth) = overlay.get("auth").and_then(Value::as_object) {
            for (provider, section) in auth {
                let mut parsed = AuthSection::default();
                if let Some(section) = section.as_object() {
                    parsed.mode = section
                        .get("mode")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    parsed.subject = section
                        .get("subject")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    if let Some(scopes) = section.get("scopes").and_then(Value::as_array) {
                        parsed.scopes = scopes
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect();
                    }
                }
                ctx.auth.insert(provider.to_ascii_lowercase(), parsed);
            }
        }

        ctx.schedule_id = overlay
            .pointer("/exec/schedule_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(ids) = overlay
            .pointer("/kb/knowledge_base_ids")
            .and_then(Value::as_array)
        {
            ctx.knowledge_base_ids = ids
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .collect();
        }

        ctx.ocr_mode = overlay
            .pointer("/ocr/mode")
            .and_then(Value::as_str)
            .map(str::to_string);

        ctx
    }
}

// ============================================================================
// HostServices - backends shared by all hosts in a process
// ============================================================================

/// Long-lived backends injected from the composition root. One instance is
/// shared by every Host the executor builds.
#[derive(Clone)]
pub struct HostServices {
    pub secret_store: Arc<dyn SecretStore>,
    pub cursor_store: Arc<dyn CursorStore>,
    pub object_store: Arc<dyn ObjectStore>,
    pub kb_search: Arc<dyn KbSearchService>,
    pub kb_access: Arc<dyn KbAccess>,
    pub text_extractor: Arc<dyn TextExtractor>,
    pub token_broker: Arc<dyn TokenBroker>,
    pub http_retry: RetryPolicy,
}

// ============================================================================
// Host - the per-call capability surface
// ============================================================================

/// Sandboxed surface handed to exactly one plugin call.
///
/// Capabilities not in the allow-list are never constructed; their accessors
/// return CapabilityDenied.
pub struct Host {
    plugin_name: String,
    http: Option<HttpCapability>,
    log: Option<LogCapability>,
    secrets: Option<SecretsCapability>,
    auth: Option<AuthCapability>,
    cache: Option<CacheCapability>,
    cursor: Option<CursorCapability>,
    kb: Option<KbCapability>,
    storage: Option<StorageCapability>,
    ocr: Option<OcrCapability>,
    identity: Option<IdentityCapability>,
    utils: Option<UtilsCapability>,
}

/// Build a host for one plugin call.
#[allow(clippy::too_many_arguments)]
pub fn make_host(
    services: &HostServices,
    plugin_name: &str,
    user_id: &str,
    user_email: Option<&str>,
    capabilities: &[String],
    provider_identities: HashMap<String, Vec<ProviderIdentity>>,
    context: HostContext,
) -> Host {
    let granted: HashSet<&str> = capabilities.iter().map(String::as_str).collect();
    let has = |name: &str| granted.contains(name);

    Host {
        plugin_name: plugin_name.to_string(),
        http: has(capability_id::HTTP)
            .then(|| HttpCapability::new(plugin_name, services.http_retry.clone())),
        log: has(capability_id::LOG).then(|| LogCapability::new(plugin_name, user_id)),
        secrets: has(capability_id::SECRETS).then(|| {
            SecretsCapability::new(services.secret_store.clone(), plugin_name, user_id)
        }),
        auth: has(capability_id::AUTH).then(|| {
            AuthCapability::new(
                services.token_broker.clone(),
                plugin_name,
                user_id,
                provider_identities,
                context.auth.clone(),
            )
        }),
        cache: has(capability_id::CACHE).then(|| CacheCapability::new(plugin_name)),
        cursor: has(capability_id::CURSOR).then(|| {
            CursorCapability::new(
                services.cursor_store.clone(),
                plugin_name,
                context.schedule_id.clone(),
            )
        }),
        kb: has(capability_id::KB).then(|| {
            KbCapability::new(
                services.kb_search.clone(),
                services.kb_access.clone(),
                user_id,
                context.knowledge_base_ids.clone(),
            )
        }),
        storage: has(capability_id::STORAGE)
            .then(|| StorageCapability::new(services.object_store.clone(), plugin_name)),
        ocr: has(capability_id::OCR).then(|| {
            OcrCapability::new(services.text_extractor.clone(), context.ocr_mode.clone())
        }),
        identity: has(capability_id::IDENTITY)
            .then(|| IdentityCapability::new(user_id, user_email)),
        utils: has(capability_id::UTILS).then(UtilsCapability::new),
    }
}

macro_rules! capability_accessor {
    ($fn_name:ident, $field:ident, $ty:ty, $id:expr) => {
        pub fn $fn_name(&self) -> std::result::Result<&$ty, CapabilityDenied> {
            self.$field.as_ref().ok_or_else(|| CapabilityDenied::new($id))
        }
    };
}

impl Host {
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    capability_accessor!(http, http, HttpCapability, capability_id::HTTP);
    capability_accessor!(log, log, LogCapability, capability_id::LOG);
    capability_accessor!(secrets, secrets, SecretsCapability, capability_id::SECRETS);
    capability_accessor!(auth, auth, AuthCapability, capability_id::AUTH);
    capability_accessor!(cache, cache, CacheCapability, capability_id::CACHE);
    capability_accessor!(cursor, cursor, CursorCapability, capability_id::CURSOR);
    capability_accessor!(kb, kb, KbCapability, capability_id::KB);
    capability_accessor!(storage, storage, StorageCapability, capability_id::STORAGE);
    capability_accessor!(ocr, ocr, OcrCapability, capability_id::OCR);
    capability_accessor!(identity, identity, IdentityCapability, capability_id::IDENTITY);
    capability_accessor!(utils, utils, UtilsCapability, capability_id::UTILS);
}

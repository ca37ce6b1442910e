// Core traits for pluggable backends
//
// The executor, registry, host capabilities, and feed runner consume storage
// and external services exclusively through these traits:
// - In-memory implementations (crate::memory) for examples and testing
// - sqlx implementations in shu-storage for production
//
// Entities defined here are the runtime view; storage rows may carry extra
// bookkeeping columns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::limits::PluginLimits;

// ============================================================================
// Entities
// ============================================================================

/// Persisted registry row: authoritative for enablement and published schemas
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDefinition {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub limits: Option<PluginLimits>,
}

/// A persisted scheduled plugin invocation
#[derive(Debug, Clone)]
pub struct PluginFeed {
    pub id: Uuid,
    pub user_id: String,
    pub plugin_name: String,
    pub params: Value,
    pub schedule: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Lifecycle state of an execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ExecutionStatus::Pending),
            "RUNNING" => Some(ExecutionStatus::Running),
            "COMPLETED" => Some(ExecutionStatus::Completed),
            "FAILED" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// A single run record
#[derive(Debug, Clone)]
pub struct PluginExecution {
    pub id: Uuid,
    pub user_id: String,
    pub schedule_id: Option<Uuid>,
    pub plugin_name: String,
    pub agent_key: Option<String>,
    pub params: Value,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields applied to an execution record when a run finishes
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Per-user stored credential for a third-party provider
#[derive(Debug, Clone)]
pub struct ProviderIdentity {
    pub user_id: String,
    pub provider_key: String,
    pub subject: String,
    pub scopes: Vec<String>,
    /// Opaque token material (decrypted by the identity store)
    pub token_material: Value,
}

// ============================================================================
// DefinitionStore - plugin_definitions table
// ============================================================================

#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn get_definition(&self, name: &str) -> Result<Option<PluginDefinition>>;

    async fn list_definitions(&self) -> Result<Vec<PluginDefinition>>;

    /// Insert a row if missing (enabled=false). Returns true when created.
    async fn create_definition(&self, definition: PluginDefinition) -> Result<bool>;

    /// Refresh published schemas. Returns true when anything changed.
    async fn update_schemas(
        &self,
        name: &str,
        input_schema: Option<Value>,
        output_schema: Option<Value>,
    ) -> Result<bool>;

    async fn delete_definition(&self, name: &str) -> Result<bool>;

    /// Enablement check used on every resolve
    async fn is_enabled(&self, name: &str) -> Result<bool> {
        Ok(self
            .get_definition(name)
            .await?
            .map(|d| d.enabled)
            .unwrap_or(false))
    }
}

// ============================================================================
// FeedStore / ExecutionStore - scheduled invocations
// ============================================================================

#[async_trait]
pub trait FeedStore: Send + Sync {
    async fn get_feed(&self, id: Uuid) -> Result<Option<PluginFeed>>;

    async fn set_feed_enabled(&self, id: Uuid, enabled: bool) -> Result<()>;

    /// Applied atomically with a COMPLETED run: bump last_run_at and, when
    /// `params` is Some, replace the stored params (one-shot clearing).
    async fn apply_feed_run(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        params: Option<Value>,
    ) -> Result<()>;

    /// Feeds whose schedule is due at `now`
    async fn list_due_feeds(&self, now: DateTime<Utc>) -> Result<Vec<PluginFeed>>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, execution: PluginExecution) -> Result<PluginExecution>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<PluginExecution>>;

    /// Atomic claim: PENDING -> RUNNING. Exactly one concurrent caller wins;
    /// losers get None.
    async fn claim_pending(&self, id: Uuid) -> Result<Option<PluginExecution>>;

    /// Oldest PENDING rows, for the scheduler/worker pull loop
    async fn list_pending(&self, limit: usize) -> Result<Vec<PluginExecution>>;

    /// True when the feed already has a PENDING or RUNNING execution
    async fn has_active_execution(&self, schedule_id: Uuid) -> Result<bool>;

    async fn apply_outcome(&self, id: Uuid, outcome: &ExecutionOutcome) -> Result<()>;
}

// ============================================================================
// ProviderIdentityStore - stored third-party credentials
// ============================================================================

#[async_trait]
pub trait ProviderIdentityStore: Send + Sync {
    async fn identities_for_user(&self, user_id: &str) -> Result<Vec<ProviderIdentity>>;
}

// ============================================================================
// Host capability backends
// ============================================================================

/// Plugin-scoped (optionally user-scoped) secret lookup
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(
        &self,
        plugin_name: &str,
        user_id: Option<&str>,
        key: &str,
    ) -> Result<Option<String>>;

    async fn has_secret(&self, plugin_name: &str, user_id: Option<&str>, key: &str) -> Result<bool> {
        Ok(self.get_secret(plugin_name, user_id, key).await?.is_some())
    }
}

/// Opaque per-feed cursor storage
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get_cursor(&self, plugin_name: &str, scope_key: &str) -> Result<Option<Value>>;
    async fn set_cursor(&self, plugin_name: &str, scope_key: &str, value: Value) -> Result<()>;
    async fn delete_cursor(&self, plugin_name: &str, scope_key: &str) -> Result<()>;
}

/// Per-plugin object-store namespace
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, plugin_name: &str, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get_object(&self, plugin_name: &str, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_object(&self, plugin_name: &str, key: &str) -> Result<bool>;
    async fn list_objects(&self, plugin_name: &str, prefix: &str) -> Result<Vec<String>>;
}

/// Opaque "extract text from blob" capability
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, bytes: &[u8], mime_type: &str, mode: Option<&str>)
        -> Result<String>;
}

// ============================================================================
// Auth backends
// ============================================================================

/// A minted bearer token with its resolved subject
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub subject: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Delegation readiness for a subject + scope set
#[derive(Debug, Clone)]
pub struct DelegationStatus {
    pub ready: bool,
    pub reason: Option<String>,
}

/// Mints provider tokens from stored identities / service accounts.
/// OAuth transport lives behind this seam.
#[async_trait]
pub trait TokenBroker: Send + Sync {
    async fn user_token(
        &self,
        user_id: &str,
        provider: &str,
        scopes: &[String],
    ) -> Result<Option<TokenGrant>>;

    async fn delegation_check(
        &self,
        provider: &str,
        scopes: &[String],
        subject: &str,
    ) -> Result<DelegationStatus>;

    async fn service_account_token(
        &self,
        provider: &str,
        scopes: &[String],
        subject: Option<&str>,
    ) -> Result<TokenGrant>;
}

/// User-level gate restricting which plugins may use a provider in `user`
/// auth mode. `None` means the user has no subscriptions and no gate applies.
#[async_trait]
pub trait SubscriptionGate: Send + Sync {
    async fn subscribed_plugins(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<Vec<String>>>;
}

// ============================================================================
// KB search backends
// ============================================================================

/// RBAC decision for a bound KB set
#[derive(Debug, Clone, PartialEq)]
pub enum KbAccessDecision {
    Granted,
    Denied { knowledge_base_id: String },
    UserNotFound,
}

#[async_trait]
pub trait KbAccess: Send + Sync {
    /// Verify the user can read every KB in the bound set
    async fn check_read_access(&self, user_id: &str, kb_ids: &[String])
        -> Result<KbAccessDecision>;
}

/// A chunk search hit. Deliberately excludes content and embeddings.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChunkHit {
    pub id: String,
    pub document_id: String,
    pub knowledge_base_id: String,
    pub title: Option<String>,
    pub metadata: Value,
}

/// A document search hit. Deliberately excludes content.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DocumentHit {
    pub id: String,
    pub knowledge_base_id: String,
    pub title: Option<String>,
    pub source_uri: Option<String>,
    pub metadata: Value,
}

/// A fully loaded document; the only shape that carries content.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KbDocument {
    pub id: String,
    pub knowledge_base_id: String,
    pub title: Option<String>,
    pub source_uri: Option<String>,
    pub content: String,
    pub metadata: Value,
}

/// One page of search results
#[derive(Debug, Clone)]
pub struct KbPage<T> {
    pub results: Vec<T>,
    pub total_results: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Search service seam. Every query the implementation runs must include a
/// `knowledge_base_id IN (...)` filter built from `kb_ids`.
#[async_trait]
pub trait KbSearchService: Send + Sync {
    async fn search_chunks(
        &self,
        kb_ids: &[String],
        field: &str,
        operator: &str,
        value: &Value,
        page: u32,
        page_size: u32,
    ) -> Result<KbPage<ChunkHit>>;

    async fn search_documents(
        &self,
        kb_ids: &[String],
        field: &str,
        operator: &str,
        value: &Value,
        page: u32,
        page_size: u32,
    ) -> Result<KbPage<DocumentHit>>;

    async fn get_document(&self, kb_ids: &[String], document_id: &str)
        -> Result<Option<KbDocument>>;

    /// Ingest a document into a bound KB (used by feed plugins like Drive sync)
    async fn upsert_document(&self, kb_id: &str, document: KbDocument) -> Result<()>;
}

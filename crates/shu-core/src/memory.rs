// In-memory implementations of the backend traits
//
// Used by tests and examples; production backends live in shu-storage.
// Atomicity here means "under one mutex", which is exactly the guarantee
// the trait asks the backing store for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::capabilities::{HostServices, RetryPolicy};
use crate::counters::{BucketDecision, CounterStore};
use crate::error::{CoreError, Result};
use crate::orchestrator::EventSink;
use crate::provider::ProviderStreamEvent;
use crate::traits::{
    ChunkHit, CursorStore, DefinitionStore, DelegationStatus, DocumentHit, ExecutionOutcome,
    ExecutionStatus, ExecutionStore, FeedStore, KbAccess, KbAccessDecision, KbDocument, KbPage,
    KbSearchService, ObjectStore, PluginDefinition, PluginExecution, PluginFeed, ProviderIdentity,
    ProviderIdentityStore, SecretStore, TextExtractor, TokenBroker, TokenGrant,
};

// ============================================================================
// MemoryCounterStore
// ============================================================================

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, (i64, Option<Instant>)>>,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get_counter(&self, key: &str) -> Result<Option<i64>> {
        let mut counters = self.counters.lock().unwrap();
        match counters.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                counters.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(*value)),
            None => Ok(None),
        }
    }

    async fn set_counter(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        self.counters
            .lock()
            .unwrap()
            .insert(key.to_string(), (value, Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(key.to_string()).or_insert((0, None));
        entry.0 += 1;
        entry.1 = Some(Instant::now() + ttl);
        Ok(entry.0)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(key.to_string()).or_insert((0, None));
        entry.0 -= 1;
        Ok(entry.0)
    }

    async fn take_tokens(
        &self,
        key: &str,
        capacity: u64,
        refill_per_second: u64,
        cost: u64,
    ) -> Result<BucketDecision> {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        let state = buckets.entry(key.to_string()).or_insert(BucketState {
            tokens: capacity as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * refill_per_second as f64).min(capacity as f64);
        state.last_refill = now;

        if state.tokens >= cost as f64 {
            state.tokens -= cost as f64;
            Ok(BucketDecision {
                allowed: true,
                remaining: state.tokens as u64,
                retry_after_seconds: 0,
            })
        } else {
            let deficit = cost as f64 - state.tokens;
            let retry = (deficit / refill_per_second.max(1) as f64).ceil() as u64;
            Ok(BucketDecision {
                allowed: false,
                remaining: 0,
                retry_after_seconds: retry.max(1),
            })
        }
    }
}

// ============================================================================
// MemoryDefinitionStore
// ============================================================================

#[derive(Default)]
pub struct MemoryDefinitionStore {
    rows: Mutex<HashMap<String, PluginDefinition>>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: flip the enabled flag directly.
    pub fn set_enabled(&self, name: &str, enabled: bool) {
        if let Some(row) = self.rows.lock().unwrap().get_mut(name) {
            row.enabled = enabled;
        }
    }

    /// Test helper: set per-plugin limits.
    pub fn set_limits(&self, name: &str, limits: crate::limits::PluginLimits) {
        if let Some(row) = self.rows.lock().unwrap().get_mut(name) {
            row.limits = Some(limits);
        }
    }
}

#[async_trait]
impl DefinitionStore for MemoryDefinitionStore {
    async fn get_definition(&self, name: &str) -> Result<Option<PluginDefinition>> {
        Ok(self.rows.lock().unwrap().get(name).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<PluginDefinition>> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    async fn create_definition(&self, definition: PluginDefinition) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&definition.name) {
            return Ok(false);
        }
        rows.insert(definition.name.clone(), definition);
        Ok(true)
    }

    async fn update_schemas(
        &self,
        name: &str,
        input_schema: Option<Value>,
        output_schema: Option<Value>,
    ) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(name) else {
            return Ok(false);
        };
        let mut changed = false;
        if input_schema.is_some() && row.input_schema != input_schema {
            row.input_schema = input_schema;
            changed = true;
        }
        if output_schema.is_some() && row.output_schema != output_schema {
            row.output_schema = output_schema;
            changed = true;
        }
        Ok(changed)
    }

    async fn delete_definition(&self, name: &str) -> Result<bool> {
        Ok(self.rows.lock().unwrap().remove(name).is_some())
    }
}

// ============================================================================
// MemoryFeedStore / MemoryExecutionStore
// ============================================================================

#[derive(Default)]
pub struct MemoryFeedStore {
    feeds: Mutex<HashMap<Uuid, PluginFeed>>,
}

impl MemoryFeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, feed: PluginFeed) {
        self.feeds.lock().unwrap().insert(feed.id, feed);
    }
}

#[async_trait]
impl FeedStore for MemoryFeedStore {
    async fn get_feed(&self, id: Uuid) -> Result<Option<PluginFeed>> {
        Ok(self.feeds.lock().unwrap().get(&id).cloned())
    }

    async fn set_feed_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        if let Some(feed) = self.feeds.lock().unwrap().get_mut(&id) {
            feed.enabled = enabled;
        }
        Ok(())
    }

    async fn apply_feed_run(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        params: Option<Value>,
    ) -> Result<()> {
        if let Some(feed) = self.feeds.lock().unwrap().get_mut(&id) {
            feed.last_run_at = Some(last_run_at);
            if let Some(params) = params {
                feed.params = params;
            }
        }
        Ok(())
    }

    async fn list_due_feeds(&self, _now: DateTime<Utc>) -> Result<Vec<PluginFeed>> {
        Ok(self
            .feeds
            .lock()
            .unwrap()
            .values()
            .filter(|f| f.enabled)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: Mutex<HashMap<Uuid, PluginExecution>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create_execution(&self, execution: PluginExecution) -> Result<PluginExecution> {
        self.executions
            .lock()
            .unwrap()
            .insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<PluginExecution>> {
        Ok(self.executions.lock().unwrap().get(&id).cloned())
    }

    async fn claim_pending(&self, id: Uuid) -> Result<Option<PluginExecution>> {
        let mut executions = self.executions.lock().unwrap();
        match executions.get_mut(&id) {
            Some(execution) if execution.status == ExecutionStatus::Pending => {
                execution.status = ExecutionStatus::Running;
                Ok(Some(execution.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<PluginExecution>> {
        let executions = self.executions.lock().unwrap();
        let mut pending: Vec<_> = executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn has_active_execution(&self, schedule_id: Uuid) -> Result<bool> {
        Ok(self.executions.lock().unwrap().values().any(|e| {
            e.schedule_id == Some(schedule_id)
                && matches!(e.status, ExecutionStatus::Pending | ExecutionStatus::Running)
        }))
    }

    async fn apply_outcome(&self, id: Uuid, outcome: &ExecutionOutcome) -> Result<()> {
        let mut executions = self.executions.lock().unwrap();
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| CoreError::store(format!("execution {id} not found")))?;
        execution.status = outcome.status;
        execution.result = outcome.result.clone();
        execution.error = outcome.error.clone();
        execution.completed_at = Some(outcome.completed_at);
        Ok(())
    }
}

// ============================================================================
// Identity / secret / cursor / object stores
// ============================================================================

#[derive(Default)]
pub struct MemoryProviderIdentityStore {
    identities: Mutex<Vec<ProviderIdentity>>,
}

impl MemoryProviderIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: ProviderIdentity) {
        self.identities.lock().unwrap().push(identity);
    }
}

#[async_trait]
impl ProviderIdentityStore for MemoryProviderIdentityStore {
    async fn identities_for_user(&self, user_id: &str) -> Result<Vec<ProviderIdentity>> {
        Ok(self
            .identities
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<(String, Option<String>, String), String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, plugin_name: &str, user_id: Option<&str>, key: &str, value: &str) {
        self.secrets.lock().unwrap().insert(
            (
                plugin_name.to_string(),
                user_id.map(str::to_string),
                key.to_string(),
            ),
            value.to_string(),
        );
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(
        &self,
        plugin_name: &str,
        user_id: Option<&str>,
        key: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&(
                plugin_name.to_string(),
                user_id.map(str::to_string),
                key.to_string(),
            ))
            .cloned())
    }
}

#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<(String, String), Value>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get_cursor(&self, plugin_name: &str, scope_key: &str) -> Result<Option<Value>> {
        Ok(self
            .cursors
            .lock()
            .unwrap()
            .get(&(plugin_name.to_string(), scope_key.to_string()))
            .cloned())
    }

    async fn set_cursor(&self, plugin_name: &str, scope_key: &str, value: Value) -> Result<()> {
        self.cursors
            .lock()
            .unwrap()
            .insert((plugin_name.to_string(), scope_key.to_string()), value);
        Ok(())
    }

    async fn delete_cursor(&self, plugin_name: &str, scope_key: &str) -> Result<()> {
        self.cursors
            .lock()
            .unwrap()
            .remove(&(plugin_name.to_string(), scope_key.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, plugin_name: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert((plugin_name.to_string(), key.to_string()), bytes);
        Ok(())
    }

    async fn get_object(&self, plugin_name: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&(plugin_name.to_string(), key.to_string()))
            .cloned())
    }

    async fn delete_object(&self, plugin_name: &str, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .remove(&(plugin_name.to_string(), key.to_string()))
            .is_some())
    }

    async fn list_objects(&self, plugin_name: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(p, k)| p == plugin_name && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }
}

// ============================================================================
// Text extraction / auth fakes
// ============================================================================

/// Lossy UTF-8 "extraction" - good enough for tests and text blobs
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract_text(
        &self,
        bytes: &[u8],
        _mime_type: &str,
        _mode: Option<&str>,
    ) -> Result<String> {
        Ok(String::from_utf8_lossy(bytes).to_string())
    }
}

/// Configurable token broker for tests.
#[derive(Default)]
pub struct StaticTokenBroker {
    user_tokens: Mutex<HashMap<(String, String), TokenGrant>>,
    pub delegation_ready: Mutex<bool>,
    pub service_account_available: Mutex<bool>,
}

impl StaticTokenBroker {
    pub fn new() -> Self {
        Self {
            user_tokens: Mutex::new(HashMap::new()),
            delegation_ready: Mutex::new(true),
            service_account_available: Mutex::new(true),
        }
    }

    pub fn grant_user_token(&self, user_id: &str, provider: &str, token: &str) {
        self.user_tokens.lock().unwrap().insert(
            (user_id.to_string(), provider.to_string()),
            TokenGrant {
                access_token: token.to_string(),
                subject: None,
                expires_at: None,
            },
        );
    }

    pub fn set_delegation_ready(&self, ready: bool) {
        *self.delegation_ready.lock().unwrap() = ready;
    }

    pub fn set_service_account_available(&self, available: bool) {
        *self.service_account_available.lock().unwrap() = available;
    }
}

#[async_trait]
impl TokenBroker for StaticTokenBroker {
    async fn user_token(
        &self,
        user_id: &str,
        provider: &str,
        _scopes: &[String],
    ) -> Result<Option<TokenGrant>> {
        Ok(self
            .user_tokens
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), provider.to_string()))
            .cloned())
    }

    async fn delegation_check(
        &self,
        _provider: &str,
        _scopes: &[String],
        _subject: &str,
    ) -> Result<DelegationStatus> {
        let ready = *self.delegation_ready.lock().unwrap();
        Ok(DelegationStatus {
            ready,
            reason: (!ready).then(|| "delegation not configured".to_string()),
        })
    }

    async fn service_account_token(
        &self,
        provider: &str,
        _scopes: &[String],
        subject: Option<&str>,
    ) -> Result<TokenGrant> {
        if !*self.service_account_available.lock().unwrap() {
            return Err(CoreError::config(format!(
                "no service account for provider '{provider}'"
            )));
        }
        Ok(TokenGrant {
            access_token: format!("sa-token-{provider}"),
            subject: subject.map(str::to_string),
            expires_at: None,
        })
    }
}

/// Subscription gate fake: no subscriptions by default (no gate applies).
#[derive(Default)]
pub struct StaticSubscriptionGate {
    subscriptions: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl StaticSubscriptionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user_id: &str, provider: &str, plugin_name: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .entry((user_id.to_string(), provider.to_string()))
            .or_default()
            .push(plugin_name.to_string());
    }
}

#[async_trait]
impl crate::traits::SubscriptionGate for StaticSubscriptionGate {
    async fn subscribed_plugins(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<Vec<String>>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), provider.to_string()))
            .cloned())
    }
}

/// KB access fake with a configurable decision.
pub struct StaticKbAccess {
    decision: Mutex<KbAccessDecision>,
}

impl Default for StaticKbAccess {
    fn default() -> Self {
        Self {
            decision: Mutex::new(KbAccessDecision::Granted),
        }
    }
}

impl StaticKbAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_decision(&self, decision: KbAccessDecision) {
        *self.decision.lock().unwrap() = decision;
    }
}

#[async_trait]
impl KbAccess for StaticKbAccess {
    async fn check_read_access(
        &self,
        _user_id: &str,
        _kb_ids: &[String],
    ) -> Result<KbAccessDecision> {
        Ok(self.decision.lock().unwrap().clone())
    }
}

// ============================================================================
// MemoryKbSearchService
// ============================================================================

/// In-memory search service with a query counter, so tests can assert that
/// empty bindings never reach the store.
#[derive(Default)]
pub struct MemoryKbSearchService {
    documents: Mutex<Vec<KbDocument>>,
    query_count: Mutex<u64>,
}

impl MemoryKbSearchService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_document(&self, document: KbDocument) {
        self.documents.lock().unwrap().push(document);
    }

    pub fn query_count(&self) -> u64 {
        *self.query_count.lock().unwrap()
    }

    fn bump(&self) {
        *self.query_count.lock().unwrap() += 1;
    }

    fn matches(field_value: &str, operator: &str, value: &Value) -> bool {
        let needle = value.as_str().unwrap_or_default();
        match operator {
            "eq" => field_value == needle,
            "contains" => field_value.contains(needle),
            "icontains" => field_value
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
            _ => false,
        }
    }
}

#[async_trait]
impl KbSearchService for MemoryKbSearchService {
    async fn search_chunks(
        &self,
        kb_ids: &[String],
        field: &str,
        operator: &str,
        value: &Value,
        page: u32,
        page_size: u32,
    ) -> Result<KbPage<ChunkHit>> {
        self.bump();
        let documents = self.documents.lock().unwrap();
        let hits: Vec<ChunkHit> = documents
            .iter()
            .filter(|d| kb_ids.contains(&d.knowledge_base_id))
            .filter(|d| {
                let field_value = match field {
                    "content" => d.content.as_str(),
                    "title" => d.title.as_deref().unwrap_or(""),
                    _ => "",
                };
                Self::matches(field_value, operator, value)
            })
            .map(|d| ChunkHit {
                id: format!("chunk-{}", d.id),
                document_id: d.id.clone(),
                knowledge_base_id: d.knowledge_base_id.clone(),
                title: d.title.clone(),
                metadata: d.metadata.clone(),
            })
            .collect();
        let total = hits.len() as u64;
        let start = ((page.max(1) - 1) * page_size) as usize;
        let page_hits: Vec<ChunkHit> = hits.into_iter().skip(start).take(page_size as usize).collect();
        Ok(KbPage {
            results: page_hits,
            total_results: total,
            page: page.max(1),
            page_size,
        })
    }

    async fn search_documents(
        &self,
        kb_ids: &[String],
        field: &str,
        operator: &str,
        value: &Value,
        page: u32,
        page_size: u32,
    ) -> Result<KbPage<DocumentHit>> {
        self.bump();
        let documents = self.documents.lock().unwrap();
        let hits: Vec<DocumentHit> = documents
            .iter()
            .filter(|d| kb_ids.contains(&d.knowledge_base_id))
            .filter(|d| {
                let field_value = match field {
                    "title" => d.title.as_deref().unwrap_or(""),
                    "source_uri" => d.source_uri.as_deref().unwrap_or(""),
                    _ => "",
                };
                Self::matches(field_value, operator, value)
            })
            .map(|d| DocumentHit {
                id: d.id.clone(),
                knowledge_base_id: d.knowledge_base_id.clone(),
                title: d.title.clone(),
                source_uri: d.source_uri.clone(),
                metadata: d.metadata.clone(),
            })
            .collect();
        let total = hits.len() as u64;
        let start = ((page.max(1) - 1) * page_size) as usize;
        let page_hits: Vec<DocumentHit> =
            hits.into_iter().skip(start).take(page_size as usize).collect();
        Ok(KbPage {
            results: page_hits,
            total_results: total,
            page: page.max(1),
            page_size,
        })
    }

    async fn get_document(
        &self,
        kb_ids: &[String],
        document_id: &str,
    ) -> Result<Option<KbDocument>> {
        self.bump();
        Ok(self
            .documents
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id == document_id && kb_ids.contains(&d.knowledge_base_id))
            .cloned())
    }

    async fn upsert_document(&self, kb_id: &str, mut document: KbDocument) -> Result<()> {
        self.bump();
        document.knowledge_base_id = kb_id.to_string();
        let mut documents = self.documents.lock().unwrap();
        documents.retain(|d| d.id != document.id);
        documents.push(document);
        Ok(())
    }
}

// ============================================================================
// Event sinks and brokers for tests
// ============================================================================

/// Collects every emitted event for assertions.
#[derive(Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<ProviderStreamEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProviderStreamEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: ProviderStreamEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Records broker calls and replies with a canned JSON result.
#[derive(Default)]
pub struct RecordingBroker {
    calls: Mutex<Vec<(String, String, Value)>>,
    pub response: Mutex<Option<String>>,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(response: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            response: Mutex::new(Some(response.to_string())),
        }
    }

    pub fn calls(&self) -> Vec<(String, String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::adapter::PluginBroker for RecordingBroker {
    async fn call_plugin(&self, plugin_name: &str, op: &str, args: Value) -> String {
        self.calls
            .lock()
            .unwrap()
            .push((plugin_name.to_string(), op.to_string(), args));
        self.response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| r#"{"status":"success","data":{}}"#.to_string())
    }
}

// ============================================================================
// Wiring helper
// ============================================================================

/// HostServices wired entirely from in-memory backends.
pub fn test_host_services() -> HostServices {
    HostServices {
        secret_store: Arc::new(MemorySecretStore::new()),
        cursor_store: Arc::new(MemoryCursorStore::new()),
        object_store: Arc::new(MemoryObjectStore::new()),
        kb_search: Arc::new(MemoryKbSearchService::new()),
        kb_access: Arc::new(StaticKbAccess::new()),
        text_extractor: Arc::new(PlainTextExtractor),
        token_broker: Arc::new(StaticTokenBroker::new()),
        http_retry: RetryPolicy::default(),
    }
}

// Feed lifecycle tests over in-memory backends
//
// Scenarios: one-shot param clearing on a completed run, disabled-schedule
// and unresolvable-plugin preflights (including feed auto-disable), auth
// and secrets preflights, and the exactly-once claim under racing workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use shu_core::capabilities::{Host, HostServices, RetryPolicy};
use shu_core::memory::{
    MemoryCounterStore, MemoryCursorStore, MemoryDefinitionStore, MemoryExecutionStore,
    MemoryFeedStore, MemoryKbSearchService, MemoryObjectStore, MemoryProviderIdentityStore,
    MemorySecretStore, PlainTextExtractor, StaticKbAccess, StaticSubscriptionGate,
    StaticTokenBroker,
};
use shu_core::traits::{ExecutionStatus, ExecutionStore, FeedStore, PluginExecution, PluginFeed};
use shu_core::{
    ExecuteContext, Executor, Plugin, PluginLoader, PluginRegistry, PluginResult, Settings,
};
use shu_worker::{ExecutionRunner, FeedScheduler};

// ============================================================================
// Test plugin + wiring
// ============================================================================

struct SyncPlugin;

#[async_trait]
impl Plugin for SyncPlugin {
    fn name(&self) -> &str {
        "gdrive_files"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {"op": {"type": "string", "enum": ["sync"]}},
            "required": ["op"],
        }))
    }

    async fn execute(
        &self,
        params: Value,
        _context: &ExecuteContext,
        host: &Host,
    ) -> anyhow::Result<PluginResult> {
        // A reset_cursor run clears the stored cursor before rescanning
        if params.get("reset_cursor").and_then(Value::as_bool) == Some(true) {
            host.cursor()?.delete(None).await?;
        }
        host.cursor()?.set(None, json!({"page_token": "next-123"})).await?;
        Ok(PluginResult::ok(json!({"scanned": 42})))
    }
}

struct Harness {
    runner: Arc<ExecutionRunner>,
    scheduler: FeedScheduler,
    feeds: Arc<MemoryFeedStore>,
    executions: Arc<MemoryExecutionStore>,
    definitions: Arc<MemoryDefinitionStore>,
    token_broker: Arc<StaticTokenBroker>,
    secrets: Arc<MemorySecretStore>,
    subscriptions: Arc<StaticSubscriptionGate>,
    _plugins_dir: tempfile::TempDir,
}

fn manifest(op_auth: Value, required_secrets: Value) -> Value {
    json!({
        "name": "gdrive_files",
        "version": "1.0.0",
        "entry": "gdrive_files",
        "capabilities": ["log", "cursor", "kb"],
        "default_feed_op": "sync",
        "allowed_feed_ops": ["sync"],
        "op_auth": op_auth,
        "required_secrets": required_secrets,
    })
}

async fn harness(op_auth: Value, required_secrets: Value) -> Harness {
    let plugins_dir = tempfile::tempdir().unwrap();
    let dir = plugins_dir.path().join("gdrive_files");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("manifest.json"),
        manifest(op_auth, required_secrets).to_string(),
    )
    .unwrap();

    let mut loader = PluginLoader::new(plugins_dir.path());
    loader.register_factory("gdrive_files", || Ok(Arc::new(SyncPlugin)));
    let registry = Arc::new(PluginRegistry::new(loader));

    let definitions = Arc::new(MemoryDefinitionStore::new());
    registry.sync(definitions.as_ref()).await.unwrap();
    definitions.set_enabled("gdrive_files", true);

    let secrets = Arc::new(MemorySecretStore::new());
    let token_broker = Arc::new(StaticTokenBroker::new());
    let subscriptions = Arc::new(StaticSubscriptionGate::new());

    let services = HostServices {
        secret_store: secrets.clone(),
        cursor_store: Arc::new(MemoryCursorStore::new()),
        object_store: Arc::new(MemoryObjectStore::new()),
        kb_search: Arc::new(MemoryKbSearchService::new()),
        kb_access: Arc::new(StaticKbAccess::new()),
        text_extractor: Arc::new(PlainTextExtractor),
        token_broker: token_broker.clone(),
        http_retry: RetryPolicy::default(),
    };
    let executor = Arc::new(Executor::new(
        Settings::default(),
        Arc::new(MemoryCounterStore::new()),
        services,
    ));

    let feeds = Arc::new(MemoryFeedStore::new());
    let executions = Arc::new(MemoryExecutionStore::new());
    let identities = Arc::new(MemoryProviderIdentityStore::new());

    let runner = Arc::new(ExecutionRunner::new(
        executor,
        registry,
        definitions.clone(),
        feeds.clone(),
        identities,
        token_broker.clone(),
        subscriptions.clone(),
        secrets.clone(),
        Settings::default(),
    ));
    let scheduler = FeedScheduler::new(
        runner.clone(),
        feeds.clone(),
        executions.clone(),
        Duration::from_secs(30),
    );

    Harness {
        runner,
        scheduler,
        feeds,
        executions,
        definitions,
        token_broker,
        secrets,
        subscriptions,
        _plugins_dir: plugins_dir,
    }
}

fn feed(params: Value) -> PluginFeed {
    PluginFeed {
        id: Uuid::now_v7(),
        user_id: "user-1".to_string(),
        plugin_name: "gdrive_files".to_string(),
        params,
        schedule: "5m".to_string(),
        enabled: true,
        last_run_at: None,
    }
}

fn pending_execution(feed: &PluginFeed) -> PluginExecution {
    PluginExecution {
        id: Uuid::now_v7(),
        user_id: feed.user_id.clone(),
        schedule_id: Some(feed.id),
        plugin_name: feed.plugin_name.clone(),
        agent_key: None,
        params: feed.params.clone(),
        status: ExecutionStatus::Pending,
        result: None,
        error: None,
        created_at: chrono::Utc::now(),
        completed_at: None,
    }
}

// ============================================================================
// Scenario: one-shot reset_cursor
// ============================================================================

#[tokio::test]
async fn completed_run_clears_one_shot_params_and_bumps_last_run() {
    let h = harness(json!({}), json!([])).await;
    let feed = feed(json!({"kb_id": "kb-1", "container_id": "X", "reset_cursor": true}));
    h.feeds.insert(feed.clone());

    // A full tick enqueues, claims, executes, and applies feed updates
    h.scheduler.tick().await.unwrap();

    let stored = h.feeds.get_feed(feed.id).await.unwrap().unwrap();
    assert!(stored.last_run_at.is_some());
    assert!(stored.params.get("reset_cursor").is_none());
    assert_eq!(stored.params["kb_id"], "kb-1");
    assert_eq!(stored.params["container_id"], "X");

    // The next tick sees no reset_cursor (and is not yet due again)
    h.scheduler.tick().await.unwrap();
    let stored = h.feeds.get_feed(feed.id).await.unwrap().unwrap();
    assert!(stored.params.get("reset_cursor").is_none());
}

#[tokio::test]
async fn completed_execution_records_result() {
    let h = harness(json!({}), json!([])).await;
    let feed = feed(json!({"op": "sync"}));
    h.feeds.insert(feed.clone());

    h.scheduler.tick().await.unwrap();

    let pending = h.executions.list_pending(10).await.unwrap();
    assert!(pending.is_empty());

    // Only one execution exists and it completed
    assert!(!h.executions.has_active_execution(feed.id).await.unwrap());
}

// ============================================================================
// Preflight failures
// ============================================================================

#[tokio::test]
async fn disabled_schedule_fails_preflight() {
    let h = harness(json!({}), json!([])).await;
    let mut f = feed(json!({"op": "sync"}));
    f.enabled = false;
    h.feeds.insert(f.clone());
    let record = h
        .executions
        .create_execution(pending_execution(&f))
        .await
        .unwrap();
    h.executions.claim_pending(record.id).await.unwrap();

    let outcome = h.runner.run_record(&record).await.unwrap();
    assert!(outcome.skipped);
    assert_eq!(outcome.error_code.as_deref(), Some("schedule_disabled"));
    assert_eq!(outcome.outcome.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn unresolvable_plugin_fails_and_disables_feed() {
    let h = harness(json!({}), json!([])).await;
    // Disable the definition row: resolve() must now return nothing
    h.definitions.set_enabled("gdrive_files", false);

    let f = feed(json!({"op": "sync"}));
    h.feeds.insert(f.clone());
    let record = h
        .executions
        .create_execution(pending_execution(&f))
        .await
        .unwrap();
    h.executions.claim_pending(record.id).await.unwrap();

    h.scheduler.process_claimed(record.clone()).await;

    let stored = h.executions.get_execution(record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("plugin_not_found"));

    // Auto-disabled to stop repeated failures
    let stored_feed = h.feeds.get_feed(f.id).await.unwrap().unwrap();
    assert!(!stored_feed.enabled);
}

#[tokio::test]
async fn user_mode_without_token_requires_identity() {
    let op_auth = json!({"sync": {"provider": "google", "mode": "user", "scopes": ["drive"]}});
    let h = harness(op_auth, json!([])).await;

    let f = feed(json!({"op": "sync"}));
    h.feeds.insert(f.clone());
    let record = h
        .executions
        .create_execution(pending_execution(&f))
        .await
        .unwrap();

    let outcome = h.runner.run_record(&record).await.unwrap();
    assert_eq!(outcome.error_code.as_deref(), Some("identity_required"));

    // With a stored token the same record passes preflight
    h.token_broker.grant_user_token("user-1", "google", "tok-1");
    let outcome = h.runner.run_record(&record).await.unwrap();
    assert!(outcome.error_code.is_none());
    assert_eq!(outcome.outcome.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn subscription_gate_blocks_unsubscribed_plugin() {
    let op_auth = json!({"sync": {"provider": "google", "mode": "user", "scopes": ["drive"]}});
    let h = harness(op_auth, json!([])).await;
    h.token_broker.grant_user_token("user-1", "google", "tok-1");
    // The user has subscriptions for this provider, but not for this plugin
    h.subscriptions.subscribe("user-1", "google", "some_other_plugin");

    let f = feed(json!({"op": "sync"}));
    h.feeds.insert(f.clone());
    let record = h
        .executions
        .create_execution(pending_execution(&f))
        .await
        .unwrap();

    let outcome = h.runner.run_record(&record).await.unwrap();
    assert_eq!(outcome.error_code.as_deref(), Some("subscription_required"));
}

#[tokio::test]
async fn delegate_mode_without_subject_requires_identity() {
    let op_auth =
        json!({"sync": {"provider": "google", "mode": "domain_delegate", "scopes": ["drive"]}});
    let h = harness(op_auth, json!([])).await;

    let f = feed(json!({"op": "sync"}));
    h.feeds.insert(f.clone());
    let record = h
        .executions
        .create_execution(pending_execution(&f))
        .await
        .unwrap();

    // No subject anywhere: fail rather than guess
    let outcome = h.runner.run_record(&record).await.unwrap();
    assert_eq!(outcome.error_code.as_deref(), Some("identity_required"));

    // An explicit impersonation subject passes when delegation is ready
    let mut with_subject = record.clone();
    with_subject.params["impersonate_email"] = json!("boss@corp.example");
    let outcome = h.runner.run_record(&with_subject).await.unwrap();
    assert!(outcome.error_code.is_none());

    // A non-ready delegation fails preflight
    h.token_broker.set_delegation_ready(false);
    let outcome = h.runner.run_record(&with_subject).await.unwrap();
    assert_eq!(outcome.error_code.as_deref(), Some("identity_required"));
}

#[tokio::test]
async fn missing_required_secret_fails_preflight() {
    let h = harness(json!({}), json!(["api_key"])).await;

    let f = feed(json!({"op": "sync"}));
    h.feeds.insert(f.clone());
    let record = h
        .executions
        .create_execution(pending_execution(&f))
        .await
        .unwrap();

    let outcome = h.runner.run_record(&record).await.unwrap();
    assert_eq!(outcome.error_code.as_deref(), Some("missing_secrets"));

    h.secrets.insert("gdrive_files", None, "api_key", "s3cr3t");
    let outcome = h.runner.run_record(&record).await.unwrap();
    assert!(outcome.error_code.is_none());
}

// ============================================================================
// Exactly-once claim
// ============================================================================

#[tokio::test]
async fn racing_workers_claim_exactly_once() {
    let h = harness(json!({}), json!([])).await;
    let f = feed(json!({"op": "sync"}));
    h.feeds.insert(f.clone());
    let record = h
        .executions
        .create_execution(pending_execution(&f))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let executions = h.executions.clone();
        let id = record.id;
        handles.push(tokio::spawn(async move {
            executions.claim_pending(id).await.unwrap().is_some()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

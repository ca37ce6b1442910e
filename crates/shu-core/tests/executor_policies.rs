// End-to-end executor policy tests over in-memory backends
//
// Exercises the chokepoint protocol: quota boundaries, rate buckets,
// validation, capability gating, provider-error mapping, timeouts, the
// output cap, and op-scoped auth derivation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use shu_core::capabilities::Host;
use shu_core::memory::{self, MemoryCounterStore, MemoryDefinitionStore, MemoryProviderIdentityStore};
use shu_core::{
    CoreError, ExecuteContext, ExecuteRequest, Executor, ExecutorBroker, LoadedPlugin, Plugin,
    PluginBroker, PluginLimits, PluginLoader, PluginRegistry, PluginResult, PluginStatus,
    QuotaPeriod, Settings,
};

// ============================================================================
// Test plugin
// ============================================================================

/// What the test plugin should do when executed
#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    UseHttpCapability,
    RaiseHttpFailure,
    SleepForever,
    HugeOutput,
    BadOutput,
}

struct TestPlugin {
    behavior: Behavior,
}

#[async_trait]
impl Plugin for TestPlugin {
    fn name(&self) -> &str {
        "test_plugin"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "op": {"type": "string", "enum": ["run", "list"]},
            },
            "required": ["op"],
        }))
    }

    fn output_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {"items": {"type": "array"}},
            "required": ["items"],
        }))
    }

    async fn execute(
        &self,
        params: Value,
        _context: &ExecuteContext,
        host: &Host,
    ) -> anyhow::Result<PluginResult> {
        match self.behavior {
            Behavior::Succeed => Ok(PluginResult::ok(json!({
                "items": [],
                "echo": params.get("op").cloned().unwrap_or(Value::Null),
            }))),
            Behavior::UseHttpCapability => {
                // Manifest only grants log+kb; this access must fail
                let http = host.http()?;
                let _ = http.get_json("https://example.invalid/").await;
                Ok(PluginResult::ok(json!({"items": []})))
            }
            Behavior::RaiseHttpFailure => Err(shu_core::HttpRequestFailed {
                status_code: Some(503),
                url: "https://api.example.com/messages".to_string(),
                body: json!({"error_description": "backend unavailable"}),
                error_category: shu_core::HttpErrorCategory::ServerError,
                is_retryable: true,
            }
            .into()),
            Behavior::SleepForever => {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(PluginResult::ok(json!({"items": []})))
            }
            Behavior::HugeOutput => Ok(PluginResult::ok(json!({
                "items": ["x".repeat(1_000_000)],
            }))),
            Behavior::BadOutput => Ok(PluginResult::ok(json!({"wrong_key": true}))),
        }
    }
}

fn loaded(behavior: Behavior, capabilities: &[&str]) -> LoadedPlugin {
    let manifest: shu_core::PluginManifest = serde_json::from_value(json!({
        "name": "test_plugin",
        "version": "1.0.0",
        "entry": "test_plugin",
        "capabilities": capabilities,
        "op_auth": {
            "list": {"provider": "google", "mode": "user", "scopes": ["gmail.readonly"]},
        },
    }))
    .unwrap();
    LoadedPlugin::new(Arc::new(TestPlugin { behavior }), &manifest)
}

fn executor(settings: Settings) -> Executor {
    Executor::new(
        settings,
        Arc::new(MemoryCounterStore::new()),
        memory::test_host_services(),
    )
}

fn request(params: Value) -> ExecuteRequest {
    ExecuteRequest::new("user-1", params)
}

// ============================================================================
// Validation and results
// ============================================================================

#[tokio::test]
async fn success_round_trip() {
    let exec = executor(Settings::default());
    let plugin = loaded(Behavior::Succeed, &["log"]);
    let result = exec
        .execute(&plugin, request(json!({"op": "run"})))
        .await
        .unwrap();
    assert_eq!(result.status, PluginStatus::Success);
    assert_eq!(result.data.unwrap()["echo"], "run");
}

#[tokio::test]
async fn missing_op_fails_validation_before_execute() {
    let exec = executor(Settings::default());
    let plugin = loaded(Behavior::Succeed, &["log"]);
    let err = exec.execute(&plugin, request(json!({}))).await.unwrap_err();
    match err {
        CoreError::Validation(msg) => assert!(msg.contains("op")),
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn output_schema_violation_never_returns_success() {
    let exec = executor(Settings::default());
    let plugin = loaded(Behavior::BadOutput, &["log"]);
    let err = exec
        .execute(&plugin, request(json!({"op": "run"})))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::OutputValidation(_)));
}

#[tokio::test]
async fn host_overlay_is_stripped_from_plugin_params() {
    let exec = executor(Settings::default());
    let plugin = loaded(Behavior::Succeed, &["log"]);
    // __host must not reach validation (it is not in the schema) nor the plugin
    let result = exec
        .execute(
            &plugin,
            request(json!({"op": "run", "__host": {"kb": {"knowledge_base_ids": ["kb-1"]}}})),
        )
        .await
        .unwrap();
    assert!(result.is_success());
}

// ============================================================================
// Capability gating
// ============================================================================

#[tokio::test]
async fn ungranted_capability_becomes_plugin_execute_error() {
    let exec = executor(Settings::default());
    let plugin = loaded(Behavior::UseHttpCapability, &["log", "kb"]);
    let result = exec
        .execute(&plugin, request(json!({"op": "run"})))
        .await
        .unwrap();
    assert_eq!(result.status, PluginStatus::Error);
    let error = result.error.unwrap();
    assert_eq!(error.code, "plugin_execute_error");
    assert!(error.message.contains("capability 'http' not granted"));
}

// ============================================================================
// Error mapping
// ============================================================================

#[tokio::test]
async fn http_failure_maps_to_provider_error() {
    let exec = executor(Settings::default());
    let plugin = loaded(Behavior::RaiseHttpFailure, &["http"]);
    let result = exec
        .execute(&plugin, request(json!({"op": "run"})))
        .await
        .unwrap();
    assert_eq!(result.status, PluginStatus::Error);
    let error = result.error.unwrap();
    assert_eq!(error.code, "provider_error");
    assert!(error.message.contains("(503)"));
    assert_eq!(error.details["status_code"], 503);
    assert_eq!(error.details["provider_message"], "backend unavailable");
}

#[tokio::test]
async fn timeout_yields_timeout_result() {
    let settings = Settings {
        plugin_exec_timeout_seconds: 1,
        ..Settings::default()
    };
    let exec = executor(settings);
    let plugin = loaded(Behavior::SleepForever, &["log"]);
    let result = exec
        .execute(&plugin, request(json!({"op": "run"})))
        .await
        .unwrap();
    assert_eq!(result.status, PluginStatus::Timeout);
    assert_eq!(result.error.unwrap().code, "timeout");
}

#[tokio::test]
async fn oversized_output_is_replaced() {
    let exec = executor(Settings::default());
    let plugin = loaded(Behavior::HugeOutput, &["log"]);
    let result = exec
        .execute(&plugin, request(json!({"op": "run"})))
        .await
        .unwrap();
    assert_eq!(result.status, PluginStatus::Error);
    let error = result.error.unwrap();
    assert_eq!(error.code, "output_too_large");
    assert!(error.message.contains("output exceeds max bytes"));
}

// ============================================================================
// Quotas and rate limits
// ============================================================================

#[tokio::test]
async fn quota_boundary_daily() {
    let exec = executor(Settings::default());
    let plugin = loaded(Behavior::Succeed, &["log"]);
    let limits = PluginLimits {
        quota_daily_requests: Some(2),
        ..Default::default()
    };

    for _ in 0..2 {
        let mut req = request(json!({"op": "run"}));
        req.limits = Some(limits.clone());
        exec.execute(&plugin, req).await.unwrap();
    }

    let mut req = request(json!({"op": "run"}));
    req.limits = Some(limits.clone());
    let err = exec.execute(&plugin, req).await.unwrap_err();
    match err {
        CoreError::QuotaExceeded {
            period,
            reset_in,
            headers,
        } => {
            assert_eq!(period, QuotaPeriod::Daily);
            assert!(reset_in > 0);
            assert_eq!(headers["RateLimit-Remaining"], "0");
            assert!(headers.contains_key("Retry-After"));
        }
        other => panic!("expected quota denial, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_bucket_allows_burst_then_denies() {
    let exec = executor(Settings::default());
    let plugin = loaded(Behavior::Succeed, &["log"]);
    let limits = PluginLimits {
        rate_limit_user_requests: Some(3),
        rate_limit_user_period: Some(60),
        ..Default::default()
    };

    // A burst of exactly `capacity` calls succeeds
    for _ in 0..3 {
        let mut req = request(json!({"op": "run"}));
        req.limits = Some(limits.clone());
        exec.execute(&plugin, req).await.unwrap();
    }

    // The capacity+1'th call is denied
    let mut req = request(json!({"op": "run"}));
    req.limits = Some(limits.clone());
    let err = exec.execute(&plugin, req).await.unwrap_err();
    match err {
        CoreError::RateLimited {
            retry_after,
            headers,
        } => {
            assert!(retry_after >= 1);
            assert_eq!(headers["RateLimit-Limit"], "3");
        }
        other => panic!("expected rate denial, got {other:?}"),
    }
}

#[tokio::test]
async fn provider_concurrency_denies_over_limit() {
    let exec = Arc::new(executor(Settings::default()));
    let limits = PluginLimits {
        provider_name: Some("slowapi".to_string()),
        provider_concurrency: Some(1),
        ..Default::default()
    };

    // Occupy the single slot with a sleeping plugin
    let sleeper = loaded(Behavior::SleepForever, &["log"]);
    let exec_bg = exec.clone();
    let limits_bg = limits.clone();
    let handle = tokio::spawn(async move {
        let mut req = request(json!({"op": "run"}));
        req.limits = Some(limits_bg);
        // Times out eventually under the default wall clock; we only need it
        // to hold the slot while the second call races
        let _ = exec_bg.execute(&sleeper, req).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let plugin = loaded(Behavior::Succeed, &["log"]);
    let mut req = request(json!({"op": "run"}));
    req.limits = Some(limits.clone());
    let err = exec.execute(&plugin, req).await.unwrap_err();
    assert!(matches!(err, CoreError::ProviderConcurrencyLimited { provider, .. } if provider == "slowapi"));
    handle.abort();
}

#[tokio::test]
async fn disabling_rate_limiting_disables_all_limiters() {
    let settings = Settings {
        enable_rate_limiting: false,
        ..Settings::default()
    };
    let exec = executor(settings);
    let plugin = loaded(Behavior::Succeed, &["log"]);
    let limits = PluginLimits {
        rate_limit_user_requests: Some(1),
        rate_limit_user_period: Some(60),
        provider_name: Some("x".to_string()),
        provider_rpm: Some(1),
        provider_concurrency: Some(1),
        ..Default::default()
    };
    for _ in 0..5 {
        let mut req = request(json!({"op": "run"}));
        req.limits = Some(limits.clone());
        exec.execute(&plugin, req).await.unwrap();
    }
}

// ============================================================================
// Broker: policy denials become structured tool results
// ============================================================================

#[tokio::test]
async fn broker_converts_quota_denial_to_structured_json() {
    let tmp = tempfile::tempdir().unwrap();
    let plugin_dir = tmp.path().join("test_plugin");
    std::fs::create_dir_all(&plugin_dir).unwrap();
    std::fs::write(
        plugin_dir.join("manifest.json"),
        json!({"name": "test_plugin", "version": "1.0.0", "entry": "test_plugin", "capabilities": ["log"]})
            .to_string(),
    )
    .unwrap();

    let mut loader = PluginLoader::new(tmp.path());
    loader.register_factory("test_plugin", || {
        Ok(Arc::new(TestPlugin {
            behavior: Behavior::Succeed,
        }))
    });
    let registry = Arc::new(PluginRegistry::new(loader));

    let definitions = Arc::new(MemoryDefinitionStore::new());
    registry.sync(definitions.as_ref()).await.unwrap();
    definitions.set_enabled("test_plugin", true);
    definitions.set_limits(
        "test_plugin",
        PluginLimits {
            quota_daily_requests: Some(1),
            ..Default::default()
        },
    );

    let exec = Arc::new(executor(Settings::default()));
    let broker = ExecutorBroker::new(
        exec,
        registry,
        definitions.clone(),
        Arc::new(MemoryProviderIdentityStore::new()),
        "user-1",
        None,
    );

    // First call consumes the quota
    let ok = broker.call_plugin("test_plugin", "run", json!({})).await;
    let ok: Value = serde_json::from_str(&ok).unwrap();
    assert_eq!(ok["status"], "success");

    // Second call is denied, but the model gets structured JSON back
    let denied = broker.call_plugin("test_plugin", "run", json!({})).await;
    let denied: Value = serde_json::from_str(&denied).unwrap();
    assert_eq!(denied["status"], "error");
    assert_eq!(denied["error"]["code"], "quota_exceeded");
    assert_eq!(denied["error"]["period"], "daily");
}

#[tokio::test]
async fn broker_reports_unknown_plugin() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = Arc::new(PluginRegistry::new(PluginLoader::new(tmp.path())));
    let definitions = Arc::new(MemoryDefinitionStore::new());
    let broker = ExecutorBroker::new(
        Arc::new(executor(Settings::default())),
        registry,
        definitions,
        Arc::new(MemoryProviderIdentityStore::new()),
        "user-1",
        None,
    );
    let out = broker.call_plugin("ghost", "run", json!({})).await;
    let out: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(out["error"]["code"], "plugin_not_found");
}

// Shu Plugin Runtime Core
//
// This crate provides the plugin execution and orchestration core of the
// Shu assistant platform: discovery and enablement of plugins, a sandboxed
// host surface, one policy chokepoint for every plugin call, and a
// streaming provider-adapter framework with the tool-call loop on top.
//
// Key design decisions:
// - Storage is consumed through traits (DefinitionStore, CounterStore, ...)
//   so the core stays DB-agnostic; shu-storage supplies sqlx backends and
//   crate::memory supplies in-memory ones for tests and examples
// - Plugins are separate compilation units linking only against this SDK
//   surface; the loader's static scan plus the capability allow-list make
//   the plugin boundary a narrow, inspectable surface
// - Policy denials (quota, rate, concurrency) are typed errors; everything
//   inside a plugin call is folded into a PluginResult
// - Provider adapters normalize streaming APIs into ProviderStreamEvent;
//   the TurnRunner interleaves streams with plugin execution

pub mod adapter;
pub mod broker;
pub mod capabilities;
pub mod chat;
pub mod counters;
pub mod error;
pub mod executor;
pub mod limits;
pub mod loader;
pub mod manifest;
pub mod orchestrator;
pub mod plugin;
pub mod provider;
pub mod registry;
pub mod schema;
pub mod settings;
pub mod traits;

// In-memory implementations for examples and testing
pub mod memory;

// Re-exports for convenience
pub use adapter::{
    attachment_text_fallback, AdapterContext, AdapterRegistry, AttachmentReader, PluginBroker,
    ProviderAdapter, ProviderCredentials,
};
pub use broker::ExecutorBroker;
pub use capabilities::{
    capability_id, make_host, CapabilityDenied, Host, HostContext, HostServices, HttpErrorCategory,
    HttpRequest, HttpRequestFailed, HttpResponse, RetryPolicy,
};
pub use chat::{Attachment, CallableTool, ChatContext, ChatMessage, ChatRole};
pub use counters::{BucketDecision, CounterStore, RateDecision, TokenBucketRateLimiter};
pub use error::{CoreError, QuotaPeriod, Result};
pub use executor::{resolve_auth_requirements, AuthRequirement, ExecuteRequest, Executor};
pub use limits::{EffectiveLimits, PluginLimits};
pub use loader::{PluginFactory, PluginLoader};
pub use manifest::{AuthMode, OpAuth, PluginManifest, PluginRecord, RequiredIdentity};
pub use orchestrator::{
    ChunkStream, EventSink, HttpTransport, ProviderTransport, TurnResult, TurnRunner,
};
pub use plugin::{ExecuteContext, LoadedPlugin, Plugin, PluginError, PluginResult, PluginStatus};
pub use provider::{
    ProviderCapabilities, ProviderInformation, ProviderStreamEvent, ToolCallInstruction, Usage,
};
pub use registry::{PluginRegistry, SyncReport};
pub use settings::Settings;
pub use traits::{
    DefinitionStore, DelegationStatus, ExecutionOutcome, ExecutionStatus, ExecutionStore,
    FeedStore, KbAccess, KbAccessDecision, KbSearchService, PluginDefinition, PluginExecution,
    PluginFeed, ProviderIdentity, ProviderIdentityStore, SecretStore, SubscriptionGate,
    TextExtractor, TokenBroker, TokenGrant,
};

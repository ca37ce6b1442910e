// Database rows (internal, converted to shu-core entities at the seam)

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use shu_core::traits::{
    ExecutionStatus, PluginDefinition, PluginExecution, PluginFeed, ProviderIdentity,
};
use shu_core::PluginLimits;

// ============================================
// Plugin definition rows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct PluginDefinitionRow {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub limits: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginDefinitionRow {
    pub fn into_entity(self) -> PluginDefinition {
        PluginDefinition {
            name: self.name,
            version: self.version,
            enabled: self.enabled,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
            limits: self
                .limits
                .and_then(|v| serde_json::from_value::<PluginLimits>(v).ok()),
        }
    }
}

// ============================================
// Feed rows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct PluginFeedRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plugin_name: String,
    pub params: Value,
    pub schedule: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PluginFeedRow {
    pub fn into_entity(self) -> PluginFeed {
        PluginFeed {
            id: self.id,
            user_id: self.user_id.to_string(),
            plugin_name: self.plugin_name,
            params: self.params,
            schedule: self.schedule,
            enabled: self.enabled,
            last_run_at: self.last_run_at,
        }
    }
}

/// Input for creating a feed
#[derive(Debug, Clone)]
pub struct CreatePluginFeed {
    pub user_id: Uuid,
    pub plugin_name: String,
    pub params: Value,
    pub schedule: String,
    pub enabled: bool,
}

// ============================================
// Execution rows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct PluginExecutionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub plugin_name: String,
    pub agent_key: Option<String>,
    pub params: Value,
    pub status: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PluginExecutionRow {
    pub fn into_entity(self) -> PluginExecution {
        PluginExecution {
            id: self.id,
            user_id: self.user_id.to_string(),
            schedule_id: self.schedule_id,
            plugin_name: self.plugin_name,
            agent_key: self.agent_key,
            params: self.params,
            status: ExecutionStatus::parse(&self.status).unwrap_or(ExecutionStatus::Failed),
            result: self.result,
            error: self.error,
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Input for creating an execution record (status starts PENDING)
#[derive(Debug, Clone)]
pub struct CreatePluginExecution {
    pub user_id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub plugin_name: String,
    pub agent_key: Option<String>,
    pub params: Value,
}

// ============================================
// Provider identity rows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ProviderIdentityRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_key: String,
    pub subject: String,
    pub scopes: Value,
    pub token_material_encrypted: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl ProviderIdentityRow {
    /// Convert to the runtime entity with decrypted token material.
    pub fn into_entity(self, token_material: Value) -> ProviderIdentity {
        ProviderIdentity {
            user_id: self.user_id.to_string(),
            provider_key: self.provider_key,
            subject: self.subject,
            scopes: serde_json::from_value(self.scopes).unwrap_or_default(),
            token_material,
        }
    }
}

// ============================================
// LLM provider rows (connection material for adapters)
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct LlmProviderRow {
    pub id: Uuid,
    pub name: String,
    pub adapter_name: String,
    pub base_url: Option<String>,
    pub api_key_encrypted: Option<Vec<u8>>,
    pub settings: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

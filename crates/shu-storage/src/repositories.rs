// Repository layer: plugin registry, feeds, executions, provider identities
//
// Implements the shu-core store traits over Postgres. Entity conversion
// happens here; callers never see rows. The execution claim is a
// conditional UPDATE so exactly one worker wins the PENDING -> RUNNING
// transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use shu_core::error::{CoreError, Result};
use shu_core::traits::{
    DefinitionStore, ExecutionOutcome, ExecutionStore, FeedStore, PluginDefinition,
    PluginExecution, PluginFeed, ProviderIdentity, ProviderIdentityStore,
};
use shu_core::ProviderCredentials;

use crate::encryption::EncryptionService;
use crate::models::*;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    encryption: EncryptionService,
}

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::store(e.to_string())
}

impl Database {
    pub fn new(pool: PgPool, encryption: EncryptionService) -> Self {
        Self { pool, encryption }
    }

    /// Create a database connection from a URL
    pub async fn from_url(database_url: &str, encryption: EncryptionService) -> Result<Self> {
        let pool = PgPool::connect(database_url).await.map_err(db_err)?;
        Ok(Self::new(pool, encryption))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn encryption(&self) -> &EncryptionService {
        &self.encryption
    }

    // ============================================
    // Feeds
    // ============================================

    pub async fn create_feed(&self, input: CreatePluginFeed) -> Result<PluginFeed> {
        let row = sqlx::query_as::<_, PluginFeedRow>(
            r#"
            INSERT INTO plugin_feeds (id, user_id, plugin_name, params, schedule, enabled)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, user_id, plugin_name, params, schedule, enabled, last_run_at, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.user_id)
        .bind(&input.plugin_name)
        .bind(&input.params)
        .bind(&input.schedule)
        .bind(input.enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.into_entity())
    }

    // ============================================
    // Executions
    // ============================================

    pub async fn create_pending_execution(
        &self,
        input: CreatePluginExecution,
    ) -> Result<PluginExecution> {
        let row = sqlx::query_as::<_, PluginExecutionRow>(
            r#"
            INSERT INTO plugin_executions (id, user_id, schedule_id, plugin_name, agent_key, params, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING')
            RETURNING id, user_id, schedule_id, plugin_name, agent_key, params, status, result, error, created_at, completed_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.user_id)
        .bind(input.schedule_id)
        .bind(&input.plugin_name)
        .bind(&input.agent_key)
        .bind(&input.params)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.into_entity())
    }

    // ============================================
    // LLM providers
    // ============================================

    pub async fn get_llm_provider(&self, id: Uuid) -> Result<Option<LlmProviderRow>> {
        sqlx::query_as::<_, LlmProviderRow>(
            r#"
            SELECT id, name, adapter_name, base_url, api_key_encrypted, settings, created_at, updated_at
            FROM llm_providers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Decrypt a provider row into adapter credentials.
    ///
    /// Decryption failure is a configuration error raised before any
    /// network call is attempted.
    pub fn provider_credentials(&self, row: &LlmProviderRow) -> Result<ProviderCredentials> {
        let api_key = match &row.api_key_encrypted {
            Some(encrypted) => Some(self.encryption.decrypt_to_string(encrypted).map_err(|e| {
                CoreError::config(format!(
                    "failed to decrypt API key for provider '{}': {e}",
                    row.name
                ))
            })?),
            None => None,
        };
        Ok(ProviderCredentials {
            api_key,
            base_url: row.base_url.clone(),
            settings: row.settings.clone(),
        })
    }
}

// ============================================
// DefinitionStore
// ============================================

#[async_trait]
impl DefinitionStore for Database {
    async fn get_definition(&self, name: &str) -> Result<Option<PluginDefinition>> {
        let row = sqlx::query_as::<_, PluginDefinitionRow>(
            r#"
            SELECT name, version, enabled, input_schema, output_schema, limits, created_at, updated_at
            FROM plugin_definitions
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(PluginDefinitionRow::into_entity))
    }

    async fn list_definitions(&self) -> Result<Vec<PluginDefinition>> {
        let rows = sqlx::query_as::<_, PluginDefinitionRow>(
            r#"
            SELECT name, version, enabled, input_schema, output_schema, limits, created_at, updated_at
            FROM plugin_definitions
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(PluginDefinitionRow::into_entity).collect())
    }

    async fn create_definition(&self, definition: PluginDefinition) -> Result<bool> {
        let limits = definition
            .limits
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CoreError::store(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO plugin_definitions (name, version, enabled, input_schema, output_schema, limits)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name, version) DO NOTHING
            "#,
        )
        .bind(&definition.name)
        .bind(&definition.version)
        .bind(definition.enabled)
        .bind(&definition.input_schema)
        .bind(&definition.output_schema)
        .bind(&limits)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_schemas(
        &self,
        name: &str,
        input_schema: Option<Value>,
        output_schema: Option<Value>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE plugin_definitions
            SET
                input_schema = COALESCE($2, input_schema),
                output_schema = COALESCE($3, output_schema),
                updated_at = NOW()
            WHERE name = $1
              AND (
                  ($2 IS NOT NULL AND input_schema IS DISTINCT FROM $2)
                  OR ($3 IS NOT NULL AND output_schema IS DISTINCT FROM $3)
              )
            "#,
        )
        .bind(name)
        .bind(&input_schema)
        .bind(&output_schema)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_definition(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM plugin_definitions WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_enabled(&self, name: &str) -> Result<bool> {
        let enabled: Option<bool> =
            sqlx::query_scalar("SELECT enabled FROM plugin_definitions WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(enabled.unwrap_or(false))
    }
}

// ============================================
// FeedStore
// ============================================

#[async_trait]
impl FeedStore for Database {
    async fn get_feed(&self, id: Uuid) -> Result<Option<PluginFeed>> {
        let row = sqlx::query_as::<_, PluginFeedRow>(
            r#"
            SELECT id, user_id, plugin_name, params, schedule, enabled, last_run_at, created_at
            FROM plugin_feeds
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(PluginFeedRow::into_entity))
    }

    async fn set_feed_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE plugin_feeds SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn apply_feed_run(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        params: Option<Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE plugin_feeds
            SET last_run_at = $2, params = COALESCE($3, params)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(last_run_at)
        .bind(&params)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_due_feeds(&self, _now: DateTime<Utc>) -> Result<Vec<PluginFeed>> {
        // Schedule interpretation happens in the scheduler; this returns the
        // enabled candidates
        let rows = sqlx::query_as::<_, PluginFeedRow>(
            r#"
            SELECT id, user_id, plugin_name, params, schedule, enabled, last_run_at, created_at
            FROM plugin_feeds
            WHERE enabled = TRUE
            ORDER BY last_run_at NULLS FIRST
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(PluginFeedRow::into_entity).collect())
    }
}

// ============================================
// ExecutionStore
// ============================================

#[async_trait]
impl ExecutionStore for Database {
    async fn create_execution(&self, execution: PluginExecution) -> Result<PluginExecution> {
        let user_id = Uuid::parse_str(&execution.user_id)
            .map_err(|e| CoreError::store(format!("invalid user id: {e}")))?;
        self.create_pending_execution(CreatePluginExecution {
            user_id,
            schedule_id: execution.schedule_id,
            plugin_name: execution.plugin_name,
            agent_key: execution.agent_key,
            params: execution.params,
        })
        .await
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<PluginExecution>> {
        let row = sqlx::query_as::<_, PluginExecutionRow>(
            r#"
            SELECT id, user_id, schedule_id, plugin_name, agent_key, params, status, result, error, created_at, completed_at
            FROM plugin_executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(PluginExecutionRow::into_entity))
    }

    async fn claim_pending(&self, id: Uuid) -> Result<Option<PluginExecution>> {
        // Conditional update: exactly one concurrent claimer wins
        let row = sqlx::query_as::<_, PluginExecutionRow>(
            r#"
            UPDATE plugin_executions
            SET status = 'RUNNING'
            WHERE id = $1 AND status = 'PENDING'
            RETURNING id, user_id, schedule_id, plugin_name, agent_key, params, status, result, error, created_at, completed_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(PluginExecutionRow::into_entity))
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<PluginExecution>> {
        let rows = sqlx::query_as::<_, PluginExecutionRow>(
            r#"
            SELECT id, user_id, schedule_id, plugin_name, agent_key, params, status, result, error, created_at, completed_at
            FROM plugin_executions
            WHERE status = 'PENDING'
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(PluginExecutionRow::into_entity).collect())
    }

    async fn has_active_execution(&self, schedule_id: Uuid) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM plugin_executions
            WHERE schedule_id = $1 AND status IN ('PENDING', 'RUNNING')
            "#,
        )
        .bind(schedule_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count > 0)
    }

    async fn apply_outcome(&self, id: Uuid, outcome: &ExecutionOutcome) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE plugin_executions
            SET status = $2, result = $3, error = $4, completed_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(&outcome.result)
        .bind(&outcome.error)
        .bind(outcome.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

// ============================================
// ProviderIdentityStore
// ============================================

#[async_trait]
impl ProviderIdentityStore for Database {
    async fn identities_for_user(&self, user_id: &str) -> Result<Vec<ProviderIdentity>> {
        let user_id = Uuid::parse_str(user_id)
            .map_err(|e| CoreError::store(format!("invalid user id: {e}")))?;

        let rows = sqlx::query_as::<_, ProviderIdentityRow>(
            r#"
            SELECT id, user_id, provider_key, subject, scopes, token_material_encrypted, created_at
            FROM provider_identities
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut identities = Vec::with_capacity(rows.len());
        for row in rows {
            let token_material = match &row.token_material_encrypted {
                Some(encrypted) => match self.encryption.decrypt(encrypted) {
                    Ok(plaintext) => {
                        serde_json::from_slice(&plaintext).unwrap_or(Value::Null)
                    }
                    Err(e) => {
                        warn!(
                            provider = %row.provider_key,
                            subject = %row.subject,
                            error = %e,
                            "Skipping identity with undecryptable token material"
                        );
                        continue;
                    }
                },
                None => Value::Null,
            };
            identities.push(row.into_entity(token_material));
        }
        Ok(identities)
    }
}

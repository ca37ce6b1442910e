// Shu storage layer
//
// sqlx/Postgres implementations of the shu-core store traits, plus the
// encryption service for provider API keys and identity token material.
// The schema lives in migrations/; apply with `sqlx migrate run`.

pub mod counter_store;
pub mod encryption;
pub mod models;
pub mod repositories;

pub use counter_store::PgCounterStore;
pub use encryption::{generate_encryption_key, EncryptedPayload, EncryptionService};
pub use models::{
    CreatePluginExecution, CreatePluginFeed, LlmProviderRow, PluginDefinitionRow,
    PluginExecutionRow, PluginFeedRow, ProviderIdentityRow,
};
pub use repositories::Database;

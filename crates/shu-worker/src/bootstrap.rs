// Process bootstrap helpers shared by worker binaries

use tracing_subscriber::EnvFilter;

/// Load .env (development convenience; missing files are fine).
pub fn load_env() {
    let _ = dotenvy::dotenv();
}

/// Install the tracing subscriber with RUST_LOG-style filtering.
pub fn init_observability() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// Google Gemini provider adapter

pub mod adapter;

pub use adapter::GeminiAdapter;

use shu_core::AdapterRegistry;

/// Register the adapter under its canonical name.
pub fn register_adapters(registry: &mut AdapterRegistry) {
    registry.register("gemini", |ctx| Ok(Box::new(GeminiAdapter::new(ctx))));
}

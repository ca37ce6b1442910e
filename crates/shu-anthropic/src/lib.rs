// Anthropic Claude provider adapter

pub mod adapter;

pub use adapter::AnthropicAdapter;

use shu_core::AdapterRegistry;

/// Register the adapter under its canonical name.
pub fn register_adapters(registry: &mut AdapterRegistry) {
    registry.register("anthropic", |ctx| Ok(Box::new(AnthropicAdapter::new(ctx))));
}

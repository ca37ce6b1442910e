// OpenAI provider adapters
//
// Two dialects: the Responses API (typed stream events, function_call
// items, call_id round trips) and Chat Completions (index-keyed tool-call
// fragments, role:"tool" results). The Completions adapter also serves
// every OpenAI-compatible server through profiles.

pub mod completions;
pub mod responses;

pub use completions::{CompletionsAdapter, CompletionsProfile};
pub use responses::ResponsesAdapter;

use shu_core::AdapterRegistry;

/// Register every adapter this crate provides.
pub fn register_adapters(registry: &mut AdapterRegistry) {
    registry.register("openai", |ctx| Ok(Box::new(ResponsesAdapter::new(ctx))));
    registry.register("openai_completions", |ctx| {
        Ok(Box::new(CompletionsAdapter::new(
            ctx,
            CompletionsProfile::openai(),
        )))
    });
    registry.register("xai", |ctx| {
        Ok(Box::new(CompletionsAdapter::new(
            ctx,
            CompletionsProfile::xai(),
        )))
    });
    registry.register("perplexity", |ctx| {
        Ok(Box::new(CompletionsAdapter::new(
            ctx,
            CompletionsProfile::perplexity(),
        )))
    });
    registry.register("ollama", |ctx| {
        Ok(Box::new(CompletionsAdapter::new(
            ctx,
            CompletionsProfile::ollama(),
        )))
    });
    registry.register("lmstudio", |ctx| {
        Ok(Box::new(CompletionsAdapter::new(
            ctx,
            CompletionsProfile::lmstudio(),
        )))
    });
    registry.register("local", |ctx| {
        Ok(Box::new(CompletionsAdapter::new(
            ctx,
            CompletionsProfile::local(),
        )))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_all_dialects() {
        let mut registry = AdapterRegistry::new();
        register_adapters(&mut registry);
        let mut names = registry.names();
        names.sort();
        assert_eq!(
            names,
            vec![
                "lmstudio",
                "local",
                "ollama",
                "openai",
                "openai_completions",
                "perplexity",
                "xai"
            ]
        );
    }
}

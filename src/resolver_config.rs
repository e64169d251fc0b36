// Settings for a resolver deployment (spec §A.3), loaded from a flat
// `toml` file by `dresc --config`. Kept separate from a policy's own
// source, which is structural (`ron`, see `crate::policy`) rather than
// a flat key/value settings document.

use serde::Deserialize;

fn default_stack_depth() -> usize {
    256
}

fn default_scope_capacity() -> usize {
    16
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Initial VM value-stack capacity, reserved up front to avoid
    /// reallocation churn on deeply nested expressions.
    pub initial_stack_depth: usize,
    /// Initial capacity of a freshly pushed scope's local table.
    pub initial_scope_capacity: usize,
    /// When true, calling an unregistered method returns a silent
    /// failure (status 0) instead of an error; installs a no-op
    /// fallback handler (spec §4.4 `MethodTable::fallback_handler`).
    pub allow_unknown_methods: bool,
}

impl Default for ResolverConfig {
    fn default() -> ResolverConfig {
        ResolverConfig {
            initial_stack_depth: default_stack_depth(),
            initial_scope_capacity: default_scope_capacity(),
            allow_unknown_methods: false,
        }
    }
}

impl ResolverConfig {
    pub fn from_toml(text: &str) -> Result<ResolverConfig, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_an_empty_document() {
        let cfg = ResolverConfig::from_toml("").unwrap();
        assert_eq!(cfg.initial_stack_depth, 256);
        assert_eq!(cfg.initial_scope_capacity, 16);
        assert!(!cfg.allow_unknown_methods);
    }

    #[test]
    fn partial_document_overrides_only_named_fields() {
        let cfg = ResolverConfig::from_toml("allow_unknown_methods = true\n").unwrap();
        assert_eq!(cfg.initial_stack_depth, 256);
        assert!(cfg.allow_unknown_methods);
    }
}

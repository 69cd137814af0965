//! Engine flags, injected at construction.

use std::env;

use crate::shape::MAX_RANK;

/// Runtime switches for an [`crate::Engine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Compare the backend's live data-id count around every kernel call.
    pub check_leaks: bool,
    /// Time every kernel and log it at debug level.
    pub debug: bool,
    /// Largest rank accepted by tensor creation.
    pub max_rank: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            check_leaks: false,
            debug: false,
            max_rank: MAX_RANK,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn env_flag(key: &str) -> Option<bool> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    }
}

impl EngineConfig {
    /// Defaults overridden by `TR_CHECK_LEAKS`, `TR_DEBUG` and `TR_MAX_RANK`.
    pub fn from_env() -> Self {
        let mut config = EngineConfig::default();
        if let Some(check_leaks) = env_flag("TR_CHECK_LEAKS") {
            config.check_leaks = check_leaks;
        }
        if let Some(debug) = env_flag("TR_DEBUG") {
            config.debug = debug;
        }
        if let Some(max_rank) = env::var("TR_MAX_RANK")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            config.max_rank = max_rank;
        }
        config
    }

    pub fn with_check_leaks(mut self, on: bool) -> Self {
        self.check_leaks = on;
        self
    }

    pub fn with_debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    pub fn with_max_rank(mut self, max_rank: usize) -> Self {
        self.max_rank = max_rank;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        for v in ["1", "true", "YES", " on "] {
            assert!(parse_bool(v), "{v}");
        }
        for v in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(v), "{v}");
        }
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::default()
            .with_check_leaks(true)
            .with_max_rank(3);
        assert!(config.check_leaks);
        assert!(!config.debug);
        assert_eq!(config.max_rank, 3);
    }
}

//! Bridge configuration.

use thiserror::Error;

use crate::runtime::arg_stack::DEFAULT_ARG_STACK_WORDS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: expected a boolean (1/0, true/false, on/off)")]
    InvalidBool { key: &'static str, value: String },
    #[error("invalid value {value:?} for {key}: expected a positive word count")]
    InvalidSize { key: &'static str, value: String },
}

/// Options that affect one bridge context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Box small ints and doubles inline instead of allocating handles.
    pub boxing_fast_path: bool,
    /// Count every context function call per entry point.
    pub trace_upcalls: bool,
    /// Call native code through the debug context and report leaked handles.
    pub debug_handles: bool,
    /// Capacity of the native argument stack in words.
    pub arg_stack_words: usize,
    /// Whether the context may be promoted to native at all.
    pub allow_native_access: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            boxing_fast_path: true,
            trace_upcalls: false,
            debug_handles: false,
            arg_stack_words: DEFAULT_ARG_STACK_WORDS,
            allow_native_access: true,
        }
    }
}

pub const ENV_FAST_PATHS: &str = "EXTBRIDGE_FAST_PATHS";
pub const ENV_TRACE_UPCALLS: &str = "EXTBRIDGE_TRACE_UPCALLS";
pub const ENV_DEBUG_HANDLES: &str = "EXTBRIDGE_DEBUG_HANDLES";
pub const ENV_ARG_STACK_WORDS: &str = "EXTBRIDGE_ARG_STACK_WORDS";
pub const ENV_NATIVE_ACCESS: &str = "EXTBRIDGE_NATIVE_ACCESS";

impl BridgeConfig {
    /// Defaults overridden by `EXTBRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_FAST_PATHS) {
            config.boxing_fast_path = parse_bool(ENV_FAST_PATHS, &v)?;
        }
        if let Some(v) = lookup(ENV_TRACE_UPCALLS) {
            config.trace_upcalls = parse_bool(ENV_TRACE_UPCALLS, &v)?;
        }
        if let Some(v) = lookup(ENV_DEBUG_HANDLES) {
            config.debug_handles = parse_bool(ENV_DEBUG_HANDLES, &v)?;
        }
        if let Some(v) = lookup(ENV_NATIVE_ACCESS) {
            config.allow_native_access = parse_bool(ENV_NATIVE_ACCESS, &v)?;
        }
        if let Some(v) = lookup(ENV_ARG_STACK_WORDS) {
            config.arg_stack_words = match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidSize {
                        key: ENV_ARG_STACK_WORDS,
                        value: v,
                    });
                }
            };
        }
        Ok(config)
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_defaults_without_env() {
        let config = BridgeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert!(config.boxing_fast_path);
        assert_eq!(config.arg_stack_words, DEFAULT_ARG_STACK_WORDS);
    }

    #[test]
    fn test_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            (ENV_FAST_PATHS, "off"),
            (ENV_TRACE_UPCALLS, "1"),
            (ENV_ARG_STACK_WORDS, "64"),
            (ENV_NATIVE_ACCESS, "false"),
        ]))
        .unwrap();
        assert!(!config.boxing_fast_path);
        assert!(config.trace_upcalls);
        assert!(!config.debug_handles);
        assert_eq!(config.arg_stack_words, 64);
        assert!(!config.allow_native_access);
    }

    #[test]
    fn test_invalid_values() {
        let err = BridgeConfig::from_lookup(lookup(&[(ENV_DEBUG_HANDLES, "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { key: ENV_DEBUG_HANDLES, .. }));

        let err = BridgeConfig::from_lookup(lookup(&[(ENV_ARG_STACK_WORDS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSize { .. }));
        assert!(err.to_string().contains(ENV_ARG_STACK_WORDS));
    }
}

//! Isolate configuration.
//!
//! This module defines the settings applied when an isolate thread is
//! spawned: heap limits, an optional execution timeout, and a bootstrap script
//! that runs in every new context.

use crate::runtime::error::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Configuration for a single V8 isolate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsolateConfig {
    /// Maximum heap size in bytes (None = V8 default)
    pub max_heap_size: Option<usize>,

    /// Initial heap size in bytes (None = V8 default)
    pub initial_heap_size: Option<usize>,

    /// Upper bound on a single top-level evaluation.
    #[serde(
        rename = "execution_timeout_ms",
        deserialize_with = "deserialize_millis"
    )]
    pub execution_timeout: Option<Duration>,

    /// Script run in every context right after creation.
    pub bootstrap_script: Option<String>,

    /// Prefix for the isolate thread name (default `jsbridge-isolate`).
    pub thread_name: Option<String>,
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}

impl IsolateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = Some(bytes);
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn with_bootstrap(mut self, source: impl Into<String>) -> Self {
        self.bootstrap_script = Some(source.into());
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Reject settings V8 cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.initial_heap_size.is_some() && self.max_heap_size.is_none() {
            return Err(Error::Config(
                "initial_heap_size requires max_heap_size to be set as well".to_string(),
            ));
        }

        if let (Some(initial), Some(max)) = (self.initial_heap_size, self.max_heap_size) {
            if initial > max {
                return Err(Error::Config(format!(
                    "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                    initial, max
                )));
            }
        }

        if self.execution_timeout == Some(Duration::ZERO) {
            return Err(Error::Config(
                "execution_timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub(crate) fn create_params(&self) -> rusty_v8::CreateParams {
        match self.max_heap_size {
            Some(max) => {
                rusty_v8::CreateParams::default().heap_limits(self.initial_heap_size.unwrap_or(0), max)
            }
            None => rusty_v8::CreateParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IsolateConfig::default();
        assert!(config.max_heap_size.is_none());
        assert!(config.initial_heap_size.is_none());
        assert!(config.execution_timeout.is_none());
        assert!(config.bootstrap_script.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = IsolateConfig::new()
            .with_max_heap_size(100 * 1024 * 1024)
            .with_initial_heap_size(1024 * 1024)
            .with_execution_timeout(Duration::from_secs(30))
            .with_bootstrap("globalThis.ready = true;");

        assert_eq!(config.max_heap_size, Some(100 * 1024 * 1024));
        assert_eq!(config.execution_timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            config.bootstrap_script.as_deref(),
            Some("globalThis.ready = true;")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_initial_heap_requires_max() {
        let config = IsolateConfig::new().with_initial_heap_size(1024);
        let err = config.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains("initial_heap_size requires max_heap_size"));
    }

    #[test]
    fn test_initial_heap_cannot_exceed_max() {
        let config = IsolateConfig::new()
            .with_max_heap_size(1024)
            .with_initial_heap_size(4096);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cannot exceed max_heap_size"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = IsolateConfig::new().with_execution_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_deserialize_from_json() {
        let config: IsolateConfig = serde_json::from_str(
            r#"{"max_heap_size": 67108864, "execution_timeout_ms": 1500, "bootstrap_script": "var x = 1;"}"#,
        )
        .unwrap();
        assert_eq!(config.max_heap_size, Some(64 * 1024 * 1024));
        assert_eq!(config.execution_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.bootstrap_script.as_deref(), Some("var x = 1;"));

        let unknown = serde_json::from_str::<IsolateConfig>(r#"{"inspector": true}"#);
        assert!(unknown.is_err());
    }
}

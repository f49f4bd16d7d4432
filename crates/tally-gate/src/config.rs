// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thread spawner configuration.

use std::env;

/// Environment variable overriding [`SpawnConfig::name_prefix`].
pub const ENV_THREAD_PREFIX: &str = "TALLY_GATE_THREAD_PREFIX";
/// Environment variable overriding [`SpawnConfig::stack_size`], in bytes.
pub const ENV_STACK_SIZE: &str = "TALLY_GATE_STACK_SIZE";

/// How [`crate::spawn::ThreadSpawner`] creates threads for tracked tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SpawnConfig {
    /// Thread names are `{prefix}-{n}`. `None` leaves threads unnamed.
    pub name_prefix: Option<String>,
    /// Stack size in bytes. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            name_prefix: Some("tally-task".to_string()),
            stack_size: None,
        }
    }
}

impl SpawnConfig {
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn unnamed(mut self) -> Self {
        self.name_prefix = None;
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Defaults, overridden by `TALLY_GATE_*` environment variables.
    ///
    /// An unparsable stack size is ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(prefix) = lookup(ENV_THREAD_PREFIX) {
            config.name_prefix = if prefix.is_empty() { None } else { Some(prefix) };
        }

        if let Some(raw) = lookup(ENV_STACK_SIZE) {
            match raw.trim().parse::<usize>() {
                Ok(bytes) if bytes > 0 => config.stack_size = Some(bytes),
                _ => tracing::warn!(value = %raw, "ignoring invalid {}", ENV_STACK_SIZE),
            }
        }

        config
    }
}

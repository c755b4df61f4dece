//! Runtime tunables for a [`Target`](crate::Target).

use std::time::Duration;

/// Default interval between retirement polls.
pub const DEFAULT_RETIRE_INTERVAL: Duration = Duration::from_millis(50);

/// Default delay before re-probing a deleted or renamed watched path.
pub const DEFAULT_PROBE_DELAY: Duration = Duration::from_millis(50);

/// Default name of the trigger loop thread.
pub const DEFAULT_THREAD_NAME: &str = "hotload-trigger";

/// Tunables shared by the swap buffer and the trigger loop.
///
/// With the `serde` feature enabled, durations are (de)serialized as
/// milliseconds so the settings can live in a regular config file:
///
/// ```toml
/// retire_interval_ms = 20
/// debounce_ms = 100
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Settings {
    /// How often a retiring handle is polled for zero borrowers.
    #[cfg_attr(feature = "serde", serde(rename = "retire_interval_ms", with = "millis"))]
    pub retire_interval: Duration,

    /// Delay before re-probing a watched path that was deleted or renamed.
    #[cfg_attr(feature = "serde", serde(rename = "probe_delay_ms", with = "millis"))]
    pub probe_delay: Duration,

    /// Quiet period after a file event before reloading. Zero reloads on
    /// every event.
    #[cfg_attr(feature = "serde", serde(rename = "debounce_ms", with = "millis"))]
    pub debounce: Duration,

    /// Name given to the trigger loop thread.
    pub thread_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retire_interval: DEFAULT_RETIRE_INTERVAL,
            probe_delay: DEFAULT_PROBE_DELAY,
            debounce: Duration::ZERO,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

#[cfg(feature = "serde")]
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

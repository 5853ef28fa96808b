//! Session policy configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default time a negotiated session waits for its control channel to open
pub const DEFAULT_AUTO_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay before answering an ICE exchange, letting local candidates
/// accumulate
pub const DEFAULT_ICE_GATHERING_DELAY: Duration = Duration::from_millis(200);

/// Timing policy shared by server and client sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "millis")]
    pub auto_close_timeout: Duration,
    #[serde(with = "millis")]
    pub ice_gathering_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_close_timeout: DEFAULT_AUTO_CLOSE_TIMEOUT,
            ice_gathering_delay: DEFAULT_ICE_GATHERING_DELAY,
        }
    }
}

impl SessionConfig {
    pub fn with_auto_close_timeout(mut self, timeout: Duration) -> Self {
        self.auto_close_timeout = timeout;
        self
    }

    pub fn with_ice_gathering_delay(mut self, delay: Duration) -> Self {
        self.ice_gathering_delay = delay;
        self
    }
}

/// Durations as integer milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

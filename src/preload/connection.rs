//! Connection speed and the concurrency it allows.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionSpeed {
    Slow,
    #[default]
    Medium,
    Fast,
}

impl ConnectionSpeed {
    /// Loads allowed in flight at once.
    pub fn max_concurrent(self) -> usize {
        match self {
            Self::Slow => 1,
            Self::Medium => 2,
            Self::Fast => 4,
        }
    }

    /// Map a Network Information `effectiveType`; unknown values count as
    /// medium.
    pub fn from_effective_type(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "slow" | "slow-2g" | "2g" => Self::Slow,
            "fast" | "4g" => Self::Fast,
            _ => Self::Medium,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Slow => "slow",
            Self::Medium => "medium",
            Self::Fast => "fast",
        }
    }
}

impl FromStr for ConnectionSpeed {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_effective_type(value))
    }
}

impl fmt::Display for ConnectionSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable connection speed. The preloader reads it on every
/// dispatch, so updates apply to the next item handed out.
#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    sender: Arc<watch::Sender<ConnectionSpeed>>,
}

impl ConnectionMonitor {
    pub fn new(speed: ConnectionSpeed) -> Self {
        Self {
            sender: Arc::new(watch::Sender::new(speed)),
        }
    }

    pub fn current(&self) -> ConnectionSpeed {
        *self.sender.borrow()
    }

    pub fn set(&self, speed: ConnectionSpeed) {
        self.sender.send_replace(speed);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSpeed> {
        self.sender.subscribe()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new(ConnectionSpeed::default())
    }
}

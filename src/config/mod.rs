//! Push subsystem configuration
//!
//! All knobs have defaults matching the observed design; embedders can
//! override them from a TOML fragment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::transport::TransportKind;
use crate::types::error::Result;

/// Push configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Bounded wait for a transport provider to answer a registration
    /// request. After this the attempt is treated as failed, never left
    /// pending.
    #[serde(default = "default_registration_timeout_secs")]
    pub registration_timeout_secs: u64,

    /// Cadence of the periodic fallback refresh when push is unavailable.
    #[serde(default = "default_fallback_interval_minutes")]
    pub fallback_interval_minutes: u64,

    /// Tolerance window the external job system may add to the cadence.
    #[serde(default = "default_fallback_tolerance_minutes")]
    pub fallback_tolerance_minutes: u64,

    /// Minimum acceptable distance of the server-assigned `expires` from
    /// now. The standard mandates 48h; anything under this floor gets a
    /// renewal scheduled instead of being trusted.
    #[serde(default = "default_minimum_expiry_hours")]
    pub minimum_expiry_hours: i64,

    /// Fixed transport preference order.
    #[serde(default = "default_transport_preference")]
    pub transport_preference: Vec<TransportKind>,
}

fn default_registration_timeout_secs() -> u64 {
    30
}

fn default_fallback_interval_minutes() -> u64 {
    15
}

fn default_fallback_tolerance_minutes() -> u64 {
    20
}

fn default_minimum_expiry_hours() -> i64 {
    36
}

fn default_transport_preference() -> Vec<TransportKind> {
    vec![TransportKind::Distributor, TransportKind::CloudMessaging]
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            registration_timeout_secs: default_registration_timeout_secs(),
            fallback_interval_minutes: default_fallback_interval_minutes(),
            fallback_tolerance_minutes: default_fallback_tolerance_minutes(),
            minimum_expiry_hours: default_minimum_expiry_hours(),
            transport_preference: default_transport_preference(),
        }
    }
}

impl PushConfig {
    /// Parse a configuration from a TOML fragment, filling in defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_secs(self.fallback_interval_minutes * 60)
    }

    pub fn fallback_tolerance(&self) -> Duration {
        Duration::from_secs(self.fallback_tolerance_minutes * 60)
    }

    pub fn minimum_expiry(&self) -> chrono::Duration {
        chrono::Duration::hours(self.minimum_expiry_hours)
    }
}

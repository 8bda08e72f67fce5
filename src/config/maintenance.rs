//! Retention loop configuration.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Events older than this are trimmed. Default: 30.
    pub retention_days: u32,
    /// Seconds between retention passes. Default: 3600.
    pub interval_secs: u64,
    /// Restrict trimming to these types. Empty trims every type.
    pub event_types: Vec<String>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            interval_secs: 3600,
            event_types: Vec::new(),
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn event_types(&self) -> Option<&[String]> {
        (!self.event_types.is_empty()).then_some(self.event_types.as_slice())
    }
}

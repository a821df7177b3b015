use crate::link::LinkState;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

/// Snapshot of the bridge for the display layer. Written as JSON; the core
/// does not depend on anyone reading it.
#[derive(Serialize, Deserialize, Clone)]
pub struct BridgeStatus {
    pub timestamp: f64,
    pub link_state: LinkState,
    pub device_name: String,
    pub speed_mph: f64,
    pub raw_mph: f64,
    pub source: String,
    pub gps_fixes: u64,
    pub motion_samples: u64,
    pub uptime_seconds: u64,
}

impl BridgeStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            link_state: LinkState::Idle,
            device_name: String::new(),
            speed_mph: 0.0,
            raw_mph: 0.0,
            source: String::new(),
            gps_fixes: 0,
            motion_samples: 0,
            uptime_seconds: 0,
        }
    }

    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for BridgeStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

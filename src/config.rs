//! Keyring configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::core::account::DEFAULT_PER_PAGE;
use crate::core::paths::HdPathType;

/// Tunables the embedder may override; the defaults match the behavior a
/// wallet expects out of the box. Fixed attempt counts and fixed delays,
/// deliberately, so device retry timing stays predictable for a human.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeyringConfig {
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub per_page: usize,
    pub default_hd_path_type: HdPathType,
}

impl Default for KeyringConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 3,
            reconnect_delay_ms: 1_000,
            per_page: DEFAULT_PER_PAGE,
            default_hd_path_type: HdPathType::Bip44,
        }
    }
}

impl KeyringConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

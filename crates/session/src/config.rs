use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::engine::EngineType;

/// Knobs for the session manager. All fields have working defaults;
/// conversion front-ends usually only ever touch `dev_mode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of pre-warmed pages kept per engine type.
    pub pool_capacity: usize,
    /// Intercepted-request count after which a pooled page is reloaded.
    pub request_ceiling: u64,
    /// Upper bound for page navigations (warm-up and reloads).
    pub nav_timeout_ms: u64,
    /// Emit handle/process/context introspection when page creation fails.
    pub dev_mode: bool,
    /// Working data directory handed to engine processes. Each engine type
    /// gets its own subdirectory; the orphan reaper owns cleanup of the
    /// whole tree.
    pub data_dir: PathBuf,
    /// Per-process stamp injected as a launch argument so the reaper can
    /// tell our engine processes apart from the user's own browsers.
    pub launch_stamp: String,
    /// Explicit executable paths, taking precedence over the per-OS
    /// search table and environment overrides.
    pub executable_overrides: HashMap<EngineType, PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 5,
            request_ceiling: 100,
            nav_timeout_ms: 10_000,
            dev_mode: false,
            data_dir: std::env::temp_dir().join("quickform-session"),
            launch_stamp: default_launch_stamp(),
            executable_overrides: HashMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn nav_timeout(&self) -> Duration {
        Duration::from_millis(self.nav_timeout_ms)
    }
}

/// Millisecond timestamp taken at construction; monotonically
/// distinguishes this run from leftover processes of previous ones.
fn default_launch_stamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
        .to_string()
}

//! Engine identity: which browser binary to run, what its processes are
//! called, and which flags it is launched with.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};

/// Launch-marker flag injected into every engine we spawn. The flag name
/// identifies the tool; the value distinguishes this run from earlier ones.
pub const MARKER_FLAG: &str = "quickform-stamp";

/// Neutral location warmed pages are parked at.
pub const BLANK_PAGE: &str = "about:blank";

/// Builds the full marker argument for a given stamp.
pub fn marker_arg(stamp: &str) -> String {
    format!("--{MARKER_FLAG}={stamp}")
}

/// A supported headless browser engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Chromium,
    Firefox,
}

impl EngineType {
    /// All supported engines, in tie-break order: when a caller has no
    /// preference, the first valid handle in this order wins.
    pub const ALL: [EngineType; 2] = [EngineType::Chromium, EngineType::Firefox];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::Chromium => "chromium",
            EngineType::Firefox => "firefox",
        }
    }

    /// Process names this engine shows up under in the OS process table.
    pub fn process_names(&self) -> &'static [&'static str] {
        match self {
            EngineType::Chromium => &[
                "chrome",
                "chromium",
                "chromium-browser",
                "google-chrome",
                "headless_shell",
            ],
            EngineType::Firefox => &["firefox", "firefox-bin", "firefox-esr"],
        }
    }

    /// Environment variable consulted before the per-OS search table.
    fn env_override(&self) -> &'static str {
        match self {
            EngineType::Chromium => "QUICKFORM_CHROMIUM_PATH",
            EngineType::Firefox => "QUICKFORM_FIREFOX_PATH",
        }
    }

    /// Known install locations, most specific first. Includes the per-user
    /// cache directory engine binaries get installed into.
    fn executable_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Some(cache) = dirs::cache_dir() {
            let installed = cache.join("quickform").join("engines").join(self.as_str());
            candidates.push(match self {
                EngineType::Chromium => installed.join(exe_name("chrome")),
                EngineType::Firefox => installed.join(exe_name("firefox")),
            });
        }

        #[cfg(target_os = "linux")]
        candidates.extend(
            match self {
                EngineType::Chromium => &[
                    "/usr/bin/chromium",
                    "/usr/bin/chromium-browser",
                    "/usr/bin/google-chrome",
                    "/usr/bin/google-chrome-stable",
                    "/snap/bin/chromium",
                ][..],
                EngineType::Firefox => &["/usr/bin/firefox", "/usr/bin/firefox-esr", "/snap/bin/firefox"][..],
            }
            .iter()
            .map(PathBuf::from),
        );

        #[cfg(target_os = "macos")]
        candidates.extend(
            match self {
                EngineType::Chromium => &[
                    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
                    "/Applications/Chromium.app/Contents/MacOS/Chromium",
                ][..],
                EngineType::Firefox => &["/Applications/Firefox.app/Contents/MacOS/firefox"][..],
            }
            .iter()
            .map(PathBuf::from),
        );

        #[cfg(windows)]
        candidates.extend(
            match self {
                EngineType::Chromium => &[
                    "C:\\Program Files\\Google\\Chrome\\Application\\chrome.exe",
                    "C:\\Program Files (x86)\\Google\\Chrome\\Application\\chrome.exe",
                    "C:\\Program Files\\Chromium\\Application\\chrome.exe",
                ][..],
                EngineType::Firefox => &[
                    "C:\\Program Files\\Mozilla Firefox\\firefox.exe",
                    "C:\\Program Files (x86)\\Mozilla Firefox\\firefox.exe",
                ][..],
            }
            .iter()
            .map(PathBuf::from),
        );

        candidates
    }

    /// Resolves the engine executable, failing fast with the list of
    /// searched locations when nothing is installed.
    ///
    /// Order: config override, environment variable, per-OS table.
    pub fn find_executable(&self, config: &SessionConfig) -> Result<PathBuf> {
        if let Some(path) = config.executable_overrides.get(self) {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(SessionError::Installation {
                engine: *self,
                searched: vec![path.clone()],
            });
        }

        let mut searched = Vec::new();

        if let Ok(path) = std::env::var(self.env_override()) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
            searched.push(path);
        }

        for candidate in self.executable_candidates() {
            if candidate.exists() {
                return Ok(candidate);
            }
            searched.push(candidate);
        }

        Err(SessionError::Installation {
            engine: *self,
            searched,
        })
    }

    /// Arguments for a local spawn: sandboxing disabled (container
    /// environments) plus the run-unique launch marker.
    pub fn launch_args(&self, stamp: &str) -> Vec<String> {
        vec![
            "--no-sandbox".to_string(),
            "--disable-setuid-sandbox".to_string(),
            marker_arg(stamp),
        ]
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn exe_name(base: &str) -> String {
    if cfg!(windows) {
        format!("{base}.exe")
    } else {
        base.to_string()
    }
}

//! Cleanup of engine processes left behind by previous, improperly
//! terminated runs. Everything here is best-effort: errors are logged and
//! swallowed, never surfaced to a launch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::engine::{marker_arg, EngineType, MARKER_FLAG};

/// How long a process gets between the graceful and the forced signal.
const KILL_GRACE: Duration = Duration::from_millis(500);

pub struct OrphanReaper {
    data_dir: PathBuf,
    /// Full marker argument of the *current* run; processes carrying it
    /// are ours and alive, never orphans.
    current_marker: String,
}

impl OrphanReaper {
    pub fn new(data_dir: PathBuf, launch_stamp: &str) -> Self {
        Self {
            data_dir,
            current_marker: marker_arg(launch_stamp),
        }
    }

    /// Terminates stale engine processes from earlier runs, then removes
    /// the working data directory if nothing holds it anymore.
    ///
    /// Never fails: a launch attempt must not be blocked by hygiene work.
    pub async fn reap(&self) {
        let data_dir = self.data_dir.clone();
        let current_marker = self.current_marker.clone();

        // Process-table scans and the kill grace period are blocking work.
        let result = tokio::task::spawn_blocking(move || {
            reap_blocking(&data_dir, &current_marker);
        })
        .await;

        if let Err(e) = result {
            warn!(error = %e, "orphan reaper task failed");
        }
    }
}

fn reap_blocking(data_dir: &Path, current_marker: &str) {
    let data_dir_str = data_dir.display().to_string();
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let orphans: Vec<Pid> = sys
        .processes()
        .iter()
        .filter(|(_, process)| {
            let name = process.name().to_string_lossy();
            let cmd: Vec<String> = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            is_stale_engine(&name, &cmd, &data_dir_str, current_marker)
        })
        .map(|(pid, _)| *pid)
        .collect();

    if !orphans.is_empty() {
        debug!(count = orphans.len(), "terminating stale engine processes");
        for pid in &orphans {
            if let Some(process) = sys.process(*pid) {
                terminate_gracefully(process);
            }
        }

        std::thread::sleep(KILL_GRACE);
        sys.refresh_processes(ProcessesToUpdate::Some(&orphans), true);
        for pid in &orphans {
            // Still alive after the grace period: force it. A process that
            // already exited simply is not in the refreshed table.
            if let Some(process) = sys.process(*pid) {
                if !process.kill() {
                    warn!(pid = pid.as_u32(), "failed to force-kill stale engine process");
                }
            }
        }
        sys.refresh_processes(ProcessesToUpdate::All, true);
    }

    remove_data_dir_if_unheld(&mut sys, data_dir, &data_dir_str);
}

#[cfg(not(windows))]
fn terminate_gracefully(process: &sysinfo::Process) {
    if process.kill_with(sysinfo::Signal::Term).is_none() {
        // Platform without SIGTERM support in sysinfo; fall through to the
        // forced kill after the grace period.
        debug!(pid = process.pid().as_u32(), "graceful termination unavailable");
    }
}

#[cfg(windows)]
fn terminate_gracefully(process: &sysinfo::Process) {
    // taskkill /T takes the whole process tree down; engines fan out into
    // renderer and GPU children.
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &process.pid().as_u32().to_string(), "/T", "/F"])
        .output();
}

/// Removes the working data directory, but only when no surviving process
/// references it. A locked directory is left for the next pass.
fn remove_data_dir_if_unheld(sys: &mut System, data_dir: &Path, data_dir_str: &str) {
    if !data_dir.exists() {
        return;
    }

    let held = sys.processes().values().any(|process| {
        process
            .cmd()
            .iter()
            .any(|arg| arg.to_string_lossy().contains(data_dir_str))
    });
    if held {
        warn!(dir = %data_dir.display(), "working data directory still in use, skipping removal");
        return;
    }

    match std::fs::remove_dir_all(data_dir) {
        Ok(()) => debug!(dir = %data_dir.display(), "removed working data directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(dir = %data_dir.display(), error = %e, "could not remove working data directory");
        }
    }
}

/// Pure matching rule, split out for tests.
///
/// A process is a stale engine iff its name matches a known engine process
/// name AND its command line ties it to this tool (working data directory
/// or launch-marker flag) AND it does not carry the current run's marker.
fn is_stale_engine(name: &str, cmd: &[String], data_dir: &str, current_marker: &str) -> bool {
    let engine_process = EngineType::ALL
        .iter()
        .any(|ty| ty.process_names().iter().any(|known| name.contains(known)));
    if !engine_process {
        return false;
    }

    let cmdline = cmd.join(" ");
    if cmdline.contains(current_marker) {
        return false;
    }
    cmdline.contains(data_dir) || cmdline.contains(&format!("--{MARKER_FLAG}="))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA_DIR: &str = "/tmp/quickform-session";
    const CURRENT: &str = "--quickform-stamp=999";

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn stale_process_with_our_data_dir_matches() {
        let cmdline = cmd(&["/usr/bin/chromium", "--headless", "--user-data-dir=/tmp/quickform-session/chromium"]);
        assert!(is_stale_engine("chromium", &cmdline, DATA_DIR, CURRENT));
    }

    #[test]
    fn stale_process_with_old_marker_matches() {
        let cmdline = cmd(&["/usr/bin/firefox", "--quickform-stamp=123"]);
        assert!(is_stale_engine("firefox-bin", &cmdline, DATA_DIR, CURRENT));
    }

    #[test]
    fn unrelated_user_browser_is_left_alone() {
        let cmdline = cmd(&["/usr/bin/google-chrome", "--profile-directory=Default"]);
        assert!(!is_stale_engine("chrome", &cmdline, DATA_DIR, CURRENT));
    }

    #[test]
    fn current_run_process_is_not_an_orphan() {
        let cmdline = cmd(&["/usr/bin/chromium", CURRENT, "--user-data-dir=/tmp/quickform-session/chromium"]);
        assert!(!is_stale_engine("chromium", &cmdline, DATA_DIR, CURRENT));
    }

    #[test]
    fn non_engine_process_never_matches() {
        let cmdline = cmd(&["/usr/bin/vim", "/tmp/quickform-session/notes.txt"]);
        assert!(!is_stale_engine("vim", &cmdline, DATA_DIR, CURRENT));
    }

    #[test]
    fn unheld_directory_is_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("work");
        std::fs::create_dir_all(data_dir.join("chromium")).unwrap();

        let mut sys = System::new();
        remove_data_dir_if_unheld(&mut sys, &data_dir, &data_dir.display().to_string());
        assert!(!data_dir.exists());
    }

    #[tokio::test]
    async fn reap_is_best_effort_on_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let reaper = OrphanReaper::new(tmp.path().join("never-created"), "42");
        // Must not panic or error regardless of state.
        reaper.reap().await;
    }
}

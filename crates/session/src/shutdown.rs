//! Binds process termination to [`SessionManager::shutdown`], so engine
//! processes are released even when the host program is interrupted.

use std::sync::Arc;

use tracing::{info, warn};

use crate::session::SessionManager;

/// Registers `manager.shutdown()` against Ctrl-C plus, on Unix, SIGTERM
/// and SIGHUP. Each manager registers at most once; repeat calls for the
/// same manager are no-ops, and the shutdown routine itself is idempotent.
/// Without a running Tokio runtime no listeners can be installed and the
/// call becomes a logged no-op.
pub fn on_termination(manager: Arc<SessionManager>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("no async runtime available, termination hook not installed");
        return;
    };
    if !manager.claim_termination_hook() {
        return;
    }
    let _enter = runtime.enter();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::hangup(), "SIGHUP"),
        ] {
            match signal(kind) {
                Ok(mut stream) => {
                    let manager = Arc::clone(&manager);
                    runtime.spawn(async move {
                        if stream.recv().await.is_some() {
                            info!(signal = name, "termination signal received, closing engines");
                            manager.shutdown().await;
                        }
                    });
                }
                Err(e) => {
                    warn!(signal = name, error = %e, "could not install signal listener");
                }
            }
        }
    }

    let ctrl_c_manager = manager;
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, closing engines");
            ctrl_c_manager.shutdown().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::testing::MockDriver;

    fn manager() -> Arc<SessionManager> {
        Arc::new(SessionManager::with_driver(
            SessionConfig::default(),
            MockDriver::new(),
        ))
    }

    #[tokio::test]
    async fn registration_is_repeatable() {
        let manager = manager();
        // Both calls must succeed without panicking or double-installing.
        on_termination(Arc::clone(&manager));
        on_termination(Arc::clone(&manager));
        assert!(!manager.claim_termination_hook());
    }

    #[tokio::test]
    async fn each_manager_gets_its_own_registration() {
        let first = manager();
        let second = manager();
        on_termination(Arc::clone(&first));
        on_termination(Arc::clone(&second));
        // Both managers hold a claimed hook, independently.
        assert!(!first.claim_termination_hook());
        assert!(!second.claim_termination_hook());
    }

    #[test]
    fn no_panic_outside_a_runtime() {
        let manager = manager();
        on_termination(Arc::clone(&manager));
        // Nothing was installed, so the claim is still available.
        assert!(manager.claim_termination_hook());
    }
}

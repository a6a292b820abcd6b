//! Public surface of the session manager. Conversion routines only ever
//! talk to [`SessionManager`]: acquire an engine, borrow a page, hand it
//! back, shut everything down at process end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::cdp::CdpDriver;
use crate::config::SessionConfig;
use crate::driver::{EngineDriver, EngineHandle};
use crate::engine::EngineType;
use crate::error::Result;
use crate::launcher::LaunchCoordinator;
use crate::pool::{PageLease, PagePool};

/// One instance per process, constructed explicitly and passed to the
/// conversion routines (no ambient globals).
pub struct SessionManager {
    coordinator: LaunchCoordinator,
    pool: Arc<PagePool>,
    termination_hook: AtomicBool,
}

impl SessionManager {
    /// Production manager driving engines over the DevTools protocol.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_driver(config, Arc::new(CdpDriver::new()))
    }

    /// Manager with an injected driver; the seam tests and embedders use.
    pub fn with_driver(config: SessionConfig, driver: Arc<dyn EngineDriver>) -> Self {
        let pool = Arc::new(PagePool::new(config.clone()));
        let coordinator = LaunchCoordinator::new(driver, config, Arc::clone(&pool));
        Self {
            coordinator,
            pool,
            termination_hook: AtomicBool::new(false),
        }
    }

    /// Claims this manager's one termination-hook registration. Returns
    /// false if a hook was already installed for this manager.
    pub(crate) fn claim_termination_hook(&self) -> bool {
        !self.termination_hook.swap(true, Ordering::SeqCst)
    }

    /// Returns a live engine handle, launching (or connecting, when
    /// `remote_endpoint` is given) as needed. With no `engine` preference
    /// the first available engine wins.
    pub async fn acquire_engine(
        &self,
        engine: Option<EngineType>,
        remote_endpoint: Option<&str>,
    ) -> Result<(Arc<dyn EngineHandle>, EngineType)> {
        self.coordinator.acquire(engine, remote_endpoint).await
    }

    /// Borrows a ready page from the pool of the requested (or any live)
    /// engine, acquiring the engine first when necessary.
    pub async fn get_page(&self, engine: Option<EngineType>) -> Result<PageLease> {
        let (handle, engine) = self.coordinator.acquire(engine, None).await?;
        self.pool.checkout(&handle, engine).await
    }

    /// Returns a borrowed page. Pooled pages are reset and reused;
    /// overflow pages are closed.
    pub async fn release_page(&self, lease: PageLease) {
        self.pool.release(lease).await;
    }

    /// Tears down every engine and pooled page. Idempotent: a second call
    /// finds nothing to do and succeeds. Remote sessions are detached,
    /// never closed — their processes belong to someone else.
    pub async fn shutdown(&self) {
        let handles = self.coordinator.take_all();
        self.pool.clear_all().await;

        for (engine, handle) in handles {
            if handle.is_remote() {
                if let Err(e) = handle.disconnect().await {
                    warn!(engine = %engine, error = %e, "disconnect failed during shutdown");
                } else {
                    info!(engine = %engine, "remote engine session disconnected");
                }
            } else if let Err(e) = handle.close().await {
                warn!(engine = %engine, error = %e, "engine close failed during shutdown");
            } else {
                info!(engine = %engine, "engine closed");
            }
        }
    }
}

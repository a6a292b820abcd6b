//! Bounded cache of pre-warmed pages per engine type.
//!
//! The pool favors availability over strict capacity: when it runs dry, a
//! caller gets a freshly created overflow page that is closed (never
//! pooled) on release.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::driver::{EngineHandle, EnginePage};
use crate::engine::{EngineType, BLANK_PAGE};
use crate::error::{Result, SessionError};

/// Viewport pages are reset to before re-entering the pool.
pub const DEFAULT_VIEWPORT: (u32, u32) = (1280, 720);

/// A checked-out page. Exactly one caller owns a lease at a time; handing
/// it back goes through [`PagePool::release`].
pub struct PageLease {
    page: Arc<dyn EnginePage>,
    engine: EngineType,
    poolable: bool,
}

impl PageLease {
    pub fn page(&self) -> &Arc<dyn EnginePage> {
        &self.page
    }

    pub fn engine(&self) -> EngineType {
        self.engine
    }

    /// False for overflow pages created beyond pool capacity.
    pub fn is_poolable(&self) -> bool {
        self.poolable
    }
}

pub struct PagePool {
    config: SessionConfig,
    pools: Mutex<HashMap<EngineType, Vec<Arc<dyn EnginePage>>>>,
}

impl PagePool {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Fills the pool for `engine` with pre-warmed pages. Idempotent: a
    /// non-empty pool is left untouched. A creation failure propagates and
    /// leaves the pool empty (partial warm-ups are not kept).
    pub async fn warm(&self, handle: &Arc<dyn EngineHandle>, engine: EngineType) -> Result<()> {
        if !self.pools.lock().get(&engine).is_none_or(Vec::is_empty) {
            return Ok(());
        }

        let mut pages = Vec::with_capacity(self.config.pool_capacity);
        for _ in 0..self.config.pool_capacity {
            pages.push(self.prepare_page(handle).await?);
        }
        debug!(engine = %engine, count = pages.len(), "page pool warmed");
        self.pools.lock().insert(engine, pages);
        Ok(())
    }

    /// Pops a pooled page, reloading it first if it has served more than
    /// `request_ceiling` intercepted requests. An empty pool yields an
    /// overflow page instead of blocking.
    pub async fn checkout(
        &self,
        handle: &Arc<dyn EngineHandle>,
        engine: EngineType,
    ) -> Result<PageLease> {
        let pooled = self.pools.lock().get_mut(&engine).and_then(|pool| pool.pop());

        if let Some(page) = pooled {
            if page.request_count() > self.config.request_ceiling {
                debug!(
                    engine = %engine,
                    requests = page.request_count(),
                    ceiling = self.config.request_ceiling,
                    "request ceiling exceeded, reloading pooled page"
                );
                self.bounded(page.reload()).await?;
                page.reset_request_count();
            }
            return Ok(PageLease {
                page,
                engine,
                poolable: true,
            });
        }

        debug!(engine = %engine, "page pool empty, creating overflow page");
        let page = self.prepare_page(handle).await?;
        Ok(PageLease {
            page,
            engine,
            poolable: false,
        })
    }

    /// Returns a lease. Pooled pages get their viewport reset and re-enter
    /// the pool; overflow pages are closed. A page that fails the viewport
    /// reset is presumed broken and discarded instead of pooled.
    pub async fn release(&self, lease: PageLease) {
        let PageLease {
            page,
            engine,
            poolable,
        } = lease;

        if poolable {
            let (width, height) = DEFAULT_VIEWPORT;
            if let Err(e) = page.set_viewport(width, height).await {
                warn!(engine = %engine, error = %e, "viewport reset failed, dropping page");
                let _ = page.close().await;
                return;
            }
            // The pool may have been re-warmed (crash, evict, relaunch)
            // while this lease was outstanding; never exceed capacity.
            let excess = {
                let mut pools = self.pools.lock();
                let pool = pools.entry(engine).or_default();
                if pool.len() < self.config.pool_capacity {
                    pool.push(page);
                    None
                } else {
                    Some(page)
                }
            };
            if let Some(page) = excess {
                debug!(engine = %engine, "pool already at capacity, closing returned page");
                let _ = page.close().await;
            }
        } else if let Err(e) = page.close().await {
            debug!(engine = %engine, error = %e, "overflow page close failed");
        }
    }

    /// Closes and forgets every pooled page for `engine`. Used when the
    /// engine handle goes away; close failures are expected then.
    pub async fn clear(&self, engine: EngineType) {
        let pages = self.pools.lock().remove(&engine).unwrap_or_default();
        for page in pages {
            let _ = page.close().await;
        }
    }

    pub async fn clear_all(&self) {
        let drained: Vec<_> = {
            let mut pools = self.pools.lock();
            pools.drain().collect()
        };
        for (_, pages) in drained {
            for page in pages {
                let _ = page.close().await;
            }
        }
    }

    /// Number of idle pages currently pooled for `engine`.
    pub fn pooled_count(&self, engine: EngineType) -> usize {
        self.pools.lock().get(&engine).map_or(0, Vec::len)
    }

    /// Creates one ready-to-use page: interception on, parked at a blank
    /// location within the navigation budget.
    async fn prepare_page(&self, handle: &Arc<dyn EngineHandle>) -> Result<Arc<dyn EnginePage>> {
        let page = match handle.new_page().await {
            Ok(page) => page,
            Err(e) => {
                if self.config.dev_mode {
                    debug!(
                        connected = handle.connected(),
                        has_process = handle.has_process(),
                        contexts = handle.context_count(),
                        remote = handle.is_remote(),
                        "page creation failed; handle state"
                    );
                }
                return Err(e);
            }
        };
        page.enable_request_interception().await?;
        self.bounded(page.goto(BLANK_PAGE)).await?;
        Ok(page)
    }

    async fn bounded<F>(&self, fut: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        match tokio::time::timeout(self.config.nav_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::NavigationTimeout(self.config.nav_timeout_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::testing::{MockDriver, MockHandle};

    fn config(capacity: usize) -> SessionConfig {
        SessionConfig {
            pool_capacity: capacity,
            ..SessionConfig::default()
        }
    }

    fn handle() -> Arc<dyn EngineHandle> {
        MockHandle::local(EngineType::Chromium)
    }

    #[tokio::test]
    async fn warm_fills_to_capacity_once() {
        let pool = PagePool::new(config(5));
        let handle = handle();

        pool.warm(&handle, EngineType::Chromium).await.unwrap();
        assert_eq!(pool.pooled_count(EngineType::Chromium), 5);

        // Second warm is a no-op.
        pool.warm(&handle, EngineType::Chromium).await.unwrap();
        assert_eq!(pool.pooled_count(EngineType::Chromium), 5);
    }

    #[tokio::test]
    async fn warmed_pages_are_intercepting_and_blank() {
        let pool = PagePool::new(config(2));
        let handle = MockHandle::local(EngineType::Chromium);
        let dyn_handle: Arc<dyn EngineHandle> = handle.clone();

        pool.warm(&dyn_handle, EngineType::Chromium).await.unwrap();
        for page in handle.pages() {
            assert!(page.interception_enabled());
            assert_eq!(page.navigations(), vec![BLANK_PAGE.to_string()]);
        }
    }

    #[tokio::test]
    async fn checkout_hands_out_distinct_pages() {
        let pool = PagePool::new(config(5));
        let handle = handle();
        pool.warm(&handle, EngineType::Chromium).await.unwrap();

        let mut seen = HashSet::new();
        let mut leases = Vec::new();
        for _ in 0..5 {
            let lease = pool.checkout(&handle, EngineType::Chromium).await.unwrap();
            assert!(lease.is_poolable());
            assert!(seen.insert(Arc::as_ptr(lease.page()) as *const () as usize));
            leases.push(lease);
        }
        assert_eq!(pool.pooled_count(EngineType::Chromium), 0);
    }

    #[tokio::test]
    async fn empty_pool_creates_overflow_page() {
        let pool = PagePool::new(config(1));
        let handle = MockHandle::local(EngineType::Chromium);
        let dyn_handle: Arc<dyn EngineHandle> = handle.clone();
        pool.warm(&dyn_handle, EngineType::Chromium).await.unwrap();

        let first = pool.checkout(&dyn_handle, EngineType::Chromium).await.unwrap();
        let overflow = pool.checkout(&dyn_handle, EngineType::Chromium).await.unwrap();
        assert!(first.is_poolable());
        assert!(!overflow.is_poolable());

        // The overflow page is closed on release, not pooled.
        let overflow_page = overflow.page().clone();
        pool.release(overflow).await;
        assert_eq!(pool.pooled_count(EngineType::Chromium), 0);
        let closed = handle
            .pages()
            .into_iter()
            .find(|p| {
                let a: Arc<dyn EnginePage> = p.clone();
                Arc::ptr_eq(&a, &overflow_page)
            })
            .unwrap();
        assert!(closed.is_closed());

        pool.release(first).await;
        assert_eq!(pool.pooled_count(EngineType::Chromium), 1);
    }

    #[tokio::test]
    async fn release_resets_viewport() {
        let pool = PagePool::new(config(1));
        let handle = MockHandle::local(EngineType::Chromium);
        let dyn_handle: Arc<dyn EngineHandle> = handle.clone();
        pool.warm(&dyn_handle, EngineType::Chromium).await.unwrap();

        let lease = pool.checkout(&dyn_handle, EngineType::Chromium).await.unwrap();
        pool.release(lease).await;

        let page = handle.pages().into_iter().next().unwrap();
        assert_eq!(page.viewport(), Some(DEFAULT_VIEWPORT));
        assert_eq!(pool.pooled_count(EngineType::Chromium), 1);
    }

    #[tokio::test]
    async fn ceiling_breach_reloads_exactly_once_and_resets() {
        let mut cfg = config(1);
        cfg.request_ceiling = 10;
        let pool = PagePool::new(cfg);
        let handle = MockHandle::local(EngineType::Chromium);
        let dyn_handle: Arc<dyn EngineHandle> = handle.clone();
        pool.warm(&dyn_handle, EngineType::Chromium).await.unwrap();

        let lease = pool.checkout(&dyn_handle, EngineType::Chromium).await.unwrap();
        let page = handle.pages().into_iter().next().unwrap();
        page.add_requests(11);
        pool.release(lease).await;

        let lease = pool.checkout(&dyn_handle, EngineType::Chromium).await.unwrap();
        assert_eq!(page.reload_count(), 1);
        assert_eq!(lease.page().request_count(), 0);
        pool.release(lease).await;

        // Below the ceiling: no further reload.
        let lease = pool.checkout(&dyn_handle, EngineType::Chromium).await.unwrap();
        assert_eq!(page.reload_count(), 1);
        drop(lease);
    }

    #[tokio::test]
    async fn release_after_a_rewarm_never_exceeds_capacity() {
        let pool = PagePool::new(config(1));
        let handle = MockHandle::local(EngineType::Chromium);
        let dyn_handle: Arc<dyn EngineHandle> = handle.clone();
        pool.warm(&dyn_handle, EngineType::Chromium).await.unwrap();

        let lease = pool.checkout(&dyn_handle, EngineType::Chromium).await.unwrap();
        // The drained pool gets re-warmed while the lease is outstanding.
        pool.warm(&dyn_handle, EngineType::Chromium).await.unwrap();
        assert_eq!(pool.pooled_count(EngineType::Chromium), 1);

        pool.release(lease).await;
        assert_eq!(pool.pooled_count(EngineType::Chromium), 1);
        // The returned page was closed instead of pooled past capacity.
        let closed = handle.pages().iter().filter(|p| p.is_closed()).count();
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn failed_page_creation_does_not_corrupt_the_pool() {
        let pool = PagePool::new(config(2));
        let handle = MockHandle::local(EngineType::Chromium);
        handle.fail_new_page(true);
        let dyn_handle: Arc<dyn EngineHandle> = handle.clone();

        let err = pool.warm(&dyn_handle, EngineType::Chromium).await.unwrap_err();
        assert!(matches!(err, SessionError::PageCreation(_)));
        assert_eq!(pool.pooled_count(EngineType::Chromium), 0);

        // Recovery: once creation works again the pool warms normally.
        handle.fail_new_page(false);
        pool.warm(&dyn_handle, EngineType::Chromium).await.unwrap();
        assert_eq!(pool.pooled_count(EngineType::Chromium), 2);
    }

    #[tokio::test]
    async fn clear_closes_pooled_pages() {
        let pool = PagePool::new(config(3));
        let handle = MockHandle::local(EngineType::Chromium);
        let dyn_handle: Arc<dyn EngineHandle> = handle.clone();
        pool.warm(&dyn_handle, EngineType::Chromium).await.unwrap();

        pool.clear(EngineType::Chromium).await;
        assert_eq!(pool.pooled_count(EngineType::Chromium), 0);
        assert!(handle.pages().iter().all(|p| p.is_closed()));
    }

    #[tokio::test]
    async fn pools_are_isolated_per_engine() {
        let pool = PagePool::new(config(2));
        let driver = MockDriver::new();
        let chromium = driver.mock_launch(EngineType::Chromium);
        let firefox = driver.mock_launch(EngineType::Firefox);
        let c: Arc<dyn EngineHandle> = chromium;
        let f: Arc<dyn EngineHandle> = firefox;

        pool.warm(&c, EngineType::Chromium).await.unwrap();
        assert_eq!(pool.pooled_count(EngineType::Chromium), 2);
        assert_eq!(pool.pooled_count(EngineType::Firefox), 0);

        pool.warm(&f, EngineType::Firefox).await.unwrap();
        pool.clear(EngineType::Chromium).await;
        assert_eq!(pool.pooled_count(EngineType::Firefox), 2);
    }
}

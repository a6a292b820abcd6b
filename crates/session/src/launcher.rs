//! Launch deduplication and handle caching.
//!
//! Any number of callers may race `acquire` for the same engine type; a
//! per-type launch ticket (a shared future) serializes them onto exactly
//! one OS-level launch, and everyone converges on the same handle.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::driver::{EngineDriver, EngineHandle, LaunchSpec};
use crate::engine::EngineType;
use crate::error::{Result, SessionError};
use crate::health;
use crate::pool::PagePool;
use crate::reaper::OrphanReaper;

/// Pending-launch token: resolves once the in-flight launch attempt for an
/// engine type finishes, successfully or not.
type LaunchTicket = Shared<BoxFuture<'static, ()>>;

type HandleMap = Arc<Mutex<HashMap<EngineType, Arc<dyn EngineHandle>>>>;
type TicketMap = Arc<Mutex<HashMap<EngineType, LaunchTicket>>>;

pub struct LaunchCoordinator {
    context: LaunchContext,
    tickets: TicketMap,
}

/// Everything one launch attempt needs. Cloned into the detached launch
/// task so the attempt outlives a cancelled caller.
#[derive(Clone)]
struct LaunchContext {
    driver: Arc<dyn EngineDriver>,
    config: SessionConfig,
    reaper: Arc<OrphanReaper>,
    pool: Arc<PagePool>,
    handles: HandleMap,
}

/// Clears the engine's ticket and wakes waiters when the launch attempt
/// finishes, however it finishes.
struct TicketGuard {
    tickets: TicketMap,
    engine: EngineType,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        self.tickets.lock().remove(&self.engine);
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl LaunchCoordinator {
    pub fn new(driver: Arc<dyn EngineDriver>, config: SessionConfig, pool: Arc<PagePool>) -> Self {
        let reaper = Arc::new(OrphanReaper::new(
            config.data_dir.clone(),
            &config.launch_stamp,
        ));
        Self {
            context: LaunchContext {
                driver,
                config,
                reaper,
                pool,
                handles: Arc::new(Mutex::new(HashMap::new())),
            },
            tickets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns a live handle for `engine`, or for any engine when no
    /// preference is given (first valid in tie-break order, else a
    /// parallel race across all supported engines).
    pub async fn acquire(
        &self,
        engine: Option<EngineType>,
        remote_endpoint: Option<&str>,
    ) -> Result<(Arc<dyn EngineHandle>, EngineType)> {
        if let Some(engine) = engine {
            let handle = self.acquire_engine(engine, remote_endpoint).await?;
            return Ok((handle, engine));
        }

        for engine in EngineType::ALL {
            if let Some(handle) = self.cached(engine) {
                return Ok((handle, engine));
            }
        }

        // Nothing usable: launch every supported engine in parallel and
        // take the first that comes up. Fails only when all engines fail.
        let attempts = EngineType::ALL.map(|engine| {
            async move {
                let handle = self.acquire_engine(engine, remote_endpoint).await?;
                Ok::<_, SessionError>((handle, engine))
            }
            .boxed()
        });
        let ((handle, engine), _remaining) = futures_util::future::select_ok(attempts).await?;
        Ok((handle, engine))
    }

    /// Single-engine acquisition. Bounded re-entrant loop: re-evaluate the
    /// cache, await any in-flight launch, otherwise become the launcher.
    async fn acquire_engine(
        &self,
        engine: EngineType,
        remote_endpoint: Option<&str>,
    ) -> Result<Arc<dyn EngineHandle>> {
        loop {
            if let Some(handle) = self.cached(engine) {
                return Ok(handle);
            }

            // Claim the ticket, or pick up the one already in flight.
            let claim = {
                let mut tickets = self.tickets.lock();
                match tickets.get(&engine) {
                    Some(pending) => Err(pending.clone()),
                    None => {
                        let (done_tx, done_rx) = oneshot::channel::<()>();
                        let ticket: LaunchTicket = done_rx.map(|_| ()).boxed().shared();
                        tickets.insert(engine, ticket);
                        Ok(done_tx)
                    }
                }
            };

            match claim {
                Err(pending) => {
                    // The in-flight launch may succeed (cache hit on the
                    // next pass) or fail (we claim the ticket ourselves).
                    debug!(engine = %engine, "awaiting in-flight launch");
                    pending.await;
                }
                Ok(done) => {
                    // The launch runs as a detached task: a caller dropped
                    // mid-await (the losing side of an any-engine race)
                    // must not strand a claimed ticket or a spawned
                    // process. The attempt always finishes, caches its
                    // handle, and the guard clears the ticket.
                    let context = self.context.clone();
                    let tickets = Arc::clone(&self.tickets);
                    let endpoint = remote_endpoint.map(str::to_string);
                    let task = tokio::spawn(async move {
                        let _ticket = TicketGuard {
                            tickets,
                            engine,
                            done: Some(done),
                        };
                        context.launch(engine, endpoint.as_deref()).await
                    });
                    return match task.await {
                        Ok(result) => result,
                        Err(e) => Err(SessionError::Driver(format!("launch task failed: {e}"))),
                    };
                }
            }
        }
    }

    /// Live cached handle for `engine`, dropping a dead one on the way.
    fn cached(&self, engine: EngineType) -> Option<Arc<dyn EngineHandle>> {
        let mut handles = self.context.handles.lock();
        match handles.get(&engine) {
            Some(handle) if health::is_live(Some(handle)) => Some(Arc::clone(handle)),
            Some(_) => {
                // A disconnected or crashed handle is treated as absent.
                handles.remove(&engine);
                None
            }
            None => None,
        }
    }

    /// Drains every cached handle for shutdown.
    pub fn take_all(&self) -> Vec<(EngineType, Arc<dyn EngineHandle>)> {
        self.context.handles.lock().drain().collect()
    }
}

impl LaunchContext {
    /// One launch attempt, performed under the ticket.
    async fn launch(
        &self,
        engine: EngineType,
        remote_endpoint: Option<&str>,
    ) -> Result<Arc<dyn EngineHandle>> {
        // Stale processes from a previous run hold profile locks that make
        // launches fail non-deterministically. Best-effort, never blocks.
        self.reaper.reap().await;

        let handle = match remote_endpoint {
            Some(endpoint) => {
                info!(engine = %engine, endpoint, "connecting to remote engine");
                self.driver.connect(engine, endpoint).await?
            }
            None => {
                let executable = engine.find_executable(&self.config)?;
                let spec = LaunchSpec {
                    engine,
                    executable,
                    args: engine.launch_args(&self.config.launch_stamp),
                    data_dir: self.config.data_dir.join(engine.as_str()),
                };
                info!(engine = %engine, "launching engine");
                self.driver.launch(&spec).await?
            }
        };

        // Warm before caching: a handle whose pool cannot be prepared is
        // torn down instead of being cached half-initialized.
        if let Err(e) = self.pool.warm(&handle, engine).await {
            warn!(engine = %engine, error = %e, "pool warm-up failed, discarding fresh handle");
            let _ = handle.close().await;
            return Err(e);
        }

        self.handles.lock().insert(engine, handle.clone());
        self.watch_disconnect(engine, handle.clone());
        Ok(handle)
    }

    /// Evicts the cached handle (and its pool) the moment it loses its
    /// connection, so the next `acquire` sees an absent handle.
    fn watch_disconnect(&self, engine: EngineType, handle: Arc<dyn EngineHandle>) {
        let handles = Arc::clone(&self.handles);
        let pool = Arc::clone(&self.pool);
        let closed = handle.closed();
        tokio::spawn(async move {
            closed.await;
            let evicted = {
                let mut map = handles.lock();
                match map.get(&engine) {
                    Some(current) if Arc::ptr_eq(current, &handle) => {
                        map.remove(&engine);
                        true
                    }
                    _ => false,
                }
            };
            if evicted {
                warn!(engine = %engine, "engine disconnected, evicting cached handle");
                pool.clear(engine).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{override_all_executables, MockDriver};

    fn coordinator(driver: Arc<MockDriver>) -> LaunchCoordinator {
        let mut config = SessionConfig::default();
        config.pool_capacity = 2;
        override_all_executables(&mut config);
        let pool = Arc::new(PagePool::new(config.clone()));
        LaunchCoordinator::new(driver, config, pool)
    }

    #[tokio::test]
    async fn acquire_caches_and_reuses_the_handle() {
        let driver = MockDriver::new();
        let coordinator = coordinator(driver.clone());

        let (first, ty) = coordinator.acquire(Some(EngineType::Chromium), None).await.unwrap();
        assert_eq!(ty, EngineType::Chromium);
        let (second, _) = coordinator.acquire(Some(EngineType::Chromium), None).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(driver.launch_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_launch() {
        let driver = MockDriver::new();
        driver.set_launch_delay(std::time::Duration::from_millis(50));
        let coordinator = Arc::new(coordinator(driver.clone()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            tasks.push(tokio::spawn(async move {
                coordinator.acquire(Some(EngineType::Chromium), None).await
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            let (handle, _) = task.await.unwrap().unwrap();
            handles.push(handle);
        }

        assert_eq!(driver.launch_count(), 1);
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn failed_launch_wakes_waiters_for_a_fresh_attempt() {
        let driver = MockDriver::new();
        driver.fail_launches(1);
        let coordinator = coordinator(driver.clone());

        let err = coordinator.acquire(Some(EngineType::Chromium), None).await;
        assert!(err.is_err());

        // Nothing cached after the failure; the next call launches anew.
        let (handle, _) = coordinator.acquire(Some(EngineType::Chromium), None).await.unwrap();
        assert!(handle.connected());
        assert_eq!(driver.launch_count(), 1);
    }

    #[tokio::test]
    async fn crashed_handle_is_replaced_on_next_acquire() {
        let driver = MockDriver::new();
        let coordinator = coordinator(driver.clone());

        let (first, _) = coordinator.acquire(Some(EngineType::Chromium), None).await.unwrap();
        driver.handles()[0].simulate_crash();
        assert!(!first.connected());

        let (second, _) = coordinator.acquire(Some(EngineType::Chromium), None).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(driver.launch_count(), 2);
    }

    #[tokio::test]
    async fn acquire_without_preference_prefers_chromium() {
        let driver = MockDriver::new();
        let coordinator = coordinator(driver.clone());

        let (_, ty) = coordinator.acquire(None, None).await.unwrap();
        assert_eq!(ty, EngineType::Chromium);
    }

    #[tokio::test]
    async fn acquire_without_preference_reuses_any_live_engine() {
        let driver = MockDriver::new();
        let coordinator = coordinator(driver.clone());

        let (firefox, _) = coordinator.acquire(Some(EngineType::Firefox), None).await.unwrap();
        let launches_before = driver.launch_count();

        let (handle, ty) = coordinator.acquire(None, None).await.unwrap();
        assert_eq!(ty, EngineType::Firefox);
        assert!(Arc::ptr_eq(&firefox, &handle));
        assert_eq!(driver.launch_count(), launches_before);
    }

    #[tokio::test]
    async fn losing_engine_stays_acquirable_after_an_any_engine_race() {
        let driver = MockDriver::new();
        driver.set_launch_delay(std::time::Duration::from_millis(20));
        let coordinator = coordinator(driver.clone());

        let (_, winner) = coordinator.acquire(None, None).await.unwrap();
        let loser = EngineType::ALL.into_iter().find(|e| *e != winner).unwrap();

        // The losing side of the race was cancelled mid-launch; its ticket
        // must not linger, so this acquire has to complete.
        let acquired = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            coordinator.acquire(Some(loser), None),
        )
        .await
        .expect("acquire for the losing engine did not complete");
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn race_launches_run_to_completion_and_are_cached() {
        let driver = MockDriver::new();
        driver.set_launch_delay(std::time::Duration::from_millis(20));
        let coordinator = coordinator(driver.clone());

        coordinator.acquire(None, None).await.unwrap();

        // The losing launch keeps running detached; once it settles, its
        // process is owned by a cached handle, not leaked.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(driver.launch_count(), 2);
        assert_eq!(coordinator.take_all().len(), 2);
    }

    #[tokio::test]
    async fn remote_endpoint_connects_instead_of_launching() {
        let driver = MockDriver::new();
        let coordinator = coordinator(driver.clone());

        let (handle, _) = coordinator
            .acquire(Some(EngineType::Chromium), Some("ws://127.0.0.1:9222"))
            .await
            .unwrap();

        assert!(handle.is_remote());
        assert_eq!(driver.launch_count(), 0);
        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn warm_failure_discards_the_fresh_handle() {
        let driver = MockDriver::new();
        driver.fail_pages_on_next_launch();
        let coordinator = coordinator(driver.clone());

        let err = coordinator.acquire(Some(EngineType::Chromium), None).await;
        assert!(err.is_err());
        assert!(driver.handles()[0].close_calls() > 0);

        // And nothing was cached.
        assert!(coordinator.take_all().is_empty());
    }

    #[tokio::test]
    async fn disconnect_watcher_evicts_the_cached_handle() {
        let driver = MockDriver::new();
        let coordinator = coordinator(driver.clone());

        let (handle, _) = coordinator.acquire(Some(EngineType::Chromium), None).await.unwrap();
        driver.handles()[0].simulate_crash();

        // Give the watcher task a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(coordinator.take_all().is_empty());
        drop(handle);
    }
}

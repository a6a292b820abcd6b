//! Testing infrastructure: mock implementations of the driver seam so the
//! coordination logic (launcher, pool, facade) can be exercised without
//! spawning real browsers.
//!
//! [`MockDriver`] records launches and connects, supports injected delays
//! and failures, and hands out [`MockHandle`]s whose health flags tests
//! can flip at will.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::SessionConfig;
use crate::driver::{EngineDriver, EngineHandle, EnginePage, LaunchSpec};
use crate::engine::EngineType;
use crate::error::{Result, SessionError};

/// Points every engine's executable override at the test binary itself,
/// so launch paths resolve without a browser installed.
pub fn override_all_executables(config: &mut SessionConfig) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("/bin/sh"));
    for engine in EngineType::ALL {
        config.executable_overrides.insert(engine, exe.clone());
    }
}

#[derive(Default)]
pub struct MockDriver {
    launches: AtomicUsize,
    connects: AtomicUsize,
    launch_delay: Mutex<Duration>,
    /// Number of upcoming launches that fail before one succeeds.
    failures_remaining: AtomicUsize,
    fail_pages_next: AtomicBool,
    handles: Mutex<Vec<Arc<MockHandle>>>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Successful launches performed so far.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Makes every launch take this long, to widen race windows in tests.
    pub fn set_launch_delay(&self, delay: Duration) {
        *self.launch_delay.lock() = delay;
    }

    /// The next `count` launch attempts fail with a launch error.
    pub fn fail_launches(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// The next launched handle refuses to create pages.
    pub fn fail_pages_on_next_launch(&self) {
        self.fail_pages_next.store(true, Ordering::SeqCst);
    }

    /// Every handle handed out so far, launches and connects alike.
    pub fn handles(&self) -> Vec<Arc<MockHandle>> {
        self.handles.lock().clone()
    }

    /// Creates a handle directly, bypassing the driver trait. Handy for
    /// pool tests that do not involve the coordinator.
    pub fn mock_launch(&self, engine: EngineType) -> Arc<MockHandle> {
        let handle = MockHandle::local(engine);
        self.handles.lock().push(Arc::clone(&handle));
        handle
    }
}

#[async_trait]
impl EngineDriver for MockDriver {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn EngineHandle>> {
        let delay = *self.launch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SessionError::Launch {
                engine: spec.engine,
                message: "injected launch failure".to_string(),
            });
        }

        self.launches.fetch_add(1, Ordering::SeqCst);
        let handle = MockHandle::local(spec.engine);
        if self.fail_pages_next.swap(false, Ordering::SeqCst) {
            handle.fail_new_page(true);
        }
        self.handles.lock().push(Arc::clone(&handle));
        Ok(handle)
    }

    async fn connect(&self, engine: EngineType, _endpoint: &str) -> Result<Arc<dyn EngineHandle>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let handle = MockHandle::remote(engine);
        self.handles.lock().push(Arc::clone(&handle));
        Ok(handle)
    }
}

pub struct MockHandle {
    engine: EngineType,
    remote: bool,
    has_process: AtomicBool,
    context_count: AtomicUsize,
    fail_new_page: AtomicBool,
    close_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    pages: Mutex<Vec<Arc<MockPage>>>,
    closed_tx: watch::Sender<bool>,
}

impl MockHandle {
    pub fn local(engine: EngineType) -> Arc<Self> {
        Arc::new(Self::new(engine, false))
    }

    pub fn remote(engine: EngineType) -> Arc<Self> {
        Arc::new(Self::new(engine, true))
    }

    fn new(engine: EngineType, remote: bool) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            engine,
            remote,
            has_process: AtomicBool::new(!remote),
            context_count: AtomicUsize::new(1),
            fail_new_page: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            pages: Mutex::new(Vec::new()),
            closed_tx,
        }
    }

    /// Drops the connection as a crashed engine would: connected flips to
    /// false and `closed()` futures resolve.
    pub fn simulate_crash(&self) {
        // send_replace stores the flag even with no receiver subscribed.
        self.closed_tx.send_replace(true);
    }

    pub fn set_has_process(&self, value: bool) {
        self.has_process.store(value, Ordering::SeqCst);
    }

    pub fn set_context_count(&self, count: usize) {
        self.context_count.store(count, Ordering::SeqCst);
    }

    pub fn fail_new_page(&self, value: bool) {
        self.fail_new_page.store(value, Ordering::SeqCst);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Every page this handle created.
    pub fn pages(&self) -> Vec<Arc<MockPage>> {
        self.pages.lock().clone()
    }
}

#[async_trait]
impl EngineHandle for MockHandle {
    fn engine(&self) -> EngineType {
        self.engine
    }

    fn connected(&self) -> bool {
        !*self.closed_tx.borrow()
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    fn has_process(&self) -> bool {
        self.has_process.load(Ordering::SeqCst)
    }

    fn context_count(&self) -> usize {
        if self.connected() {
            self.context_count.load(Ordering::SeqCst)
        } else {
            0
        }
    }

    async fn new_page(&self) -> Result<Arc<dyn EnginePage>> {
        if self.fail_new_page.load(Ordering::SeqCst) {
            return Err(SessionError::PageCreation(
                "injected page creation failure".to_string(),
            ));
        }
        let page = Arc::new(MockPage::default());
        self.pages.lock().push(Arc::clone(&page));
        Ok(page)
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
        Ok(())
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.closed_tx.subscribe();
        Box::pin(async move {
            let _ = rx.wait_for(|closed| *closed).await;
        })
    }
}

#[derive(Default)]
pub struct MockPage {
    requests: AtomicU64,
    reloads: AtomicUsize,
    closed: AtomicBool,
    interception: AtomicBool,
    viewport: Mutex<Option<(u32, u32)>>,
    navigations: Mutex<Vec<String>>,
}

impl MockPage {
    /// Simulates `count` intercepted requests landing on this page.
    pub fn add_requests(&self, count: u64) {
        self.requests.fetch_add(count, Ordering::SeqCst);
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn interception_enabled(&self) -> bool {
        self.interception.load(Ordering::SeqCst)
    }

    /// Last viewport set via [`EnginePage::set_viewport`].
    pub fn viewport(&self) -> Option<(u32, u32)> {
        *self.viewport.lock()
    }

    /// Every URL this page navigated to, in order.
    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().clone()
    }
}

#[async_trait]
impl EnginePage for MockPage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.navigations.lock().push(url.to_string());
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        *self.viewport.lock() = Some((width, height));
        Ok(())
    }

    async fn enable_request_interception(&self) -> Result<()> {
        self.interception.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    fn reset_request_count(&self) {
        self.requests.store(0, Ordering::SeqCst);
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

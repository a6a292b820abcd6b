//! Production [`EngineDriver`] over the Chrome DevTools Protocol, backed
//! by `chromiumoxide`. One driver serves every engine type that speaks
//! CDP; per-engine differences (executable, flags) live in [`LaunchSpec`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused,
};
use chromiumoxide::handler::Handler;
use chromiumoxide::Page;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::driver::{EngineDriver, EngineHandle, EnginePage, LaunchSpec};
use crate::engine::EngineType;
use crate::error::{Result, SessionError};

#[derive(Debug, Default)]
pub struct CdpDriver;

impl CdpDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineDriver for CdpDriver {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn EngineHandle>> {
        let config = BrowserConfig::builder()
            .chrome_executable(&spec.executable)
            .user_data_dir(&spec.data_dir)
            .args(spec.args.clone())
            .build()
            .map_err(|message| SessionError::Launch {
                engine: spec.engine,
                message,
            })?;

        let (browser, handler) =
            Browser::launch(config)
                .await
                .map_err(|e| SessionError::Launch {
                    engine: spec.engine,
                    message: e.to_string(),
                })?;

        debug!(engine = %spec.engine, executable = %spec.executable.display(), "engine launched");
        Ok(CdpHandle::start(spec.engine, browser, handler, false))
    }

    async fn connect(&self, engine: EngineType, endpoint: &str) -> Result<Arc<dyn EngineHandle>> {
        let (browser, handler) =
            Browser::connect(endpoint)
                .await
                .map_err(|e| SessionError::Connect {
                    endpoint: endpoint.to_string(),
                    message: e.to_string(),
                })?;

        debug!(engine = %engine, endpoint, "attached to remote engine");
        Ok(CdpHandle::start(engine, browser, handler, true))
    }
}

struct CdpHandle {
    engine: EngineType,
    remote: bool,
    browser: tokio::sync::Mutex<Browser>,
    /// Flips to true exactly once, when the event loop ends.
    closed_tx: watch::Sender<bool>,
    handler_task: JoinHandle<()>,
}

impl CdpHandle {
    fn start(
        engine: EngineType,
        browser: Browser,
        mut handler: Handler,
        remote: bool,
    ) -> Arc<dyn EngineHandle> {
        let (closed_tx, _) = watch::channel(false);
        let tx = closed_tx.clone();

        // The handler stream is the connection: drain it until it errors
        // or ends, then flag the handle as closed.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            tx.send_replace(true);
        });

        Arc::new(Self {
            engine,
            remote,
            browser: tokio::sync::Mutex::new(browser),
            closed_tx,
            handler_task,
        })
    }

    fn mark_closed(&self) {
        // send() is lossy without receivers; the flag must stick even when
        // nothing has subscribed via closed() yet.
        self.closed_tx.send_replace(true);
    }
}

#[async_trait]
impl EngineHandle for CdpHandle {
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
        // The driver owns the child process for the lifetime of the
        // connection; a live local connection implies a live process.
        !self.remote && self.connected()
    }

    fn context_count(&self) -> usize {
        // The default browsing context exists for as long as the engine is
        // reachable. Probing targets over the wire would make the health
        // check a network round trip, so connection state stands in.
        if self.connected() { 1 } else { 0 }
    }

    async fn new_page(&self) -> Result<Arc<dyn EnginePage>> {
        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| SessionError::PageCreation(e.to_string()))?
        };
        Ok(Arc::new(CdpPage::new(page)))
    }

    async fn close(&self) -> Result<()> {
        let mut browser = self.browser.lock().await;
        let result = browser.close().await;
        // Reap the child so it does not linger as a zombie.
        let _ = browser.wait().await;
        self.mark_closed();
        result.map(|_| ()).map_err(|e| SessionError::Driver(e.to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        // Tear down our side of the connection only; the remote process
        // keeps running.
        self.handler_task.abort();
        self.mark_closed();
        Ok(())
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.closed_tx.subscribe();
        Box::pin(async move {
            // An error means the sender is gone, i.e. the handle was
            // dropped. Either way the connection is over.
            let _ = rx.wait_for(|closed| *closed).await;
        })
    }
}

struct CdpPage {
    page: Page,
    requests: Arc<AtomicU64>,
}

impl CdpPage {
    fn new(page: Page) -> Self {
        Self {
            page,
            requests: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl EnginePage for CdpPage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            })
    }

    async fn reload(&self) -> Result<()> {
        self.page
            .reload()
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Driver(e.to_string()))
    }

    async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(width as i64)
            .height(height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(SessionError::Driver)?;
        self.page
            .execute(params)
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Driver(e.to_string()))
    }

    async fn enable_request_interception(&self) -> Result<()> {
        self.page
            .execute(EnableParams::default())
            .await
            .map_err(|e| SessionError::PageCreation(e.to_string()))?;

        let mut paused = self
            .page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(|e| SessionError::PageCreation(e.to_string()))?;

        let page = self.page.clone();
        let requests = Arc::clone(&self.requests);
        tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                requests.fetch_add(1, Ordering::Relaxed);
                let params = ContinueRequestParams::new(event.request_id.clone());
                if let Err(e) = page.execute(params).await {
                    // Page or connection gone; the counter task dies with it.
                    warn!(error = %e, "failed to continue intercepted request");
                    break;
                }
            }
        });
        Ok(())
    }

    fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn reset_request_count(&self) {
        self.requests.store(0, Ordering::Relaxed);
    }

    async fn close(&self) -> Result<()> {
        self.page
            .clone()
            .close()
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Driver(e.to_string()))
    }
}

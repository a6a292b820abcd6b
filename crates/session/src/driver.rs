//! Trait seam between the session manager and the browser-engine driver.
//!
//! The manager never speaks the remote-debugging protocol itself; it only
//! needs the capabilities below. [`crate::cdp::CdpDriver`] is the
//! production implementation, [`crate::testing`] provides mocks so the
//! coordination logic can be tested without spawning browsers.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::engine::EngineType;
use crate::error::Result;

/// Everything the driver needs to spawn one local engine process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub engine: EngineType,
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Per-engine working data directory (profile, caches, locks).
    pub data_dir: PathBuf,
}

/// Launches or attaches to engine processes.
#[async_trait]
pub trait EngineDriver: Send + Sync {
    /// Spawns a local headless engine process.
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn EngineHandle>>;

    /// Attaches to an already-running engine via its debugging endpoint.
    /// The returned handle must report [`EngineHandle::is_remote`] true.
    async fn connect(&self, engine: EngineType, endpoint: &str) -> Result<Arc<dyn EngineHandle>>;
}

/// A live engine process or remote attachment.
///
/// The health flags (`connected`, `has_process`, `context_count`) must be
/// cheap, side-effect-free and infallible: they are consulted before every
/// reuse decision.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    fn engine(&self) -> EngineType;

    /// Whether the debugging connection is still up.
    fn connected(&self) -> bool;

    /// True when attached via an endpoint instead of spawned locally.
    fn is_remote(&self) -> bool;

    /// Whether the driver still owns a reference to the OS process.
    /// Remote attachments have no local process and return false.
    fn has_process(&self) -> bool;

    /// Number of browsing contexts the engine currently owns. A healthy
    /// handle always has at least the default context.
    fn context_count(&self) -> usize;

    async fn new_page(&self) -> Result<Arc<dyn EnginePage>>;

    /// Closes the engine process. Only valid for local launches.
    async fn close(&self) -> Result<()>;

    /// Detaches from the engine without terminating it.
    async fn disconnect(&self) -> Result<()>;

    /// Resolves once the handle loses its connection, however that happens
    /// (crash, close, disconnect). Used to evict cached handles.
    fn closed(&self) -> BoxFuture<'static, ()>;
}

/// A page (tab) inside an engine.
#[async_trait]
pub trait EnginePage: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;

    async fn reload(&self) -> Result<()>;

    async fn set_viewport(&self, width: u32, height: u32) -> Result<()>;

    /// Starts intercepting requests on this page. Intercepted requests are
    /// continued unmodified; the page only counts them.
    async fn enable_request_interception(&self) -> Result<()>;

    /// Requests intercepted since creation or the last reset.
    fn request_count(&self) -> u64;

    fn reset_request_count(&self);

    async fn close(&self) -> Result<()>;
}

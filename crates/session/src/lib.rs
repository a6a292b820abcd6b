//! quickform-session: browser engine lifecycle for document conversion
//!
//! This crate owns every headless browser-engine process the converter
//! touches: launching and validating engines, pooling ready pages, reaping
//! orphans left by crashed runs, and tearing everything down at process
//! end.
//!
//! - **Session facade**: [`SessionManager`] — acquire an engine, borrow a
//!   page, hand it back, shut down
//! - **Launch coordination**: per-engine-type launch deduplication, so
//!   concurrent callers share one OS-level launch
//! - **Page pool**: warm blank pages with request interception, reused
//!   across conversions and reloaded past a request ceiling
//! - **Orphan reaper**: process-table scan that terminates stale engines
//!   from previous runs and removes their profile directories
//!
//! # Example
//!
//! ```ignore
//! use quickform_session::{SessionConfig, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = std::sync::Arc::new(SessionManager::new(SessionConfig::default()));
//!     quickform_session::shutdown::on_termination(manager.clone());
//!
//!     let lease = manager.get_page(None).await?;
//!     lease.page().goto("https://example.com").await?;
//!     // ... render the document ...
//!     manager.release_page(lease).await;
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cdp;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod health;
pub mod launcher;
pub mod pool;
pub mod reaper;
pub mod session;
pub mod shutdown;
pub mod testing;

// Re-export key types at crate root
pub use cdp::CdpDriver;
pub use config::SessionConfig;
pub use driver::{EngineDriver, EngineHandle, EnginePage, LaunchSpec};
pub use engine::EngineType;
pub use error::{Result, SessionError};
pub use launcher::LaunchCoordinator;
pub use pool::{PageLease, PagePool};
pub use session::SessionManager;

//! Liveness predicate consulted before every handle-reuse decision.

use std::sync::Arc;

use crate::driver::EngineHandle;

/// A handle is usable iff it exists, its connection is up, a local launch
/// still owns its OS process, and the engine has at least one browsing
/// context. Works purely off the driver's in-memory flags; no I/O.
pub fn is_live(handle: Option<&Arc<dyn EngineHandle>>) -> bool {
    let Some(handle) = handle else {
        return false;
    };
    if !handle.connected() {
        return false;
    }
    if !handle.is_remote() && !handle.has_process() {
        return false;
    }
    handle.context_count() > 0
}

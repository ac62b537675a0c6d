//! The synchronization engine
//!
//! Push drains the outbox toward the server, pull ingests the server's
//! change log, and the orchestrator serializes the two, owns the timers and
//! the SSE subscription, and publishes status to the UI.

mod invalidate;
mod orchestrator;
mod pull;
mod push;
mod status;
mod transport;

pub use invalidate::{NoopInvalidator, QueryInvalidator, QueryKey, RecordingInvalidator};
pub use orchestrator::{SyncConfig, SyncOrchestrator};
pub use pull::{PullEngine, PullOutcome};
pub use push::{PushEngine, PushOutcome};
pub use status::{Connection, SyncState, SyncStatus};
pub use transport::{EventSource, EventStream, HttpTransport, SyncTransport};

use std::sync::atomic::{AtomicBool, Ordering};

/// RAII guard around the engines' defensive `is_syncing` flags.
///
/// Returns `None` when the flag was already held, which callers treat as
/// "another invocation is in flight, do nothing".
pub(crate) struct SyncingGuard<'a>(&'a AtomicBool);

impl<'a> SyncingGuard<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

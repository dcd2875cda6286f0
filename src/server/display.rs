//! Display collaborator
//!
//! The server pushes notifications to whatever renders the log. Every call
//! comes from the aggregator task, one at a time, so implementations need no
//! ordering of their own. All methods default to doing nothing.

use crate::error::Error;

use super::context::ClientContext;

/// Receiver of server notifications
pub trait TraceDisplay: Send + Sync + 'static {
    /// The master log now holds `count` entries
    fn set_count(&self, count: usize) {
        let _ = count;
    }

    /// Something failed that the user should know about
    fn notify_error(&self, error: &Error) {
        let _ = error;
    }

    /// A process connected for the first time
    fn process_connected(&self, client: &ClientContext) {
        let _ = client;
    }

    /// A client's channel was closed
    fn notify_disconnect(&self, client: &ClientContext) {
        let _ = client;
    }

    /// A process name was set
    fn processes_changed(&self) {}

    /// A thread name was set
    fn threads_changed(&self) {}

    /// A flushed batch contained at least one error entry
    fn error_entry_received(&self) {}

    /// The master log was cleared
    fn log_cleared(&self) {}
}

/// Display that ignores every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDisplay;

impl TraceDisplay for NullDisplay {}

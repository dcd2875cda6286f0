//! Log assembly
//!
//! Entries flow from the client workers into a bounded cache, and from the
//! cache into the master log in batches:
//!
//! ```text
//!  [ClientWorker] ──push──┐
//!  [ClientWorker] ──push──┼──► BoundedMessageCache ──drain──► MasterLog
//!  [ClientWorker] ──push──┘      (capacity 1000)              (ordered)
//!                    ▲                  │
//!                    └── flush done ◄───┘ overflow: flush requested
//! ```
//!
//! Producers that find the cache full request a flush and wait for it rather
//! than dropping entries.

pub mod cache;
pub mod directory;
pub mod entry;
pub mod master;

pub use cache::BoundedMessageCache;
pub use directory::{Directories, NameDirectory, ProcessDirectory, ThreadDirectory};
pub use entry::{EntryKind, LogEntry};
pub use master::{MasterLog, MergeOutcome, SharedLog};

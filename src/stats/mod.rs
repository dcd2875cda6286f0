//! Statistics for workers and the server as a whole

pub mod metrics;

pub use metrics::{ServerStats, ServerStatsSnapshot, WorkerStats};

//! Task and shutdown utilities shared by the bridge crates.

/// `NotifyOnce`, the process-wide shutdown signal.
pub mod notify_once;
/// Named [`Task`](task::Task) handles and structured task joining.
pub mod task;

// Can save a `tokio` dependency declaration
pub use tokio;

/// Capacity of the channel over which per-request tasks are handed to the
/// task joiner.
pub const EPHEMERAL_TASKS_CHANNEL_SIZE: usize = 256;

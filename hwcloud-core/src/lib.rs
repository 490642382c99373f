//! Huawei Cloud Core
//!
//! Core library for waiting on eventually-consistent cloud state: a generic
//! state change watcher, the refresh-function contract it drives, a job
//! indirection layer for APIs that answer with asynchronous jobs, bounded
//! retry for transient lock contention, and the provider contract built on
//! top of them.

pub mod job;
pub mod provider;
pub mod refresh;
pub mod resource;
pub mod retry;
pub mod timeouts;
pub mod wait;

pub use job::{JobError, JobHandle, JobStatus, JobTiming, JobTracker};
pub use refresh::{Observation, Refresh, RefreshError, RefreshResult, Status};
pub use retry::{RetryError, RetryPolicy, retry_transient};
pub use timeouts::{Operation, Timeouts};
pub use wait::{Converged, PendingPolicy, StateChangeConf, WaitError};

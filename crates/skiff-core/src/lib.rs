//! Skiff: a multi-protocol download engine.
//!
//! The engine takes a [`DownloadRequest`](request::DownloadRequest) (URL,
//! destination, concurrency, priority, schedule, speed limit) and downloads
//! the resource to a local file with resume support across process restarts,
//! coordinating many concurrent downloads under global and per-host limits.
//!
//! Frontends (GUI, daemon, CLI) embed [`engine::Engine`] and observe tasks
//! through per-task state and segment streams.

pub mod config;
pub mod logging;

pub mod coordinator;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod naming;
pub mod request;
pub mod schedule;
pub mod scheduler;
pub mod segment;
pub mod source;
pub mod state;
pub mod store;
pub mod transport;
pub mod writer;

pub use engine::{Engine, EngineBuilder, TaskHandle};
pub use error::DownloadError;
pub use request::{DownloadRequest, Priority, Schedule, SpeedLimit};
pub use state::{DownloadProgress, DownloadState};
pub use store::{TaskId, TaskRecord, TaskState};

#![warn(missing_docs)]

//! relog replication subsystem: follower health probing, write-concern fan-out, ordered follower ingestion

pub mod config;
pub mod error;
pub mod fanout;
pub mod health;
pub mod latch;
pub mod master;
pub mod ordering;
pub mod retry;
pub mod secondary;
pub mod worker;

pub use config::{ArtificialDelay, FollowerAddr, MasterConfig, SecondaryConfig};
pub use error::{ReplError, Result};
pub use fanout::{ReplicationRound, RoundSummary};
pub use health::{HealthConfig, HealthMonitor, HealthStatus};
pub use latch::CompletionLatch;
pub use master::Master;
pub use ordering::{CommitOutcome, OrderedLog};
pub use retry::{Backoff, RetryConfig};
pub use secondary::Secondary;
pub use worker::{ReplicationTarget, ReplicationWorker, WorkerSettings};

//! Write fan-out: parallel dispatch of one record to every follower.
//!
//! A [`ReplicationRound`] spawns one [`ReplicationWorker`] per follower and
//! shares a [`CompletionLatch`] sized to the number of acknowledgements the
//! caller needs. Every follower receives the write, including when no
//! acknowledgements are required, so sequences on followers stay gap-free.
//! Workers outlive the caller's wait: a quorum timeout only ends the wait, and
//! lagging followers keep receiving the write until they acknowledge or the
//! master shuts down.

use std::sync::Arc;
use std::time::Duration;

use relog_transport::Message;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ReplError, Result};
use crate::latch::CompletionLatch;
use crate::worker::{ReplicationTarget, ReplicationWorker, WorkerSettings};

/// What the workers of a finished round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    /// Sequence number of the replicated record.
    pub sequence: u32,
    /// Workers spawned.
    pub total_followers: usize,
    /// Followers that acknowledged.
    pub acknowledged: usize,
    /// Followers that rejected the record.
    pub rejected: usize,
    /// Workers cancelled before an outcome.
    pub abandoned: usize,
}

impl RoundSummary {
    /// Returns true if every follower acknowledged.
    pub fn all_acknowledged(&self) -> bool {
        self.acknowledged == self.total_followers
    }
}

/// One in-flight replicated write.
pub struct ReplicationRound {
    sequence: u32,
    latch: Arc<CompletionLatch>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<Option<bool>>>,
}

impl ReplicationRound {
    /// Spawn workers for `message` towards every target.
    ///
    /// The round completes once `required_acks` workers have reported. If
    /// `required_acks` exceeds the number of targets the round can only end by
    /// timing out. Workers stop when `parent` is cancelled.
    pub fn start(
        message: Message,
        targets: Vec<ReplicationTarget>,
        required_acks: usize,
        settings: &WorkerSettings,
        parent: &CancellationToken,
    ) -> Self {
        let sequence = message.sequence();
        let message = Arc::new(message);
        let latch = Arc::new(CompletionLatch::new(required_acks));
        let cancel = parent.child_token();

        debug!(
            sequence,
            followers = targets.len(),
            required_acks,
            "starting replication round"
        );

        let workers = targets
            .into_iter()
            .map(|target| {
                let worker = ReplicationWorker::new(
                    target,
                    message.clone(),
                    latch.clone(),
                    settings,
                    cancel.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        Self {
            sequence,
            latch,
            cancel,
            workers,
        }
    }

    /// Sequence number being replicated.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// The latch counting worker outcomes.
    pub fn latch(&self) -> &CompletionLatch {
        &self.latch
    }

    /// Wait until enough workers have reported and return the AND of their outcomes.
    ///
    /// On timeout the workers keep running in the background and the timeout
    /// is returned.
    pub async fn wait_for_quorum(&self, timeout: Duration) -> Result<bool> {
        match self.latch.wait(timeout).await {
            Err(e @ ReplError::Timeout { .. }) => {
                warn!(
                    sequence = self.sequence,
                    outstanding = self.latch.outstanding(),
                    "quorum not reached in time, delivery continues in background"
                );
                Err(e)
            }
            other => other,
        }
    }

    /// Cancel every worker still running.
    pub fn abandon(&self) {
        self.cancel.cancel();
    }

    /// Wait for every worker to exit and summarize what they did.
    pub async fn join(self) -> RoundSummary {
        let mut summary = RoundSummary {
            sequence: self.sequence,
            total_followers: self.workers.len(),
            ..Default::default()
        };
        for worker in self.workers {
            match worker.await {
                Ok(Some(true)) => summary.acknowledged += 1,
                Ok(Some(false)) => summary.rejected += 1,
                Ok(None) | Err(_) => summary.abandoned += 1,
            }
        }
        summary
    }
}

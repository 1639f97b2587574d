//! Master side: accepts client writes and replicates them to every follower.
//!
//! A write is appended to the local log and assigned the next sequence number
//! under a single lock, so local order always equals sequence order. It is
//! then fanned out to all followers and the caller waits for `write_concern - 1`
//! acknowledgements. The local append is not rolled back when replication
//! fails, and delivery to followers that missed the quorum window carries on
//! in the background until they acknowledge or the master shuts down.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};
use relog_transport::protocol::MAX_SEQUENCE;
use relog_transport::{Message, TcpTransport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FollowerAddr, MasterConfig};
use crate::error::{ReplError, Result};
use crate::fanout::ReplicationRound;
use crate::health::{HealthMonitor, HealthStatus};
use crate::worker::{ReplicationTarget, WorkerSettings};

/// The write-accepting node.
pub struct Master {
    config: MasterConfig,
    log: RwLock<Vec<String>>,
    last_sequence: Mutex<u32>,
    monitors: Vec<HealthMonitor>,
    settings: WorkerSettings,
    shutdown: CancellationToken,
}

impl Master {
    /// Start health monitors for every configured follower.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: MasterConfig) -> Self {
        let shutdown = CancellationToken::new();
        let monitors = config
            .followers
            .iter()
            .map(|follower| HealthMonitor::spawn(follower.clone(), config.health.clone(), &shutdown))
            .collect();
        let settings = WorkerSettings {
            transport: TcpTransport::new(config.transport.clone()),
            retry: config.retry.clone(),
        };

        info!(
            followers = config.followers.len(),
            max_write_concern = config.max_write_concern(),
            "master started"
        );

        Self {
            config,
            log: RwLock::new(Vec::new()),
            last_sequence: Mutex::new(0),
            monitors,
            settings,
            shutdown,
        }
    }

    /// Configured followers.
    pub fn followers(&self) -> &[FollowerAddr] {
        &self.config.followers
    }

    /// Largest accepted write concern.
    pub fn max_write_concern(&self) -> usize {
        self.config.max_write_concern()
    }

    /// Append `record` and replicate it. Returns true once `write_concern`
    /// nodes (master included) hold it and every counted follower acknowledged.
    ///
    /// Returns false without side effects when the write concern is out of
    /// range, the record is empty, or too few followers are healthy. Returns
    /// false after the local append when replication fails or times out.
    pub async fn append_data(&self, record: impl Into<String>, write_concern: usize) -> bool {
        match self.try_append(record.into(), write_concern).await {
            Ok(sequence) => {
                debug!(sequence, write_concern, "append acknowledged");
                true
            }
            Err(e) => {
                warn!(write_concern, error = %e, "append failed");
                false
            }
        }
    }

    /// Like [`Master::append_data`] but reports why a write failed.
    ///
    /// Returns the sequence number assigned to the record.
    pub async fn try_append(&self, record: String, write_concern: usize) -> Result<u32> {
        let max = self.max_write_concern();
        if write_concern == 0 || write_concern > max {
            return Err(ReplError::Configuration {
                msg: format!("write concern {write_concern} outside 1..={max}"),
            });
        }
        if record.is_empty() {
            return Err(ReplError::Validation {
                msg: "record must not be empty".to_string(),
            });
        }
        if self.shutdown.is_cancelled() {
            return Err(ReplError::Shutdown);
        }
        if self.config.preflight_health_check {
            let healthy = self.healthy_followers() + 1;
            if healthy < write_concern {
                return Err(ReplError::QuorumUnavailable {
                    healthy,
                    required: write_concern,
                });
            }
        }

        let message = self.append_local(record)?;
        let sequence = message.sequence();

        let round = ReplicationRound::start(
            message,
            self.targets(),
            write_concern - 1,
            &self.settings,
            &self.shutdown,
        );
        if round.wait_for_quorum(self.config.quorum_timeout).await? {
            Ok(sequence)
        } else {
            Err(ReplError::ReplicationFailed { sequence })
        }
    }

    /// Append to the local log and allocate the record's sequence number.
    fn append_local(&self, record: String) -> Result<Message> {
        let mut last = self.last_sequence.lock();
        let sequence = last
            .checked_add(1)
            .filter(|next| *next <= MAX_SEQUENCE)
            .ok_or(ReplError::SequenceExhausted)?;
        let message = Message::request(sequence, record.clone())?;
        self.log.write().push(record);
        *last = sequence;
        Ok(message)
    }

    fn targets(&self) -> Vec<ReplicationTarget> {
        self.monitors
            .iter()
            .map(|monitor| ReplicationTarget {
                follower: monitor.follower().clone(),
                health: monitor.subscribe(),
            })
            .collect()
    }

    /// Snapshot of the local log in append order.
    pub fn get_data(&self) -> Vec<String> {
        self.log.read().clone()
    }

    /// Latest status of every follower, keyed by `host:port`.
    pub fn health_snapshot(&self) -> BTreeMap<String, HealthStatus> {
        self.monitors
            .iter()
            .map(|monitor| (monitor.follower().to_string(), monitor.current_status()))
            .collect()
    }

    /// Number of followers currently `Healthy`.
    pub fn healthy_followers(&self) -> usize {
        self.monitors
            .iter()
            .filter(|monitor| monitor.current_status() == HealthStatus::Healthy)
            .count()
    }

    /// Stop health monitors and replication workers, then wait for the monitors.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for monitor in &self.monitors {
            monitor.shutdown().await;
        }
        info!("master stopped");
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

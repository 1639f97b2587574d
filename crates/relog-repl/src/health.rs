//! Follower health monitoring.
//!
//! Each follower gets one [`HealthMonitor`] that owns a background probe loop.
//! The loop keeps a long-lived connection to the follower, sends a health-check
//! request every `probe_interval` and classifies the outcome:
//!
//! - matching health-check response with an empty payload: `Healthy`
//! - no answer within `probe_timeout`: `Suspected` (connection kept)
//! - timeout after part of the answer arrived: `Suspected`, and the next
//!   round reconnects since the stream is no longer framed
//! - wrong kind, wrong sequence or an error payload: `Unhealthy`
//! - socket error: `Unhealthy`, and the next rounds reconnect
//!
//! The status is published through a `watch` channel so replication workers
//! can wait for a transition instead of polling.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relog_transport::{
    ErrorKind, Message, MessageKind, TcpConnection, TcpTransport, TcpTransportConfig,
    TransportError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FollowerAddr;

/// Liveness of a follower as seen by its probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    /// Last probe round-tripped successfully.
    Healthy,
    /// Last probe timed out.
    Suspected,
    /// Socket error or bad answer; not reconnected yet.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Suspected => write!(f, "SUSPECTED"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
        }
    }
}

/// Configuration for health probing.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Delay between probes, also used between reconnect attempts (default: 100ms).
    pub probe_interval: Duration,
    /// Deadline for one probe round-trip (default: 5 seconds).
    pub probe_timeout: Duration,
    /// Deadline for establishing the probe connection (default: 5 seconds).
    pub connect_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Handle to a follower's probe loop.
///
/// Dropping the handle cancels the loop; [`HealthMonitor::shutdown`] also waits for it.
pub struct HealthMonitor {
    follower: FollowerAddr,
    status: Arc<watch::Sender<HealthStatus>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Start probing `follower`. The status starts out `Healthy`.
    ///
    /// The loop stops when `parent` is cancelled or the monitor is shut down.
    pub fn spawn(follower: FollowerAddr, config: HealthConfig, parent: &CancellationToken) -> Self {
        let (tx, _) = watch::channel(HealthStatus::Healthy);
        let status = Arc::new(tx);
        let cancel = parent.child_token();

        let transport = TcpTransport::new(TcpTransportConfig {
            connect_timeout: config.connect_timeout,
            io_timeout: Some(config.probe_timeout),
            nodelay: true,
        });
        let prober = Prober {
            addr: follower.to_string(),
            interval: config.probe_interval,
            transport,
            status: status.clone(),
            cancel: cancel.clone(),
            conn: None,
        };
        let task = tokio::spawn(prober.run());

        Self {
            follower,
            status,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// The follower this monitor probes.
    pub fn follower(&self) -> &FollowerAddr {
        &self.follower
    }

    /// Latest observed status. Never blocks.
    pub fn current_status(&self) -> HealthStatus {
        *self.status.borrow()
    }

    /// Subscribe to status changes. The receiver holds the current status
    /// immediately and is notified on every later transition.
    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.status.subscribe()
    }

    /// Stop the probe loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum ProbeFailure {
    /// Nothing came back within the probe timeout.
    Timeout,
    /// Timed out partway through a frame; the connection is unusable.
    Stalled(String),
    /// The follower answered, but reported a problem.
    Reported(String),
    /// The answer did not match the probe; the stream can no longer be trusted.
    Mismatch(String),
    /// Socket-level failure.
    Disconnected(String),
}

impl From<TransportError> for ProbeFailure {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::StalledFrame { .. } => ProbeFailure::Stalled(e.to_string()),
            e if e.kind() == ErrorKind::Timeout => ProbeFailure::Timeout,
            e => ProbeFailure::Disconnected(e.to_string()),
        }
    }
}

struct Prober {
    addr: String,
    interval: Duration,
    transport: TcpTransport,
    status: Arc<watch::Sender<HealthStatus>>,
    cancel: CancellationToken,
    conn: Option<TcpConnection>,
}

impl Prober {
    async fn run(mut self) {
        debug!(follower = %self.addr, "health probe loop started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let cancel = self.cancel.clone();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.round() => {}
            }
        }
        debug!(follower = %self.addr, "health probe loop stopped");
    }

    async fn round(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => match self.transport.connect(&self.addr).await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(follower = %self.addr, error = %e, "reconnect failed");
                    self.set_status(HealthStatus::Unhealthy);
                    return;
                }
            },
        };

        match probe(&conn).await {
            Ok(()) => {
                self.set_status(HealthStatus::Healthy);
                self.conn = Some(conn);
            }
            Err(ProbeFailure::Timeout) => {
                self.set_status(HealthStatus::Suspected);
                self.conn = Some(conn);
            }
            Err(ProbeFailure::Stalled(reason)) => {
                debug!(follower = %self.addr, error = %reason, "health answer stalled, reconnecting");
                self.set_status(HealthStatus::Suspected);
            }
            Err(ProbeFailure::Reported(reason)) => {
                warn!(follower = %self.addr, cause = %reason, "follower reported a health problem");
                self.set_status(HealthStatus::Unhealthy);
                self.conn = Some(conn);
            }
            Err(ProbeFailure::Mismatch(reason)) => {
                warn!(follower = %self.addr, "unexpected health-check answer: {}", reason);
                self.set_status(HealthStatus::Unhealthy);
            }
            Err(ProbeFailure::Disconnected(reason)) => {
                debug!(follower = %self.addr, error = %reason, "health connection lost");
                self.set_status(HealthStatus::Unhealthy);
            }
        }
    }

    fn set_status(&self, status: HealthStatus) {
        let mut previous = status;
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            previous = *current;
            *current = status;
            true
        });

        if changed {
            match status {
                HealthStatus::Healthy => {
                    info!(follower = %self.addr, from = %previous, to = %status, "health status changed")
                }
                _ => warn!(follower = %self.addr, from = %previous, to = %status, "health status changed"),
            }
        }
    }
}

async fn probe(conn: &TcpConnection) -> Result<(), ProbeFailure> {
    // A send cut short by the timeout may leave a partial frame on the wire.
    conn.send_message(&Message::health_check_request())
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::Timeout => ProbeFailure::Stalled(e.to_string()),
            _ => ProbeFailure::from(e),
        })?;

    let header = conn
        .recv_header()
        .await?
        .ok_or_else(|| ProbeFailure::Disconnected("connection closed by peer".to_string()))?;

    if header.kind != MessageKind::Response {
        return Err(ProbeFailure::Mismatch(format!(
            "expected {}, received {}",
            MessageKind::Response,
            header.kind
        )));
    }
    if !header.is_health_check() {
        return Err(ProbeFailure::Mismatch(format!(
            "expected sequence 0, received {}",
            header.sequence
        )));
    }
    if header.payload_size > 0 {
        let reason = conn.recv_payload(header.payload_size).await?;
        return Err(ProbeFailure::Reported(reason));
    }
    Ok(())
}

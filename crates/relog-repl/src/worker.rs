//! Replication worker: delivers one write to one follower.
//!
//! A worker keeps retrying a full round-trip (connect, send request, read the
//! response header, check kind and sequence, read the error payload if any)
//! until the follower acknowledges. While the follower's health monitor says
//! `Unhealthy` the worker parks on the status channel instead of retrying;
//! otherwise failed attempts are paced by exponential backoff. A worker only
//! stops early when its cancellation token fires, which happens on master
//! shutdown; a follower that is down for a while still catches up once it
//! comes back, so its log never keeps a permanent gap.

use std::sync::Arc;
use std::time::Duration;

use relog_transport::{Message, MessageKind, TcpTransport};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FollowerAddr;
use crate::error::{ReplError, Result};
use crate::health::HealthStatus;
use crate::latch::CompletionLatch;
use crate::retry::{Backoff, RetryConfig};

/// Settings shared by all workers of a master.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Transport used for data connections.
    pub transport: TcpTransport,
    /// Backoff pacing.
    pub retry: RetryConfig,
}

/// One follower, as seen by the workers replicating to it.
#[derive(Debug, Clone)]
pub struct ReplicationTarget {
    /// Follower address.
    pub follower: FollowerAddr,
    /// Status feed from the follower's health monitor.
    pub health: watch::Receiver<HealthStatus>,
}

/// Delivers `message` to one follower and reports exactly one outcome into the latch.
pub struct ReplicationWorker {
    target: ReplicationTarget,
    message: Arc<Message>,
    latch: Arc<CompletionLatch>,
    transport: TcpTransport,
    backoff: Backoff,
    cancel: CancellationToken,
}

impl ReplicationWorker {
    /// Create a worker; nothing happens until [`ReplicationWorker::run`].
    pub fn new(
        target: ReplicationTarget,
        message: Arc<Message>,
        latch: Arc<CompletionLatch>,
        settings: &WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target,
            message,
            latch,
            transport: settings.transport.clone(),
            backoff: Backoff::new(settings.retry.clone()),
            cancel,
        }
    }

    /// Run until acknowledged, rejected or abandoned.
    ///
    /// Returns the outcome handed to the latch, or `None` if the worker was
    /// cancelled before finishing.
    pub async fn run(mut self) -> Option<bool> {
        let addr = self.target.follower.to_string();
        let sequence = self.message.sequence();

        loop {
            if self.cancel.is_cancelled() {
                debug!(follower = %addr, sequence, "replication abandoned");
                return None;
            }

            let status = *self.target.health.borrow_and_update();
            if status == HealthStatus::Unhealthy {
                debug!(follower = %addr, sequence, "follower unhealthy, waiting for recovery");
                if !self.wait_until_healthy().await {
                    debug!(follower = %addr, sequence, "replication abandoned while follower unhealthy");
                    return None;
                }
                self.backoff.reset();
            }

            match self.replicate_once(&addr).await {
                Ok(()) => {
                    info!(follower = %addr, sequence, "replication succeeded");
                    self.latch.report_outcome(true);
                    return Some(true);
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        follower = %addr,
                        sequence,
                        attempt = self.backoff.attempt(),
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "replication attempt failed"
                    );
                    if !self.pause(delay).await {
                        debug!(follower = %addr, sequence, "replication abandoned during backoff");
                        return None;
                    }
                }
                Err(e) => {
                    warn!(follower = %addr, sequence, error = %e, "replication failed");
                    self.latch.report_outcome(false);
                    return Some(false);
                }
            }
        }
    }

    /// Sleep for `delay`. Returns false if cancelled.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Park until the follower is `Healthy` again.
    async fn wait_until_healthy(&mut self) -> bool {
        let cancel = &self.cancel;
        let health = &mut self.target.health;
        let recovered = async { health.wait_for(|s| *s == HealthStatus::Healthy).await.is_ok() };
        tokio::select! {
            _ = cancel.cancelled() => false,
            recovered = recovered => recovered,
        }
    }

    async fn replicate_once(&self, addr: &str) -> Result<()> {
        let sequence = self.message.sequence();

        let conn = self.transport.connect(addr).await?;
        conn.send_message(&self.message).await?;

        let header = conn.recv_header().await?.ok_or_else(|| ReplError::Connection {
            msg: "connection closed before response".to_string(),
        })?;

        if header.kind != MessageKind::Response {
            return Err(ReplError::Protocol {
                msg: format!("expected {}, received {}", MessageKind::Response, header.kind),
            });
        }
        if header.sequence != sequence {
            return Err(ReplError::Protocol {
                msg: format!(
                    "response sequence {} does not match request {}",
                    header.sequence, sequence
                ),
            });
        }
        if header.payload_size > 0 {
            let reason = conn.recv_payload(header.payload_size).await?;
            return Err(ReplError::Rejected {
                follower: addr.to_string(),
                reason,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relog_transport::TcpTransportConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            transport: TcpTransport::new(TcpTransportConfig {
                connect_timeout: Duration::from_millis(200),
                io_timeout: Some(Duration::from_millis(500)),
                nodelay: true,
            }),
            retry: RetryConfig {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                backoff_multiplier: 2.0,
                jitter: false,
            },
        }
    }

    /// Answers each data request with `reply(sequence, attempt)`.
    fn spawn_follower<F>(listener: TcpListener, reply: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(u32, u32) -> Message + Send + Sync + 'static,
    {
        let reply = Arc::new(reply);
        let attempts = Arc::new(AtomicU32::new(0));
        tokio::spawn(async move {
            let transport = TcpTransport::new(TcpTransportConfig::default());
            while let Ok(conn) = transport.accept(&listener).await {
                let reply = reply.clone();
                let attempts = attempts.clone();
                tokio::spawn(async move {
                    while let Ok(Some(msg)) = conn.recv_message().await {
                        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                        let _ = conn.send_message(&reply(msg.sequence(), attempt)).await;
                    }
                });
            }
        })
    }

    fn target(port: u16, status: HealthStatus) -> (ReplicationTarget, watch::Sender<HealthStatus>) {
        let (tx, rx) = watch::channel(status);
        (
            ReplicationTarget {
                follower: FollowerAddr::new("127.0.0.1", port),
                health: rx,
            },
            tx,
        )
    }

    #[tokio::test]
    async fn test_acknowledged_write_reports_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let follower = spawn_follower(listener, |seq, _| Message::response(seq).unwrap());

        let (target, _tx) = target(port, HealthStatus::Healthy);
        let latch = Arc::new(CompletionLatch::new(1));
        let message = Arc::new(Message::request(1, "a").unwrap());
        let worker = ReplicationWorker::new(target, message, latch.clone(), &settings(), CancellationToken::new());

        assert_eq!(worker.run().await, Some(true));
        assert!(latch.wait(Duration::from_millis(10)).await.unwrap());
        follower.abort();
    }

    #[tokio::test]
    async fn test_retries_after_sequence_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let follower = spawn_follower(listener, |seq, attempt| {
            if attempt < 3 {
                Message::response(seq + 1).unwrap()
            } else {
                Message::response(seq).unwrap()
            }
        });

        let (target, _tx) = target(port, HealthStatus::Healthy);
        let latch = Arc::new(CompletionLatch::new(1));
        let message = Arc::new(Message::request(7, "a").unwrap());
        let worker = ReplicationWorker::new(target, message, latch.clone(), &settings(), CancellationToken::new());

        assert_eq!(worker.run().await, Some(true));
        follower.abort();
    }

    #[tokio::test]
    async fn test_error_payload_reports_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let follower = spawn_follower(listener, |seq, _| Message::error_response(seq, "no space").unwrap());

        let (target, _tx) = target(port, HealthStatus::Healthy);
        let latch = Arc::new(CompletionLatch::new(1));
        let message = Arc::new(Message::request(1, "a").unwrap());
        let worker = ReplicationWorker::new(target, message, latch.clone(), &settings(), CancellationToken::new());

        assert_eq!(worker.run().await, Some(false));
        assert!(!latch.wait(Duration::from_millis(10)).await.unwrap());
        follower.abort();
    }

    #[tokio::test]
    async fn test_parks_while_unhealthy_then_resumes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let follower = spawn_follower(listener, |seq, _| Message::response(seq).unwrap());

        let (target, tx) = target(port, HealthStatus::Unhealthy);
        let latch = Arc::new(CompletionLatch::new(1));
        let message = Arc::new(Message::request(1, "a").unwrap());
        let worker = ReplicationWorker::new(target, message, latch.clone(), &settings(), CancellationToken::new());
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!latch.is_released());

        tx.send_replace(HealthStatus::Healthy);
        assert_eq!(handle.await.unwrap(), Some(true));
        follower.abort();
    }

    #[tokio::test]
    async fn test_cancellation_abandons_without_outcome() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (target, _tx) = target(port, HealthStatus::Healthy);
        let latch = Arc::new(CompletionLatch::new(1));
        let message = Arc::new(Message::request(1, "a").unwrap());
        let cancel = CancellationToken::new();
        let worker = ReplicationWorker::new(target, message, latch.clone(), &settings(), cancel.clone());
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), None);
        assert_eq!(latch.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_keeps_delivering_until_follower_appears() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (target, _tx) = target(port, HealthStatus::Healthy);
        let latch = Arc::new(CompletionLatch::new(1));
        let message = Arc::new(Message::request(1, "a").unwrap());
        let worker = ReplicationWorker::new(target, message, latch.clone(), &settings(), CancellationToken::new());
        let handle = tokio::spawn(worker.run());

        // Many backoff rounds pass without the worker giving up.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_finished());
        assert!(!latch.is_released());

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let follower = spawn_follower(listener, |seq, _| Message::response(seq).unwrap());

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(outcome, Some(true));
        assert!(latch.is_released());
        follower.abort();
    }
}

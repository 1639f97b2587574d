//! Follower side: accepts replicated writes and health checks from the master.
//!
//! Every accepted connection gets its own handler task. A handler answers
//! health checks directly, feeds data requests through the [`OrderedLog`] and
//! replies with an empty response on success or an error-carrying response
//! otherwise. Handlers end when the master closes the connection or the
//! secondary shuts down.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use relog_transport::{
    Message, MessageHeader, MessageKind, TcpConnection, TcpTransport, TransportError,
};
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ArtificialDelay, SecondaryConfig};
use crate::error::{ReplError, Result};
use crate::ordering::{CommitOutcome, OrderedLog};

/// A running follower node.
pub struct Secondary {
    log: Arc<Mutex<OrderedLog>>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Secondary {
    /// Bind the ingestion listener and start accepting connections.
    pub async fn start(config: SecondaryConfig) -> Result<Self> {
        let transport = TcpTransport::new(config.transport.clone());
        let listener = transport.listen(&config.bind_addr).await?;
        let local_addr = listener.local_addr().map_err(TransportError::from)?;
        info!(addr = %local_addr, "secondary listening for replication");

        let log = Arc::new(Mutex::new(OrderedLog::new()));
        let ingestor = Arc::new(Ingestor {
            log: log.clone(),
            artificial_delay: config.artificial_delay,
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, transport, ingestor, cancel.clone()));

        Ok(Self {
            log,
            local_addr,
            cancel,
            accept_task: Mutex::new(Some(task)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of the committed records in sequence order.
    pub fn get_data(&self) -> Vec<String> {
        self.log.lock().records().to_vec()
    }

    /// Records received ahead of a missing predecessor.
    pub fn pending_len(&self) -> usize {
        self.log.lock().pending_len()
    }

    /// Stop accepting, end every connection handler and wait for them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!(addr = %self.local_addr, "secondary stopped");
    }
}

impl Drop for Secondary {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    transport: TcpTransport,
    ingestor: Arc<Ingestor>,
    cancel: CancellationToken,
) {
    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            accepted = transport.accept(&listener) => match accepted {
                Ok(conn) => {
                    debug!(peer = conn.peer_addr(), "accepted replication connection");
                    let ingestor = ingestor.clone();
                    let cancel = cancel.child_token();
                    handlers.spawn(async move { ingestor.serve(conn, cancel).await });
                }
                Err(e) => warn!(error = %e, "failed to accept connection"),
            },
        }
    }
    while handlers.join_next().await.is_some() {}
}

struct Ingestor {
    log: Arc<Mutex<OrderedLog>>,
    artificial_delay: Option<ArtificialDelay>,
}

impl Ingestor {
    async fn serve(&self, conn: TcpConnection, cancel: CancellationToken) {
        let peer = conn.peer_addr().to_string();
        loop {
            let header = tokio::select! {
                _ = cancel.cancelled() => break,
                header = conn.recv_header() => header,
            };
            let header = match header {
                Ok(Some(header)) => header,
                Ok(None) => {
                    debug!(peer = %peer, "master closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "dropping replication connection");
                    break;
                }
            };

            let reply = match self.handle(&conn, header).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "dropping replication connection");
                    break;
                }
            };
            if let Err(e) = conn.send_message(&reply).await {
                warn!(peer = %peer, error = %e, "failed to send response");
                break;
            }
        }
    }

    /// Build the reply to one message. An `Err` means the stream is no longer usable.
    async fn handle(&self, conn: &TcpConnection, header: MessageHeader) -> Result<Message> {
        let sequence = header.sequence;
        if header.is_health_check()
            && header.kind == MessageKind::Request
            && header.payload_size == 0
        {
            return Ok(Message::health_check_response());
        }

        // Read the payload before validating so the stream stays framed.
        let payload = match conn.recv_payload(header.payload_size).await {
            Ok(payload) => payload,
            Err(TransportError::InvalidUtf8) => {
                return Ok(Message::error_response(sequence, "record is not valid UTF-8")?);
            }
            Err(e) => return Err(e.into()),
        };

        match self.ingest(header, payload).await {
            Ok(()) => Ok(Message::response(sequence)?),
            Err(e) => {
                warn!(sequence, error = %e, "failed to store record");
                Ok(Message::error_response(sequence, e.to_string())?)
            }
        }
    }

    async fn ingest(&self, header: MessageHeader, payload: String) -> Result<()> {
        if header.kind != MessageKind::Request {
            return Err(ReplError::Protocol {
                msg: format!("expected {}, received {}", MessageKind::Request, header.kind),
            });
        }
        if header.sequence == 0 {
            return Err(ReplError::Validation {
                msg: "request sequence must be positive".to_string(),
            });
        }
        if payload.is_empty() {
            return Err(ReplError::Validation {
                msg: "request carries no record".to_string(),
            });
        }

        let sequence = header.sequence;
        let outcome = self.log.lock().commit(sequence, payload)?;
        match outcome {
            CommitOutcome::Committed { appended } => {
                info!(sequence, appended, "committed record");
            }
            CommitOutcome::Buffered => {
                debug!(sequence, "buffered record until predecessors arrive");
            }
            CommitOutcome::Duplicate => {
                debug!(sequence, "ignoring redelivered record");
            }
        }

        if let Some(delay) = self.artificial_delay {
            let delayed = rand::thread_rng().gen_bool(delay.chance());
            if delayed {
                debug!(sequence, delay_ms = delay.delay.as_millis() as u64, "delaying acknowledgement");
                tokio::time::sleep(delay.delay).await;
            }
        }
        Ok(())
    }
}

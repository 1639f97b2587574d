//! TCP transport implementation

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::protocol::{Message, MessageHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Deadline for a single send or receive; `None` waits forever.
    pub io_timeout: Option<Duration>,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Some(Duration::from_secs(5)),
            nodelay: true,
        }
    }
}

/// TCP transport: creates connections
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration connections are created with.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    /// Establishes a TCP connection to the specified address.
    pub async fn connect(&self, addr: &str) -> Result<TcpConnection> {
        let timeout = self.config.connect_timeout;
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(TransportError::IoError)?;
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        tracing::trace!(addr = addr, "TCP connected");
        Ok(TcpConnection::from_stream(stream, self.config.io_timeout))
    }

    /// Binds to the specified address and returns a listener for incoming connections.
    pub async fn listen(&self, addr: &str) -> Result<tokio::net::TcpListener> {
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(TransportError::IoError)
    }

    /// Accepts an incoming TCP connection from the listener.
    pub async fn accept(&self, listener: &tokio::net::TcpListener) -> Result<TcpConnection> {
        let (stream, _) = listener.accept().await.map_err(TransportError::IoError)?;
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        Ok(TcpConnection::from_stream(stream, self.config.io_timeout))
    }
}

/// A single TCP connection carrying framed [`Message`]s.
pub struct TcpConnection {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
    io_timeout: Option<Duration>,
    peer_addr: String,
    local_addr: String,
}

impl TcpConnection {
    pub(crate) fn from_stream(stream: tokio::net::TcpStream, io_timeout: Option<Duration>) -> Self {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read, write) = stream.into_split();
        Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            io_timeout,
            peer_addr,
            local_addr,
        }
    }

    async fn with_io_timeout<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match self.io_timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| TransportError::IoTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })?
                .map_err(TransportError::IoError),
            None => fut.await.map_err(TransportError::IoError),
        }
    }

    /// Sends a message over the TCP connection.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        let encoded = message.encode()?;
        let mut write = self.write.lock().await;
        self.with_io_timeout(async {
            write.write_all(&encoded).await?;
            write.flush().await
        })
        .await
    }

    /// Receives the next header.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly between
    /// messages. A close in the middle of a header is `ConnectionClosed`; a
    /// timeout in the middle of one is `StalledFrame`.
    pub async fn recv_header(&self) -> Result<Option<MessageHeader>> {
        let mut buf = [0u8; HEADER_SIZE];
        let filled = self.read_frame_part(&mut buf, false).await?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < HEADER_SIZE {
            return Err(TransportError::ConnectionClosed);
        }
        MessageHeader::decode(&buf).map(Some)
    }

    /// Reads exactly `size` payload bytes and decodes them as UTF-8.
    ///
    /// The header has already been consumed, so any timeout here is `StalledFrame`.
    pub async fn recv_payload(&self, size: u32) -> Result<String> {
        if size > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: size as u64,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        let mut payload = vec![0u8; size as usize];
        if !payload.is_empty() {
            let filled = self.read_frame_part(&mut payload, true).await?;
            if filled < payload.len() {
                return Err(TransportError::ConnectionClosed);
            }
        }
        String::from_utf8(payload).map_err(|_| TransportError::InvalidUtf8)
    }

    /// Fills `buf`, stopping early only at end of stream.
    ///
    /// A timeout once part of a frame has been consumed leaves the stream
    /// unframed and is reported as `StalledFrame`.
    async fn read_frame_part(&self, buf: &mut [u8], mid_frame: bool) -> Result<usize> {
        let mut read = self.read.lock().await;
        let mut filled = 0;
        let result = self.with_io_timeout(read_full(&mut *read, buf, &mut filled)).await;
        match result {
            Err(TransportError::IoTimeout { timeout_ms }) if mid_frame || filled > 0 => {
                Err(TransportError::StalledFrame {
                    received: filled,
                    expected: buf.len(),
                    timeout_ms,
                })
            }
            other => other,
        }
    }

    /// Receives a whole message, or `Ok(None)` on a clean close.
    pub async fn recv_message(&self) -> Result<Option<Message>> {
        let header = match self.recv_header().await? {
            Some(header) => header,
            None => return Ok(None),
        };
        let payload = self.recv_payload(header.payload_size).await?;
        Message::from_parts(header, payload).map(Some)
    }

    /// Returns the remote peer address of this TCP connection as a string.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Returns the local address of this TCP connection as a string.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

/// Progress is kept in `filled` so it survives the future being dropped on timeout.
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    filled: &mut usize,
) -> std::io::Result<usize> {
    while *filled < buf.len() {
        let n = reader.read(&mut buf[*filled..]).await?;
        if n == 0 {
            break;
        }
        *filled += n;
    }
    Ok(*filled)
}

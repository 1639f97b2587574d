#![warn(missing_docs)]

//! relog transport subsystem: 8-byte header wire codec, framed TCP connections

pub mod error;
pub mod protocol;
pub mod tcp;

pub use error::{ErrorKind, Result, TransportError};
pub use protocol::{Message, MessageHeader, MessageKind};
pub use tcp::{TcpConnection, TcpTransport, TcpTransportConfig};

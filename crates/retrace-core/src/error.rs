use std::fmt::{Display, Formatter};
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use thiserror::Error;
use retrace_packet::error::Error as PacketError;

/// A probing error result.
pub type Result<T> = std::result::Result<T, Error>;

/// A probing error.
#[derive(Error, Debug)]
pub enum Error {
    /// The channel's BPF filter does not permit the requested operation.
    #[error("BPF filter must be {expected}: got {actual} instead")]
    FilterMismatch { expected: String, actual: String },
    /// The path is too short for the requested operation.
    #[error("path must have at least {0} hops")]
    PathTooShort(usize),
    #[error("unknown interface: {0}")]
    UnknownInterface(String),
    /// The operation needs the dispatch task but the channel was built
    /// without it.
    #[error("listener dispatch is not enabled for this channel")]
    ListenersDisabled,
    #[error("transport channel is closed")]
    Closed,
    #[error("missing address from socket call")]
    MissingAddr,
    #[error("malformed probe payload")]
    MalformedPayload,
    #[error("invalid packet: {0}")]
    Packet(#[from] PacketError),
    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

/// Custom IO error result.
pub type IoResult<T> = std::result::Result<T, IoError>;

/// Custom IO error.
#[derive(Error, Debug)]
pub enum IoError {
    #[error("Sendto error for {1}: {0}")]
    SendTo(io::Error, SocketAddr),
    #[error("Connect error for {1}: {0}")]
    Connect(io::Error, SocketAddr),
    #[error("Failed to {1}: {0}")]
    Other(io::Error, IoOperation),
}

impl IoError {
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::SendTo(e, _) | Self::Connect(e, _) | Self::Other(e, _) => e.raw_os_error(),
        }
    }
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SendTo(e, _) | Self::Connect(e, _) | Self::Other(e, _) => e.kind(),
        }
    }
}

/// Io operation.
#[derive(Debug)]
pub enum IoOperation {
    NewSocket,
    SetHeaderIncluded,
    LocalAddr,
    RunCommand,
}

impl Display for IoOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSocket => write!(f, "create new socket"),
            Self::SetHeaderIncluded => write!(f, "set header included"),
            Self::LocalAddr => write!(f, "local addr"),
            Self::RunCommand => write!(f, "run command"),
        }
    }
}

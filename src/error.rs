use crate::channel::ChannelRole;
use std::io::ErrorKind;
use std::net::SocketAddr;
use thiserror::Error;

/// The error type for cachelink operations.
///
/// Most networking failures during link establishment never surface as an
/// `Error`: the handshake absorbs them and tries again. What does surface is
/// configuration problems, resource exhaustion at connection creation, and
/// protocol violations detected while parsing a peer's first packet.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An address from configuration could not be parsed.
    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    /// Local and peer addresses belong to different address families.
    #[error("Address family mismatch: local {local}, peer {peer}")]
    AddressFamilyMismatch { local: SocketAddr, peer: SocketAddr },

    /// Creating or binding a socket to the local address failed.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Switching a bound socket into listening mode failed.
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// An outgoing connection to the peer could not be established.
    #[error("Failed to dial {peer} from {local}: {source}")]
    Dial {
        local: SocketAddr,
        peer: SocketAddr,
        source: std::io::Error,
    },

    /// A channel buffer could not be allocated.
    #[error("Out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    // ============================================================================
    // Protocol Errors
    // ============================================================================

    /// First packet doesn't start with the expected magic bytes.
    #[error("Invalid magic bytes in packet header")]
    InvalidMagicBytes,

    /// Peer speaks a different protocol version.
    #[error("Protocol version mismatch: expected {expected_major}.{expected_minor}, but peer uses {received_major}.{received_minor}")]
    VersionMismatch {
        expected_major: u8,
        expected_minor: u8,
        received_major: u8,
        received_minor: u8,
    },

    /// Peer sent a packet command outside the known enumeration.
    #[error("Unknown packet command {0:#06x}")]
    UnknownPacket(u16),

    /// Packet header is well-formed but its contents are not.
    #[error("Malformed packet: {0}")]
    MalformedData(String),

    // ============================================================================
    // Logic Errors
    // ============================================================================

    /// A socket was attached to a channel that still holds one.
    #[error("{0} channel already holds a socket")]
    ChannelOccupied(ChannelRole),

    /// An outgoing connection succeeded while both channel slots were filled.
    #[error("Both channel slots are already filled")]
    BothChannelsFilled,

    // ============================================================================
    // Thread Errors
    // ============================================================================

    /// The OS refused to create a worker thread.
    #[error("Failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        name: String,
        source: std::io::Error,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Returns true for I/O errors caused by a socket timeout expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Io(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut))
    }

    /// Returns true if the error means the peer does not speak our protocol.
    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(
            self,
            Error::InvalidMagicBytes
                | Error::VersionMismatch { .. }
                | Error::UnknownPacket(_)
                | Error::MalformedData(_)
        )
    }
}

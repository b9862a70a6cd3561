//! The first packet on every freshly assigned socket.
//!
//! Wire format: \[MAGIC\]\[VERSION\]\[command\]\[body_size\]
//! - MAGIC: 4 bytes ("ccn!") - helps detect protocol mismatches
//! - VERSION: 2 bytes (major, minor) - protocol version
//! - command: 2 bytes (u16 LE) - packet type, see [`PacketKind`]
//! - body_size: 4 bytes (u32 LE) - always zero for first packets
//!
//! The header is fixed-size, so a receiver always reads exactly
//! [`HEADER_SIZE`] bytes before it knows which channel it is holding.

use crate::channel::ChannelRole;
use crate::error::Error;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::{trace, warn};

const MAGIC: &[u8] = b"ccn!";
const MAGIC_SIZE: usize = MAGIC.len();
const VERSION_MAJOR: u8 = 0;
const VERSION_MINOR: u8 = 1;
const VERSION_SIZE: usize = 2;
const COMMAND_SIZE: usize = 2;
const BODY_SIZE_SIZE: usize = 4;

/// Size of a first packet on the wire.
pub const HEADER_SIZE: usize = MAGIC_SIZE + VERSION_SIZE + COMMAND_SIZE + BODY_SIZE_SIZE;

/// Commands a first packet can carry.
///
/// The enumeration is closed: any other command value is rejected with
/// [`Error::UnknownPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketKind {
    /// The socket is the sender's data channel.
    InitialData = 0xfff1,
    /// The socket is the sender's meta channel.
    InitialMeta = 0xfff2,
}

impl PacketKind {
    /// The first packet announcing `role`.
    pub fn for_role(role: ChannelRole) -> Self {
        match role {
            ChannelRole::Data => PacketKind::InitialData,
            ChannelRole::Meta => PacketKind::InitialMeta,
        }
    }

    /// The channel role this packet announces.
    pub fn role(self) -> ChannelRole {
        match self {
            PacketKind::InitialData => ChannelRole::Data,
            PacketKind::InitialMeta => ChannelRole::Meta,
        }
    }

    /// On-wire command value.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Parses an on-wire command value.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0xfff1 => Some(PacketKind::InitialData),
            0xfff2 => Some(PacketKind::InitialMeta),
            _ => None,
        }
    }
}

/// Encodes a first packet.
pub fn encode(kind: PacketKind) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[..MAGIC_SIZE].copy_from_slice(MAGIC);
    buf[MAGIC_SIZE] = VERSION_MAJOR;
    buf[MAGIC_SIZE + 1] = VERSION_MINOR;
    let command_pos = MAGIC_SIZE + VERSION_SIZE;
    buf[command_pos..command_pos + COMMAND_SIZE].copy_from_slice(&kind.code().to_le_bytes());
    // body_size stays zero
    buf
}

/// Decodes a first packet.
///
/// Fails with a protocol error if the bytes are not a first packet of our
/// protocol version.
pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<PacketKind, Error> {
    if &buf[..MAGIC_SIZE] != MAGIC {
        warn!(
            expected = ?MAGIC,
            received = ?&buf[..MAGIC_SIZE],
            "Invalid magic bytes in first packet"
        );
        return Err(Error::InvalidMagicBytes);
    }

    let version_major = buf[MAGIC_SIZE];
    let version_minor = buf[MAGIC_SIZE + 1];
    if version_major != VERSION_MAJOR || version_minor != VERSION_MINOR {
        warn!(
            expected_major = VERSION_MAJOR,
            expected_minor = VERSION_MINOR,
            received_major = version_major,
            received_minor = version_minor,
            "Protocol version mismatch"
        );
        return Err(Error::VersionMismatch {
            expected_major: VERSION_MAJOR,
            expected_minor: VERSION_MINOR,
            received_major: version_major,
            received_minor: version_minor,
        });
    }

    let command_pos = MAGIC_SIZE + VERSION_SIZE;
    let command = u16::from_le_bytes([buf[command_pos], buf[command_pos + 1]]);

    let body_pos = command_pos + COMMAND_SIZE;
    let body_size = u32::from_le_bytes([
        buf[body_pos],
        buf[body_pos + 1],
        buf[body_pos + 2],
        buf[body_pos + 3],
    ]);

    let kind = PacketKind::from_code(command).ok_or(Error::UnknownPacket(command))?;
    if body_size != 0 {
        return Err(Error::MalformedData(format!(
            "first packet carries a {body_size} byte body"
        )));
    }
    Ok(kind)
}

/// Writes the first packet announcing `kind` to `stream`.
pub fn send_first_packet(mut stream: &TcpStream, kind: PacketKind) -> Result<(), Error> {
    trace!(?kind, "Sending first packet");
    stream.write_all(&encode(kind))?;
    Ok(())
}

/// Reads exactly one first packet from `stream`, waiting at most `timeout`.
pub fn receive_first_packet(mut stream: &TcpStream, timeout: Duration) -> Result<PacketKind, Error> {
    stream.set_read_timeout(Some(timeout))?;
    let mut buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut buf)?;
    let kind = decode(&buf)?;
    trace!(?kind, "Received first packet");
    Ok(kind)
}

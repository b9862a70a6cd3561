//! Channel resources: one TCP role with its page-sized buffers.

use crate::error::Error;
use socket2::SockRef;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::mem::MaybeUninit;
use std::net::{Shutdown, TcpStream};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace};

/// Size of the send and receive buffer of every channel.
pub const PAGE_SIZE: usize = 4096;

const PROBE_SIZE: usize = 4;
const PEEK_FLAGS: libc::c_int = libc::MSG_PEEK | libc::MSG_DONTWAIT;

/// The role a TCP connection plays within a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Bulk replicated payload.
    Data,
    /// Control and acknowledgment traffic.
    Meta,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Data => f.write_str("data"),
            ChannelRole::Meta => f.write_str("meta"),
        }
    }
}

/// The mutex-protected part of a [`ChannelResource`].
///
/// Holding the guard means no one else can close the socket or use the send
/// buffer until it is dropped.
#[derive(Debug)]
pub struct ChannelSocket {
    stream: Option<TcpStream>,
    send_buf: Vec<u8>,
}

impl ChannelSocket {
    /// The socket, if the channel is established.
    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Returns true if a socket is present.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Page-sized scratch buffer for outgoing packets.
    pub fn send_buf_mut(&mut self) -> &mut [u8] {
        &mut self.send_buf
    }
}

/// One logical TCP role of a link: a socket slot plus send and receive
/// buffers.
///
/// The socket slot and the send buffer share one mutex, which serializes
/// teardown against concurrent senders. The receive buffer has its own lock
/// because only the thread serving the channel reads from it.
#[derive(Debug)]
pub struct ChannelResource {
    role: ChannelRole,
    socket: Mutex<ChannelSocket>,
    recv_buf: Mutex<Vec<u8>>,
}

fn allocate_page() -> Result<Vec<u8>, Error> {
    let mut page = Vec::new();
    page.try_reserve_exact(PAGE_SIZE)
        .map_err(|_| Error::OutOfMemory {
            requested: PAGE_SIZE,
        })?;
    page.resize(PAGE_SIZE, 0);
    Ok(page)
}

impl ChannelResource {
    /// Reserves the send and receive buffers of an empty channel.
    pub fn allocate(role: ChannelRole) -> Result<Self, Error> {
        let send_buf = allocate_page()?;
        let recv_buf = allocate_page()?;
        Ok(Self {
            role,
            socket: Mutex::new(ChannelSocket {
                stream: None,
                send_buf,
            }),
            recv_buf: Mutex::new(recv_buf),
        })
    }

    /// The role of this channel.
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Locks the socket slot. All access to the socket goes through here.
    pub fn lock(&self) -> MutexGuard<'_, ChannelSocket> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if a socket is present.
    pub fn is_open(&self) -> bool {
        self.lock().is_open()
    }

    /// Installs a freshly established socket.
    ///
    /// Fails if the channel still holds a socket; it has to be closed first.
    pub fn attach(&self, stream: TcpStream) -> Result<(), Error> {
        let mut socket = self.lock();
        if socket.stream.is_some() {
            return Err(Error::ChannelOccupied(self.role));
        }
        debug!(role = %self.role, peer_addr = ?stream.peer_addr().ok(), "Channel attached");
        socket.stream = Some(stream);
        Ok(())
    }

    /// Shuts the socket down in both directions and releases it.
    ///
    /// Closing an empty channel is a no-op.
    pub fn close(&self) {
        let mut socket = self.lock();
        if let Some(stream) = socket.stream.take() {
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                // ENOTCONN after the peer reset the connection is expected
                debug!(role = %self.role, ?err, "Error shutting down channel");
            }
            info!(role = %self.role, "Closed channel");
        }
    }

    /// Non-destructive liveness check of the channel's socket.
    ///
    /// A dead socket is released as a side effect.
    pub fn check_alive(&self) -> bool {
        let mut socket = self.lock();
        let alive = socket_okay(&mut socket.stream);
        if !alive {
            trace!(role = %self.role, "Channel is not alive");
        }
        alive
    }

    /// Sends `payload` through the page-sized send buffer.
    ///
    /// Returns `Ok(false)` if the channel has no socket.
    pub fn send(&self, payload: &[u8]) -> Result<bool, Error> {
        let mut socket = self.lock();
        let ChannelSocket { stream, send_buf } = &mut *socket;
        let Some(stream) = stream.as_mut() else {
            return Ok(false);
        };

        for chunk in payload.chunks(send_buf.len()) {
            let staged = &mut send_buf[..chunk.len()];
            staged.copy_from_slice(chunk);
            stream.write_all(staged)?;
        }
        trace!(role = %self.role, len = payload.len(), "Sent on channel");
        Ok(true)
    }

    /// Returns a second handle to the socket for blocking reads.
    ///
    /// Reads through the handle don't hold the channel mutex. Closing the
    /// channel shuts the socket down, which ends any blocked read with EOF.
    pub fn reader(&self) -> Result<Option<TcpStream>, Error> {
        let socket = self.lock();
        match socket.stream.as_ref() {
            Some(stream) => Ok(Some(stream.try_clone()?)),
            None => Ok(None),
        }
    }

    /// Reads up to one page from `reader` into the receive buffer.
    ///
    /// Returns `Ok(None)` when the peer closed the connection.
    pub fn recv(&self, reader: &mut TcpStream) -> Result<Option<Vec<u8>>, Error> {
        let mut recv_buf = self.recv_buf.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match reader.read(&mut recv_buf) {
                Ok(0) => return Ok(None),
                Ok(len) => {
                    trace!(role = %self.role, len, "Received on channel");
                    return Ok(Some(recv_buf[..len].to_vec()));
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for ChannelResource {
    fn drop(&mut self) {
        if self.is_open() {
            debug!(role = %self.role, "Channel dropped while open");
            self.close();
        }
    }
}

/// Peeks at `slot` without consuming anything and without blocking.
///
/// Pending bytes or a would-block result mean the socket is alive. EOF or
/// any error means it is dead: it is released and the slot is cleared.
/// An empty slot is never alive.
///
/// The peek is non-blocking per call (`MSG_DONTWAIT`), so the socket's own
/// blocking mode is left alone and concurrent readers are not disturbed.
pub fn socket_okay(slot: &mut Option<TcpStream>) -> bool {
    let Some(stream) = slot.as_ref() else {
        return false;
    };

    let mut probe = [MaybeUninit::<u8>::uninit(); PROBE_SIZE];
    let alive = match SockRef::from(stream).recv_with_flags(&mut probe, PEEK_FLAGS) {
        Ok(len) => len > 0,
        Err(err) => matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted),
    };
    if alive {
        return true;
    }

    trace!(peer_addr = ?stream.peer_addr().ok(), "Releasing dead socket");
    *slot = None;
    false
}

//! The passive side of a handshake attempt.
//!
//! A [`Listener`] owns the listening socket plus a mio poll with a waker
//! (the "doorbell"). Accept waits go through the poll with a timeout, so a
//! stop request that rings the doorbell ends the wait right away.

use crate::error::Error;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

const DOORBELL: Token = Token(0);
const INCOMING: Token = Token(1);
const BACKLOG: i32 = 5;
const EVENT_CAPACITY: usize = 8;

/// Result of one wait on the [`Listener`].
#[derive(Debug)]
pub enum AcceptWait {
    /// A peer connected. The stream is in blocking mode.
    Accepted(TcpStream),
    /// The accept timeout expired without a connection.
    TimedOut,
    /// The doorbell rang.
    Interrupted,
}

impl AcceptWait {
    /// The accepted stream, if any.
    pub fn into_stream(self) -> Option<TcpStream> {
        match self {
            AcceptWait::Accepted(stream) => Some(stream),
            AcceptWait::TimedOut | AcceptWait::Interrupted => None,
        }
    }
}

/// A bound, listening socket with its doorbell.
///
/// Exists for the duration of one handshake attempt. Dropping it closes the
/// listening socket.
#[derive(Debug)]
pub struct Listener {
    socket: TcpListener,
    poll: Poll,
    events: Events,
    doorbell: Arc<Waker>,
    local_addr: SocketAddr,
    accept_timeout: Duration,
}

impl Listener {
    /// Binds to `local_addr` and starts listening.
    ///
    /// The socket is created for the address family of `local_addr` with
    /// address reuse enabled and a backlog of 5. Any failure releases what
    /// was built so far.
    #[instrument(skip(accept_timeout))]
    pub fn prepare(local_addr: SocketAddr, accept_timeout: Duration) -> Result<Self, Error> {
        let bind_err = |source| Error::Bind {
            addr: local_addr,
            source,
        };

        let socket = Socket::new(Domain::for_address(local_addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.bind(&local_addr.into()).map_err(bind_err)?;
        socket.listen(BACKLOG).map_err(|source| Error::Listen {
            addr: local_addr,
            source,
        })?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        let socket: TcpListener = socket.into();

        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&socket.as_raw_fd()),
            INCOMING,
            Interest::READABLE,
        )?;
        let doorbell = Arc::new(Waker::new(poll.registry(), DOORBELL)?);

        debug!(%local_addr, "Listening for peer connections");
        Ok(Self {
            socket,
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            doorbell,
            local_addr,
            accept_timeout,
        })
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Default bound of one [`accept()`](Self::accept) wait.
    pub fn accept_timeout(&self) -> Duration {
        self.accept_timeout
    }

    /// The waker that interrupts [`accept()`](Self::accept).
    pub fn doorbell(&self) -> Arc<Waker> {
        Arc::clone(&self.doorbell)
    }

    /// Waits up to the accept timeout for one inbound connection.
    pub fn accept(&mut self) -> AcceptWait {
        self.accept_within(self.accept_timeout)
    }

    /// Waits up to `timeout` for one inbound connection.
    ///
    /// Interrupted system calls, would-block results and aborted handshakes
    /// are retried until the timeout expires. Other accept failures are
    /// logged and reported as [`AcceptWait::TimedOut`].
    pub fn accept_within(&mut self, timeout: Duration) -> AcceptWait {
        // No deadline if it lies beyond what `Instant` can represent.
        let deadline = Instant::now().checked_add(timeout);

        loop {
            // mio is edge-triggered: drain the backlog before sleeping.
            match self.socket.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(err) = stream.set_nonblocking(false) {
                        warn!(?err, %peer_addr, "Failed to make accepted socket blocking");
                        continue;
                    }
                    info!(local_addr = %self.local_addr, %peer_addr, "Accepted connection");
                    return AcceptWait::Accepted(stream);
                }
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => {}
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        debug!(?err, local_addr = %self.local_addr, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, local_addr = %self.local_addr, "Error accepting connection");
                        return AcceptWait::TimedOut;
                    }
                },
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if remaining.is_zero() {
                trace!(local_addr = %self.local_addr, "Accept timed out");
                return AcceptWait::TimedOut;
            }

            if let Err(err) = self.poll.poll(&mut self.events, Some(remaining)) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(?err, local_addr = %self.local_addr, "Error waiting for connections");
                return AcceptWait::TimedOut;
            }

            if self.events.iter().any(|event| event.token() == DOORBELL) {
                debug!(local_addr = %self.local_addr, "Accept interrupted by doorbell");
                return AcceptWait::Interrupted;
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(err) = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&self.socket.as_raw_fd()))
        {
            trace!(?err, "Failed to deregister listener");
        }
        info!(local_addr = %self.local_addr, "Closed listener");
    }
}

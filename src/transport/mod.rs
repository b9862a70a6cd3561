//! Socket plumbing for the handshake: the listening side, the dialing side
//! and the options applied once a link is established.

mod connector;
mod listener;

pub use connector::dial;
pub use listener::{AcceptWait, Listener};

use crate::config::LinkConfig;
use crate::error::Error;
use socket2::SockRef;
use std::net::TcpStream;
use tracing::trace;

/// Switches both channels to their steady-state socket options.
///
/// Nagle's algorithm is disabled and address reuse is set on both sockets.
/// The data channel gets short send and receive timeouts. The meta channel
/// waits up to one ping interval for incoming traffic and up to the link
/// timeout for outgoing traffic.
pub fn apply_link_options(data: &TcpStream, meta: &TcpStream, config: &LinkConfig) -> Result<(), Error> {
    for stream in [data, meta] {
        stream.set_nodelay(true)?;
        SockRef::from(stream).set_reuse_address(true)?;
    }

    let data_timeout = config.data_timeout();
    data.set_read_timeout(Some(data_timeout))?;
    data.set_write_timeout(Some(data_timeout))?;

    meta.set_read_timeout(Some(config.ping_interval))?;
    meta.set_write_timeout(Some(config.link_timeout))?;

    trace!(?data_timeout, ping_interval = ?config.ping_interval, link_timeout = ?config.link_timeout, "Applied link options");
    Ok(())
}

//! The active side of a handshake attempt.

use crate::error::Error;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::{debug, info};

/// Dials `peer_addr` from the IP of `local_addr` with an ephemeral port.
///
/// The port of `local_addr` is ignored; it belongs to the listener. The
/// connect is bounded by `timeout`, which also becomes the read and write
/// timeout of the returned stream until the link is finalized.
///
/// A failed dial is an expected outcome while the peer is down or busy
/// dialing us, so it is only logged at debug level.
pub fn dial(local_addr: SocketAddr, peer_addr: SocketAddr, timeout: Duration) -> Result<TcpStream, Error> {
    let dial_err = |source| Error::Dial {
        local: local_addr,
        peer: peer_addr,
        source,
    };

    if local_addr.is_ipv4() != peer_addr.is_ipv4() {
        return Err(Error::AddressFamilyMismatch {
            local: local_addr,
            peer: peer_addr,
        });
    }

    let result = (|| {
        let socket = Socket::new(Domain::for_address(peer_addr), Type::STREAM, Some(Protocol::TCP))?;
        let mut source = local_addr;
        source.set_port(0);
        socket.bind(&source.into())?;
        socket.connect_timeout(&peer_addr.into(), timeout)?;
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;
        Ok::<TcpStream, std::io::Error>(socket.into())
    })();

    match result {
        Ok(stream) => {
            info!(
                local_addr = ?stream.local_addr().ok(),
                %peer_addr,
                "Connected to peer"
            );
            Ok(stream)
        }
        Err(source) => {
            debug!(%local_addr, %peer_addr, ?source, "Dial failed");
            Err(dial_err(source))
        }
    }
}

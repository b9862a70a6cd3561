//! CacheLink - peer link establishment for block cache replication
//!
//! Two cache nodes replicate over a pair of TCP connections: a data channel
//! for bulk payload and a meta channel for control traffic. Both nodes listen
//! and both dial; a rendezvous handshake sorts the resulting sockets into the
//! two channels, resolves crossed connections and checks that both channels
//! are alive. A [`Connection`] keeps re-running the handshake whenever the
//! data channel is lost, until it is shut down.
//!
//! The payload protocol spoken once the channels are up is left to a
//! [`ChannelHandler`].

// Internal-only modules
pub(crate) mod channel;
pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod error;
pub(crate) mod handshake;
pub(crate) mod packet;
pub(crate) mod thread;
pub(crate) mod transport;

// These are the intended public API
pub use crate::channel::{socket_okay, ChannelResource, ChannelRole, ChannelSocket, PAGE_SIZE};
pub use crate::config::LinkConfig;
pub use crate::connection::{
    ChannelHandler, ConnState, Connection, ConnectionCore, ConnectionParams, RequestQueue,
};
pub use crate::error::Error;
pub use crate::handshake::{
    CoinFlip, FixedTieBreak, Handshake, HandshakeOutcome, HandshakeStats, Link, TieBreak,
};
pub use crate::packet::{PacketKind, HEADER_SIZE};
pub use crate::thread::{DoorbellGuard, RestartableThread, ThreadControl, ThreadState};
pub use crate::transport::{apply_link_options, dial, AcceptWait, Listener};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::channel::{ChannelResource, ChannelRole};
    pub use crate::config::LinkConfig;
    pub use crate::connection::{
        ChannelHandler, ConnState, Connection, ConnectionCore, ConnectionParams,
    };
    pub use crate::error::Error;
    pub use crate::handshake::{Handshake, HandshakeOutcome, Link};
    pub use crate::thread::{RestartableThread, ThreadControl, ThreadState};
}

// Re-export the first-packet codec for protocol tests
// Hidden from documentation to discourage use in production code
#[doc(hidden)]
pub use crate::packet::{decode, encode, receive_first_packet, send_first_packet};

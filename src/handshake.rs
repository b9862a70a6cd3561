//! Rendezvous of two peers that both listen and both dial.
//!
//! Each round of an attempt dials the peer once, assigns the new socket to
//! the first empty channel slot and announces its role with a first packet.
//! The round then waits on the listener for the peer's sockets and files
//! each one by the role its first packet announces. When both peers dial the
//! same role at about the same time, the accepted socket replaces the dialed
//! one and a [`TieBreak`] decides whether to keep waiting before the next
//! liveness check. Once both slots hold live sockets the attempt finishes
//! with a [`Link`].

use crate::channel::{socket_okay, ChannelRole};
use crate::config::LinkConfig;
use crate::error::Error;
use crate::packet::{receive_first_packet, send_first_packet, PacketKind};
use crate::thread::ThreadControl;
use crate::transport::{apply_link_options, dial, AcceptWait, Listener};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::TcpStream;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

/// The two sockets of an established link.
#[derive(Debug)]
pub struct Link {
    pub data: TcpStream,
    pub meta: TcpStream,
}

/// How one handshake attempt ended.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Both channels are established and alive.
    Connected(Link),
    /// The attempt made no lasting progress; try again.
    Retry,
    /// The peer kept sending first packets we don't understand.
    Incompatible,
    /// The owning thread was asked to stop.
    Abandoned,
}

/// Counters across all attempts of one [`Handshake`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeStats {
    pub attempts: u64,
    pub rounds: u64,
    pub collisions: u64,
    pub incompatible: u64,
}

/// Breaks the symmetry between two peers running the same algorithm.
pub trait TieBreak: Send {
    /// Called after a crossed connection was resolved, and after a socket
    /// was discarded. Returning true waits on the listener once more before
    /// the liveness recheck.
    fn retry_passive(&mut self) -> bool;

    /// Bound of the next passive wait, given the configured accept timeout.
    fn accept_wait(&mut self, base: Duration) -> Duration {
        base
    }
}

/// Unbiased random tie-break. Also jitters the passive wait by a seventh of
/// the accept timeout in either direction.
pub struct CoinFlip {
    rng: StdRng,
}

impl CoinFlip {
    /// Seeds from the operating system.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Reproducible sequence of flips.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for CoinFlip {
    fn default() -> Self {
        Self::new()
    }
}

impl TieBreak for CoinFlip {
    fn retry_passive(&mut self) -> bool {
        self.rng.random_bool(0.5)
    }

    fn accept_wait(&mut self, base: Duration) -> Duration {
        let spread = base / 7;
        if self.rng.random_bool(0.5) {
            base.saturating_add(spread)
        } else {
            base - spread
        }
    }
}

/// Always makes the same choice. Meant for tests and for setups where one
/// side is known to be the passive one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTieBreak(pub bool);

impl TieBreak for FixedTieBreak {
    fn retry_passive(&mut self) -> bool {
        self.0
    }
}

// Sockets collected during one attempt. Dropping a socket releases it.
#[derive(Default)]
struct Slots {
    data: Option<TcpStream>,
    meta: Option<TcpStream>,
}

impl Slots {
    fn slot(&mut self, role: ChannelRole) -> &mut Option<TcpStream> {
        match role {
            ChannelRole::Data => &mut self.data,
            ChannelRole::Meta => &mut self.meta,
        }
    }

    // Data is filled before meta.
    fn first_empty(&self) -> Result<ChannelRole, Error> {
        if self.data.is_none() {
            Ok(ChannelRole::Data)
        } else if self.meta.is_none() {
            Ok(ChannelRole::Meta)
        } else {
            Err(Error::BothChannelsFilled)
        }
    }

    // Returns true if a socket was already there; it is released.
    fn adopt(&mut self, role: ChannelRole, stream: TcpStream) -> bool {
        self.slot(role).replace(stream).is_some()
    }

    fn full(&self) -> bool {
        self.data.is_some() && self.meta.is_some()
    }

    // Checks both slots so that every dead socket gets released.
    fn both_okay(&mut self) -> bool {
        let data = socket_okay(&mut self.data);
        let meta = socket_okay(&mut self.meta);
        data && meta
    }

    fn take_link(&mut self) -> Option<Link> {
        match (self.data.take(), self.meta.take()) {
            (Some(data), Some(meta)) => Some(Link { data, meta }),
            _ => None,
        }
    }
}

/// Runs handshake attempts against one peer.
///
/// Only one attempt runs at a time; the listener and every socket of an
/// attempt belong to that attempt alone and are released when it ends
/// without a link.
pub struct Handshake {
    config: LinkConfig,
    tie_break: Box<dyn TieBreak>,
    stats: HandshakeStats,
}

impl Handshake {
    /// Creates a coordinator with the randomized tie-break.
    ///
    /// Fails if local and peer address belong to different families.
    pub fn new(config: LinkConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            tie_break: Box::new(CoinFlip::new()),
            stats: HandshakeStats::default(),
        })
    }

    /// Replaces the tie-break.
    pub fn with_tie_break(mut self, tie_break: impl TieBreak + 'static) -> Self {
        self.tie_break = Box::new(tie_break);
        self
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn stats(&self) -> HandshakeStats {
        self.stats
    }

    /// Runs one attempt.
    ///
    /// Returns [`HandshakeOutcome::Abandoned`] as soon as `control` stops
    /// running. A stop request rings the listener's doorbell, so a pending
    /// passive wait ends immediately.
    #[instrument(skip_all, fields(local_addr = %self.config.local_addr, peer_addr = %self.config.peer_addr))]
    pub fn run(&mut self, control: &ThreadControl) -> HandshakeOutcome {
        self.stats.attempts += 1;

        let mut listener = match Listener::prepare(self.config.local_addr, self.config.accept_timeout) {
            Ok(listener) => listener,
            Err(err) => {
                debug!(%err, "Couldn't prepare listener");
                return HandshakeOutcome::Retry;
            }
        };
        let _doorbell = control.install_doorbell(listener.doorbell());

        let mut slots = Slots::default();
        let mut mismatches = 0u32;

        for round in 1..=self.config.max_rounds {
            if !control.is_running() {
                return abandon();
            }
            self.stats.rounds += 1;
            trace!(round, "Handshake round");

            if let Ok(stream) = dial(self.config.local_addr, self.config.peer_addr, self.config.connect_timeout) {
                let role = match slots.first_empty() {
                    Ok(role) => role,
                    Err(err) => {
                        error!(%err, "Handshake logic error");
                        return HandshakeOutcome::Retry;
                    }
                };
                match send_first_packet(&stream, PacketKind::for_role(role)) {
                    Ok(()) => *slots.slot(role) = Some(stream),
                    Err(err) => debug!(%role, %err, "Couldn't send first packet"),
                }
            }

            if slots.full() {
                if !control.pause(self.config.liveness_delay) {
                    return abandon();
                }
                if slots.both_okay() {
                    return self.finalize(listener, slots);
                }
            }

            loop {
                if !control.is_running() {
                    return abandon();
                }

                let wait = self.tie_break.accept_wait(listener.accept_timeout());
                let stream = match listener.accept_within(wait) {
                    AcceptWait::Accepted(stream) => stream,
                    AcceptWait::TimedOut | AcceptWait::Interrupted => break,
                };

                let contested = match receive_first_packet(&stream, self.config.accept_timeout) {
                    Ok(kind) => {
                        let role = kind.role();
                        if slots.adopt(role, stream) {
                            self.stats.collisions += 1;
                            debug!(%role, "First packet crossed");
                            true
                        } else {
                            debug!(%role, "Received first packet");
                            false
                        }
                    }
                    Err(err) if err.is_protocol_mismatch() => {
                        mismatches += 1;
                        self.stats.incompatible += 1;
                        warn!(%err, peer_addr = ?stream.peer_addr().ok(), "Discarding socket with unrecognized first packet");
                        true
                    }
                    Err(err) => {
                        debug!(%err, "Couldn't receive first packet");
                        true
                    }
                };

                if contested && self.tie_break.retry_passive() {
                    continue;
                }
                break;
            }

            if !control.is_running() {
                return abandon();
            }
            if slots.both_okay() {
                return self.finalize(listener, slots);
            }
        }

        if mismatches > 0 {
            warn!(mismatches, "Peer does not speak our protocol");
            HandshakeOutcome::Incompatible
        } else {
            debug!(rounds = self.config.max_rounds, "Handshake rounds exhausted");
            HandshakeOutcome::Retry
        }
    }

    fn finalize(&self, listener: Listener, mut slots: Slots) -> HandshakeOutcome {
        drop(listener);

        let Some(link) = slots.take_link() else {
            return HandshakeOutcome::Retry;
        };
        if let Err(err) = apply_link_options(&link.data, &link.meta, &self.config) {
            warn!(%err, "Couldn't apply link options");
            return HandshakeOutcome::Retry;
        }

        info!(
            data_local = ?link.data.local_addr().ok(),
            meta_local = ?link.meta.local_addr().ok(),
            "Handshake complete"
        );
        HandshakeOutcome::Connected(link)
    }
}

fn abandon() -> HandshakeOutcome {
    debug!("Handshake abandoned");
    HandshakeOutcome::Abandoned
}

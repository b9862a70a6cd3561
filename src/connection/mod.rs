//! The logical link to one peer.
//!
//! A [`Connection`] owns the data and meta channels and two restartable
//! threads. The receiver runs handshakes until one succeeds, starts the
//! meta thread, then hands the data channel to the serving layer. When
//! serving ends while the receiver should keep running, the data channel is
//! released and the next handshake starts. The meta thread serves the meta
//! channel until it dies, then releases it.

mod queue;

pub use queue::RequestQueue;

use crate::channel::{ChannelResource, ChannelRole};
use crate::config::LinkConfig;
use crate::error::Error;
use crate::handshake::{Handshake, HandshakeOutcome, Link};
use crate::thread::{RestartableThread, ThreadControl, ThreadState};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Liveness of the link as seen by the serving layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// No link; a handshake may be in progress.
    StandAlone,
    /// Both channels are established.
    Connected,
}

/// The payload-serving layer driven by a [`Connection`].
///
/// Both serve methods run on the connection's own threads. They must return
/// once their channel is closed or once `control` stops running.
pub trait ChannelHandler: Send + Sync + 'static {
    /// Called after every successful handshake, before the meta thread
    /// starts.
    fn on_connected(&self, _core: &ConnectionCore) {}

    /// Serves the data channel on the receiver thread.
    fn serve_data(&self, core: &ConnectionCore, control: &ThreadControl);

    /// Serves the meta channel on the meta thread.
    fn serve_meta(&self, core: &ConnectionCore, control: &ThreadControl);
}

/// Everything needed to create a [`Connection`].
pub struct ConnectionParams {
    pub link: LinkConfig,
    /// If set, [`Connection::new`] waits for the first handshake to finish.
    pub peer_is_good: bool,
    /// Bound of that wait; `None` waits indefinitely.
    pub start_timeout: Option<Duration>,
    pub handler: Arc<dyn ChannelHandler>,
}

impl ConnectionParams {
    pub fn new(link: LinkConfig, handler: Arc<dyn ChannelHandler>) -> Self {
        Self {
            link,
            peer_is_good: false,
            start_timeout: None,
            handler,
        }
    }
}

/// State shared by a [`Connection`] and its threads.
pub struct ConnectionCore {
    config: LinkConfig,
    cstate: Mutex<ConnState>,
    data: ChannelResource,
    meta: ChannelResource,
    ko_count: AtomicU32,
    last_received: Mutex<Instant>,
    packet_seq: AtomicU32,
    requests: RequestQueue,
    receiver: RestartableThread,
    asender: RestartableThread,
    handler: Arc<dyn ChannelHandler>,
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("local_addr", &self.config.local_addr)
            .field("peer_addr", &self.config.peer_addr)
            .field("state", &self.state())
            .field("receiver", &self.receiver.state())
            .field("asender", &self.asender.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionCore {
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        self.cstate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnState {
        *self.lock_state()
    }

    fn set_state(&self, state: ConnState) {
        let mut cstate = self.lock_state();
        if *cstate != state {
            info!(peer_addr = %self.config.peer_addr, from = ?*cstate, to = ?state, "Connection state changed");
            *cstate = state;
        }
    }

    /// The channel of `role`.
    pub fn channel(&self, role: ChannelRole) -> &ChannelResource {
        match role {
            ChannelRole::Data => &self.data,
            ChannelRole::Meta => &self.meta,
        }
    }

    pub fn data(&self) -> &ChannelResource {
        &self.data
    }

    pub fn meta(&self) -> &ChannelResource {
        &self.meta
    }

    /// Keep-alive threshold of the serving layer.
    pub fn ko_count(&self) -> u32 {
        self.ko_count.load(Ordering::Relaxed)
    }

    pub fn set_ko_count(&self, count: u32) {
        self.ko_count.store(count, Ordering::Relaxed);
    }

    /// Returns the next packet sequence number. Wraps around.
    pub fn next_packet_seq(&self) -> u32 {
        self.packet_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn requests(&self) -> &RequestQueue {
        &self.requests
    }

    /// Records traffic from the peer.
    pub fn touch(&self) {
        *self.last_received.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// When traffic from the peer was last recorded.
    pub fn last_received(&self) -> Instant {
        *self.last_received.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn receiver_state(&self) -> ThreadState {
        self.receiver.state()
    }

    pub fn meta_receiver_state(&self) -> ThreadState {
        self.asender.state()
    }

    /// Closes both channels. Either may already be closed.
    pub fn disconnect(&self) {
        let was_open = self.data.is_open() || self.meta.is_open();
        self.data.close();
        self.meta.close();
        self.set_state(ConnState::StandAlone);
        if was_open {
            info!(peer_addr = %self.config.peer_addr, "Connection closed");
        }
    }

    // Takes over the sockets of a fresh link.
    fn attach_link(&self, link: Link) -> Result<(), Error> {
        let Link { data, meta } = link;

        // The meta channel of the previous link may still be served.
        if self.meta.is_open() || self.asender.state() != ThreadState::Idle {
            debug!(peer_addr = %self.config.peer_addr, "Replacing previous meta channel");
            self.meta.close();
            self.asender.stop(false, true)?;
        }

        self.data.attach(data)?;
        self.meta.attach(meta)?;
        self.touch();
        self.ko_count.fetch_max(self.config.ko_floor(), Ordering::Relaxed);
        self.set_state(ConnState::Connected);
        Ok(())
    }
}

#[instrument(skip_all, fields(peer_addr = %core.config.peer_addr))]
fn receive_loop(core: &ConnectionCore, control: &ThreadControl) {
    let mut handshake = match Handshake::new(core.config.clone()) {
        Ok(handshake) => handshake,
        Err(err) => {
            error!(%err, "Invalid link configuration");
            return;
        }
    };

    while control.is_running() {
        let link = match handshake.run(control) {
            HandshakeOutcome::Connected(link) => link,
            HandshakeOutcome::Abandoned => return,
            HandshakeOutcome::Incompatible => {
                warn!("Peer is incompatible, retrying");
                control.pause(core.config.liveness_delay);
                continue;
            }
            HandshakeOutcome::Retry => {
                control.pause(core.config.liveness_delay);
                continue;
            }
        };

        if !control.is_running() {
            return;
        }
        if let Err(err) = core.attach_link(link) {
            error!(%err, "Couldn't take over link");
            core.disconnect();
            continue;
        }

        core.handler.on_connected(core);
        if control.is_running() {
            if let Err(err) = core.asender.start() {
                error!(%err, "Couldn't start meta thread");
            }
        }
        control.signal_started();

        core.handler.serve_data(core, control);

        core.set_state(ConnState::StandAlone);
        core.data.close();
        if control.is_running() {
            info!("Data channel lost, reconnecting");
        }
    }
}

fn meta_loop(core: &ConnectionCore, control: &ThreadControl) {
    core.handler.serve_meta(core, control);
    core.meta.close();
}

/// A link to one peer that keeps reconnecting until shut down.
///
/// Dropping the connection shuts it down: both threads are stopped and
/// joined and both channels are closed.
#[derive(Debug)]
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl Connection {
    /// Allocates the channels and starts the receiver.
    ///
    /// With `peer_is_good`, waits until the first handshake succeeded or
    /// `start_timeout` expired.
    pub fn new(params: ConnectionParams) -> Result<Self, Error> {
        let ConnectionParams {
            link,
            peer_is_good,
            start_timeout,
            handler,
        } = params;
        link.validate()?;

        let data = ChannelResource::allocate(ChannelRole::Data)?;
        let meta = ChannelResource::allocate(ChannelRole::Meta)?;

        let ko_floor = link.ko_floor();
        let core = Arc::new_cyclic(|weak: &Weak<ConnectionCore>| {
            let receiver_core = weak.clone();
            let receiver = RestartableThread::new("dreceiver", move |control| {
                if let Some(core) = receiver_core.upgrade() {
                    receive_loop(&core, control);
                }
            });

            let asender_core = weak.clone();
            let asender = RestartableThread::new("asender", move |control| {
                if let Some(core) = asender_core.upgrade() {
                    meta_loop(&core, control);
                }
            });

            ConnectionCore {
                config: link,
                cstate: Mutex::new(ConnState::StandAlone),
                data,
                meta,
                ko_count: AtomicU32::new(ko_floor),
                last_received: Mutex::new(Instant::now()),
                packet_seq: AtomicU32::new(0),
                requests: RequestQueue::new(),
                receiver,
                asender,
                handler,
            }
        });

        info!(
            local_addr = %core.config.local_addr,
            peer_addr = %core.config.peer_addr,
            "Created connection"
        );
        core.receiver.start()?;

        if peer_is_good && !core.receiver.control().wait_started(start_timeout) {
            warn!(peer_addr = %core.config.peer_addr, "Peer did not connect in time");
        }
        Ok(Self { core })
    }

    /// Shared state, as seen by the serving layer.
    pub fn core(&self) -> &ConnectionCore {
        &self.core
    }

    pub fn state(&self) -> ConnState {
        self.core.state()
    }

    /// Waits until the receiver finished its first handshake since it was
    /// started. Returns false on timeout.
    pub fn wait_connected(&self, timeout: Option<Duration>) -> bool {
        self.core.receiver.control().wait_started(timeout)
    }

    /// Closes both channels. The receiver notices and reconnects.
    pub fn disconnect(&self) {
        self.core.disconnect();
    }

    /// Stops both threads and closes both channels.
    pub fn shutdown(&self) {
        let core = &self.core;
        info!(peer_addr = %core.config.peer_addr, "Shutting down connection");

        // Ask both threads to exit first, then unblock their channel reads.
        for thread in [&core.receiver, &core.asender] {
            if let Err(err) = thread.stop(false, false) {
                warn!(%err, "Failed to stop thread");
            }
        }
        core.disconnect();

        // The receiver may start the meta thread until it has returned.
        for thread in [&core.receiver, &core.asender] {
            if let Err(err) = thread.stop(false, true) {
                warn!(%err, "Failed to stop thread");
            }
        }
        core.disconnect();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Connection reconnect loop tests.

mod common;

use cachelink::prelude::*;
use cachelink::RequestQueue;
use common::{init_tracing, peer_configs, wait_for};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const PATIENCE: Duration = Duration::from_secs(30);

// ============================================================================
// Helper Functions
// ============================================================================

/// Records everything received on either channel.
#[derive(Default)]
struct Recorder {
    data: Mutex<Vec<u8>>,
    meta: Mutex<Vec<u8>>,
    connects: AtomicUsize,
}

impl Recorder {
    fn has_data(&self, needle: &[u8]) -> bool {
        contains(&self.data.lock().unwrap(), needle)
    }

    fn has_meta(&self, needle: &[u8]) -> bool {
        contains(&self.meta.lock().unwrap(), needle)
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

// Reads from `role` until it closes or the thread is told to stop.
fn serve(core: &ConnectionCore, control: &ThreadControl, role: ChannelRole, sink: &Mutex<Vec<u8>>) {
    let channel = core.channel(role);
    let Ok(Some(mut reader)) = channel.reader() else {
        return;
    };
    while control.is_running() {
        match channel.recv(&mut reader) {
            Ok(Some(bytes)) => {
                core.touch();
                sink.lock().unwrap().extend_from_slice(&bytes);
            }
            Ok(None) => return,
            Err(err) if err.is_timeout() => continue,
            Err(_) => return,
        }
    }
}

impl ChannelHandler for Recorder {
    fn on_connected(&self, _core: &ConnectionCore) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn serve_data(&self, core: &ConnectionCore, control: &ThreadControl) {
        serve(core, control, ChannelRole::Data, &self.data);
    }

    fn serve_meta(&self, core: &ConnectionCore, control: &ThreadControl) {
        serve(core, control, ChannelRole::Meta, &self.meta);
    }
}

fn connect(link: LinkConfig) -> (Connection, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let handler: Arc<dyn ChannelHandler> = recorder.clone();
    let conn = Connection::new(ConnectionParams::new(link, handler)).unwrap();
    (conn, recorder)
}

// Sends `payload` on the data channel until the peer has seen it. The link
// may still be settling, so early sends can be lost.
fn deliver(from: &Connection, to: &Recorder, payload: &[u8]) -> bool {
    wait_for(PATIENCE, || {
        let _ = from.core().data().send(payload);
        std::thread::sleep(Duration::from_millis(100));
        to.has_data(payload)
    })
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn peers_connect_and_exchange() {
    init_tracing();
    let before = Instant::now();
    let (config_a, config_b) = peer_configs();
    let (a, recorder_a) = connect(config_a);
    let (b, recorder_b) = connect(config_b);

    assert!(a.wait_connected(Some(PATIENCE)));
    assert!(b.wait_connected(Some(PATIENCE)));
    assert!(deliver(&a, &recorder_b, b"hello from a"));
    assert!(deliver(&b, &recorder_a, b"hello from b"));

    assert_eq!(a.state(), ConnState::Connected);
    assert!(a.core().ko_count() >= 7);
    assert!(a.core().last_received() >= before);
    assert!(recorder_a.connects() >= 1);
    assert!(wait_for(PATIENCE, || a.core().meta_receiver_state() == ThreadState::Running));

    // Meta traffic goes to the meta handler
    let meta_seen = wait_for(PATIENCE, || {
        let _ = a.core().meta().send(b"meta ping");
        std::thread::sleep(Duration::from_millis(100));
        recorder_b.has_meta(b"meta ping")
    });
    assert!(meta_seen);
    assert!(!recorder_b.has_data(b"meta ping"));
}

#[test]
fn low_ko_count_is_raised_to_floor() {
    init_tracing();
    let (mut config_a, mut config_b) = peer_configs();
    config_a.ko_count = 3;
    config_b.ko_count = 3;
    let (a, _recorder_a) = connect(config_a);
    assert_eq!(a.core().ko_count(), 7);

    // Drag the counter down as a serving layer would, then reconnect
    a.core().set_ko_count(2);
    let (b, recorder_b) = connect(config_b);
    assert!(deliver(&a, &recorder_b, b"floor"));
    assert!(a.core().ko_count() >= 7);
    assert!(b.core().ko_count() >= 7);
}

#[test]
fn peer_restart_is_survived() {
    init_tracing();
    let (config_a, config_b) = peer_configs();
    let (a, recorder_a) = connect(config_a);
    let (b, recorder_b) = connect(config_b.clone());
    assert!(deliver(&a, &recorder_b, b"first"));

    drop(b);
    assert!(wait_for(PATIENCE, || a.state() == ConnState::StandAlone));
    assert_eq!(a.core().receiver_state(), ThreadState::Running);

    let (b, recorder_b) = connect(config_b);
    assert!(deliver(&a, &recorder_b, b"second"));
    assert!(deliver(&b, &recorder_a, b"back"));
    assert!(recorder_a.connects() >= 2);
}

#[test]
fn disconnect_triggers_reconnect() {
    init_tracing();
    let (config_a, config_b) = peer_configs();
    let (a, recorder_a) = connect(config_a);
    let (_b, recorder_b) = connect(config_b);
    assert!(deliver(&a, &recorder_b, b"before"));
    let connects = recorder_a.connects();

    a.disconnect();
    assert!(wait_for(PATIENCE, || recorder_a.connects() > connects));
    assert!(deliver(&a, &recorder_b, b"after"));
}

#[test]
fn shutdown_releases_everything() {
    init_tracing();
    let (config, _) = peer_configs();
    let local_addr = config.local_addr;

    let start = Instant::now();
    let (conn, _recorder) = connect(config);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(conn.state(), ConnState::StandAlone);
    assert_eq!(conn.core().receiver_state(), ThreadState::Running);

    std::thread::sleep(Duration::from_millis(100));
    conn.shutdown();
    assert_eq!(conn.core().receiver_state(), ThreadState::Idle);
    assert_eq!(conn.core().meta_receiver_state(), ThreadState::Idle);
    assert!(!conn.core().data().is_open());
    assert!(!conn.core().meta().is_open());

    // The listening socket is gone
    TcpListener::bind(local_addr).unwrap();

    // A second shutdown, and the one in drop, are no-ops
    conn.shutdown();
}

#[test]
fn peer_is_good_waits_for_bounded_time() {
    init_tracing();
    let (config, _) = peer_configs();
    let mut params = ConnectionParams::new(config, Arc::new(Recorder::default()));
    params.peer_is_good = true;
    params.start_timeout = Some(Duration::from_millis(300));

    let start = Instant::now();
    let conn = Connection::new(params).unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(250));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(conn.state(), ConnState::StandAlone);
}

#[test]
fn counters_and_queue() {
    init_tracing();
    let (config, _) = peer_configs();
    let (conn, _recorder) = connect(config);
    let core = conn.core();

    let first = core.next_packet_seq();
    assert_eq!(core.next_packet_seq(), first.wrapping_add(1));

    core.set_ko_count(3);
    assert_eq!(core.ko_count(), 3);

    let queue = core.requests();
    assert!(queue.is_empty());
    queue.push(b"one".to_vec());
    queue.push(b"two".to_vec());
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.pop_timeout(Duration::from_millis(10)).unwrap(), b"one");
    assert_eq!(queue.drain(), vec![b"two".to_vec()]);
    assert!(queue.pop_timeout(Duration::from_millis(10)).is_none());
}

#[test]
fn queue_wakes_waiting_consumer() {
    let queue = Arc::new(RequestQueue::new());
    let consumer = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || queue.pop_timeout(Duration::from_secs(5)))
    };
    std::thread::sleep(Duration::from_millis(50));
    queue.push(b"late".to_vec());
    assert_eq!(consumer.join().unwrap().unwrap(), b"late");
}

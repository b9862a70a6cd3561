//! Helpers shared by the integration tests.
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! # Info level (equivalent to -v)
//! TEST_LOG=1 cargo test --test handshake -- --nocapture
//!
//! # Debug level (equivalent to -vv)
//! TEST_LOG=2 cargo test --test handshake -- --nocapture
//!
//! # Trace level (equivalent to -vvv)
//! TEST_LOG=3 cargo test --test handshake -- --nocapture
//! ```

#![allow(dead_code)]

use cachelink::LinkConfig;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("cachelink={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Sockets
// ============================================================================

/// Asks the OS for a loopback port that is free right now.
pub fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// A connected loopback pair: (dialed side, accepted side).
pub fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

/// Link configurations for two loopback peers pointing at each other, with
/// timings short enough for tests.
pub fn peer_configs() -> (LinkConfig, LinkConfig) {
    let a = free_addr();
    let mut b = free_addr();
    while b == a {
        b = free_addr();
    }
    (fast(LinkConfig::new(a, b)), fast(LinkConfig::new(b, a)))
}

pub fn fast(mut config: LinkConfig) -> LinkConfig {
    config.connect_timeout = Duration::from_millis(500);
    config.accept_timeout = Duration::from_millis(200);
    config.liveness_delay = Duration::from_millis(50);
    config.ping_timeout = Duration::from_millis(250);
    config.ping_interval = Duration::from_millis(500);
    config.link_timeout = Duration::from_secs(1);
    config
}

// ============================================================================
// Waiting
// ============================================================================

/// Polls `condition` until it holds or `timeout` expires.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

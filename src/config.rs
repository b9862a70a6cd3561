//! Link configuration.
//!
//! Values are looked up with namespacing: `{name}.{key}` first, then `{key}`,
//! then a hard-coded default. This lets several links share one configuration
//! source while overriding individual keys.
//!
//! # Configuration Keys
//!
//! ```toml
//! local_ip = "10.0.0.1"
//! peer_ip = "10.0.0.2"
//! port = 7000
//!
//! [standby]
//! peer_ip = "10.0.0.3"
//! connect_timeout_ms = 2000
//! ```

use crate::error::Error;
use ::config::Config;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

const DEFAULT_PORT: u16 = 7000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 4_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 500;
const DEFAULT_PING_INTERVAL_MS: u64 = 5_000;
const DEFAULT_LINK_TIMEOUT_MS: u64 = 6_000;
const DEFAULT_LIVENESS_DELAY_MS: u64 = 500;
const DEFAULT_MAX_ROUNDS: u32 = 64;
const DEFAULT_KO_COUNT: u32 = 7;
const MIN_KO_COUNT: u32 = 7;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

fn get_namespaced_ms(config: &Config, name: &str, key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(get_namespaced_u64(config, name, key).unwrap_or(default_ms))
}

fn get_namespaced_port(config: &Config, name: &str, key: &str, default: u16) -> Result<u16, Error> {
    match get_namespaced_u64(config, name, key) {
        Ok(port) => u16::try_from(port).map_err(|_| Error::InvalidAddress(format!("port {port}"))),
        Err(_) => Ok(default),
    }
}

fn parse_ip(value: &str) -> Result<IpAddr, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidAddress(value.to_string()))
}

/// Addresses and timing for one peer link.
///
/// All durations are consumed by the handshake and by the socket options it
/// applies once both channels are up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Address the listener binds to. Outgoing connections use its IP with an
    /// ephemeral port.
    pub local_addr: SocketAddr,
    /// Address of the peer's listener.
    pub peer_addr: SocketAddr,
    /// Upper bound for one outgoing connection attempt.
    pub connect_timeout: Duration,
    /// Upper bound for one passive wait on the listener.
    pub accept_timeout: Duration,
    /// Data channel send/receive timeouts are four times this value.
    pub ping_timeout: Duration,
    /// Receive timeout of the meta channel.
    pub ping_interval: Duration,
    /// Send timeout of the meta channel.
    pub link_timeout: Duration,
    /// Pause between filling both channels and checking that they are alive.
    pub liveness_delay: Duration,
    /// Handshake rounds in one attempt before it gives up with `Retry`.
    pub max_rounds: u32,
    /// Floor for the keep-alive counter once the link is up. Values below 7
    /// are raised to 7, see [`ko_floor()`](Self::ko_floor).
    pub ko_count: u32,
}

impl LinkConfig {
    /// Creates a configuration with default timings.
    pub fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            accept_timeout: Duration::from_millis(DEFAULT_ACCEPT_TIMEOUT_MS),
            ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            link_timeout: Duration::from_millis(DEFAULT_LINK_TIMEOUT_MS),
            liveness_delay: Duration::from_millis(DEFAULT_LIVENESS_DELAY_MS),
            max_rounds: DEFAULT_MAX_ROUNDS,
            ko_count: DEFAULT_KO_COUNT,
        }
    }

    /// Reads a link configuration from the un-namespaced keys.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads a link configuration with namespacing.
    ///
    /// `local_ip` and `peer_ip` are required. `port` applies to both sides
    /// unless `local_port` or `peer_port` override it.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let local_ip = parse_ip(&get_namespaced_string(config, name, "local_ip")?)?;
        let peer_ip = parse_ip(&get_namespaced_string(config, name, "peer_ip")?)?;
        let port = get_namespaced_port(config, name, "port", DEFAULT_PORT)?;
        let local_port = get_namespaced_port(config, name, "local_port", port)?;
        let peer_port = get_namespaced_port(config, name, "peer_port", port)?;

        let link = Self {
            local_addr: SocketAddr::new(local_ip, local_port),
            peer_addr: SocketAddr::new(peer_ip, peer_port),
            connect_timeout: get_namespaced_ms(
                config,
                name,
                "connect_timeout_ms",
                DEFAULT_CONNECT_TIMEOUT_MS,
            ),
            accept_timeout: get_namespaced_ms(
                config,
                name,
                "accept_timeout_ms",
                DEFAULT_ACCEPT_TIMEOUT_MS,
            ),
            ping_timeout: get_namespaced_ms(config, name, "ping_timeout_ms", DEFAULT_PING_TIMEOUT_MS),
            ping_interval: get_namespaced_ms(
                config,
                name,
                "ping_interval_ms",
                DEFAULT_PING_INTERVAL_MS,
            ),
            link_timeout: get_namespaced_ms(config, name, "link_timeout_ms", DEFAULT_LINK_TIMEOUT_MS),
            liveness_delay: get_namespaced_ms(
                config,
                name,
                "liveness_delay_ms",
                DEFAULT_LIVENESS_DELAY_MS,
            ),
            max_rounds: get_namespaced_u64(config, name, "max_rounds")
                .map(|v| v.clamp(1, u64::from(u32::MAX)) as u32)
                .unwrap_or(DEFAULT_MAX_ROUNDS),
            ko_count: get_namespaced_u64(config, name, "ko_count")
                .map(|v| v.min(u64::from(u32::MAX)) as u32)
                .unwrap_or(DEFAULT_KO_COUNT),
        };
        link.validate()?;
        Ok(link)
    }

    /// Checks that local and peer addresses can talk to each other.
    pub fn validate(&self) -> Result<(), Error> {
        if self.local_addr.is_ipv4() != self.peer_addr.is_ipv4() {
            return Err(Error::AddressFamilyMismatch {
                local: self.local_addr,
                peer: self.peer_addr,
            });
        }
        Ok(())
    }

    /// The keep-alive counter never starts a live link below this.
    pub fn ko_floor(&self) -> u32 {
        self.ko_count.max(MIN_KO_COUNT)
    }

    /// Send and receive timeout of the data channel.
    pub fn data_timeout(&self) -> Duration {
        self.ping_timeout.saturating_mul(4)
    }
}

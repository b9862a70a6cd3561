//! Two cache peers in one process.
//!
//! Both peers listen and dial at the same time, settle on a data and a meta
//! channel, and then exchange one payload on each.
//!
//! ```bash
//! cargo run --example peer_link -- -vv
//! ```

use cachelink::prelude::*;
use clap::Parser;
use config::Config;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for cachelink crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return, // No tracing
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("cachelink={}", level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .pretty()
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Two peers establishing a cache link", long_about = None)]
struct Args {
    /// Listening address of the first peer
    #[arg(long, default_value = "127.0.0.1:7000")]
    peer_a: SocketAddr,

    /// Listening address of the second peer
    #[arg(long, default_value = "127.0.0.1:7001")]
    peer_b: SocketAddr,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format) with `[a]` and `[b]` sections
    #[arg(long)]
    config: Option<String>,
}

// ============================================================================
// Channel Handler
// ============================================================================

/// Prints whatever arrives on either channel.
struct Printer {
    name: &'static str,
}

impl Printer {
    fn serve(&self, core: &ConnectionCore, control: &ThreadControl, role: ChannelRole) {
        let channel = core.channel(role);
        let Ok(Some(mut reader)) = channel.reader() else {
            return;
        };
        while control.is_running() {
            match channel.recv(&mut reader) {
                Ok(Some(bytes)) => {
                    core.touch();
                    println!("[{}] {} channel: {}", self.name, role, String::from_utf8_lossy(&bytes));
                }
                Ok(None) => return,
                Err(err) if err.is_timeout() => continue,
                Err(err) => {
                    eprintln!("[{}] {} channel failed: {}", self.name, role, err);
                    return;
                }
            }
        }
    }
}

impl ChannelHandler for Printer {
    fn on_connected(&self, core: &ConnectionCore) {
        println!("[{}] connected to {}", self.name, core.config().peer_addr);
    }

    fn serve_data(&self, core: &ConnectionCore, control: &ThreadControl) {
        self.serve(core, control, ChannelRole::Data);
    }

    fn serve_meta(&self, core: &ConnectionCore, control: &ThreadControl) {
        self.serve(core, control, ChannelRole::Meta);
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn link_configs(args: &Args) -> Result<(LinkConfig, LinkConfig), Error> {
    match &args.config {
        Some(config_path) => {
            let config = Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()?;
            Ok((
                LinkConfig::from_config_named(&config, "a")?,
                LinkConfig::from_config_named(&config, "b")?,
            ))
        }
        None => Ok((
            LinkConfig::new(args.peer_a, args.peer_b),
            LinkConfig::new(args.peer_b, args.peer_a),
        )),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let (link_a, link_b) = match link_configs(&args) {
        Ok(links) => links,
        Err(err) => {
            eprintln!("Invalid configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let start = |link: LinkConfig, name: &'static str| {
        Connection::new(ConnectionParams::new(link, Arc::new(Printer { name })))
    };
    let (a, b) = match (start(link_a, "a"), start(link_b, "b")) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(err), _) | (_, Err(err)) => {
            eprintln!("Failed to create connection: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let timeout = Some(Duration::from_secs(30));
    if !a.wait_connected(timeout) || !b.wait_connected(timeout) {
        eprintln!("Peers did not connect");
        return ExitCode::FAILURE;
    }

    for round in 1..=3 {
        let data = format!("payload #{round} from a");
        let meta = format!("ack #{round} from b");
        if let Err(err) = a.core().data().send(data.as_bytes()) {
            eprintln!("Send on data channel failed: {}", err);
        }
        if let Err(err) = b.core().meta().send(meta.as_bytes()) {
            eprintln!("Send on meta channel failed: {}", err);
        }
        thread::sleep(Duration::from_millis(500));
    }

    a.shutdown();
    b.shutdown();
    ExitCode::SUCCESS
}

//! Relay node
//!
//! Small demo node for the relay driver over TCP:
//! - `relay-node host <seed> <bind-addr>` listens and echoes every message
//! - `relay-node join <seed> <target-seed> <target-addr>` connects and sends
//!   a greeting once per second
//!
//! Options: `--verbose` for debug logging, `--config <path>` for a JSON
//! driver config.

use anyhow::{Context, Result, anyhow, bail};
use relay_core::{ChannelKind, DriverConfig, NetworkEvent, PeerIdentity};
use relay_driver::{ConnectorState, RelayDriver, Role};
use relay_transport::{TcpRelayConfig, TcpRelayTransport};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

const TICK: Duration = Duration::from_micros(16_667);
const GREETING_INTERVAL: Duration = Duration::from_secs(1);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

const USAGE: &str = "usage: relay-node [--verbose] [--config <path>] host <seed> <bind-addr>\n       relay-node [--verbose] [--config <path>] join <seed> <target-seed> <target-addr>";

#[derive(Debug, PartialEq)]
enum Mode {
    Host { bind: SocketAddr },
    Join { target: PeerIdentity, addr: SocketAddr },
}

#[derive(Debug, PartialEq)]
struct Args {
    seed: String,
    mode: Mode,
    config: Option<PathBuf>,
    verbose: bool,
}

fn parse_args(raw: &[String]) -> Result<Args> {
    let mut positional = Vec::new();
    let mut config = None;
    let mut verbose = false;

    let mut iter = raw.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--verbose" | "-v" => verbose = true,
            "--config" => {
                let path = iter.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                config = Some(PathBuf::from(path));
            }
            _ => positional.push(arg.as_str()),
        }
    }

    let mode = match positional.as_slice() {
        ["host", _, bind] => Mode::Host {
            bind: bind
                .parse()
                .with_context(|| format!("Invalid bind address: {}", bind))?,
        },
        ["join", _, target, addr] => Mode::Join {
            target: PeerIdentity::derive(target),
            addr: addr
                .parse()
                .with_context(|| format!("Invalid target address: {}", addr))?,
        },
        _ => bail!("{}", USAGE),
    };

    Ok(Args {
        seed: positional[1].to_string(),
        mode,
        config,
        verbose,
    })
}

/// Log one event; hosts echo messages back. Returns false once the node should stop.
fn handle_event(driver: &mut RelayDriver<TcpRelayTransport>, event: NetworkEvent) -> bool {
    match event {
        NetworkEvent::Connected { connection } => {
            info!("{} connected", connection);
        }
        NetworkEvent::Disconnected { connection } => {
            info!("{} disconnected", connection);
            if driver.role() == Role::Active {
                warn!("Lost connection to server");
                return false;
            }
        }
        NetworkEvent::Message {
            connection,
            payload,
        } => {
            info!(
                "{} sent {} bytes: {}",
                connection,
                payload.len(),
                String::from_utf8_lossy(&payload)
            );
            if driver.role() == Role::Hosting {
                driver.send_to(ChannelKind::Reliable, &payload, connection);
            }
        }
    }
    true
}

async fn run(driver: &mut RelayDriver<TcpRelayTransport>) {
    let mut tick = tokio::time::interval(TICK);
    let mut greet = tokio::time::interval(GREETING_INTERVAL);
    let mut stats = tokio::time::interval(STATS_INTERVAL);
    let mut greetings: u64 = 0;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, disconnecting");
                return;
            }
            _ = tick.tick() => {
                driver.pump();
                while let Some(event) = driver.pop_event() {
                    if !handle_event(driver, event) {
                        return;
                    }
                }
            }
            _ = greet.tick(), if driver.connector_state() == Some(ConnectorState::Connected) => {
                greetings += 1;
                let greeting = format!("hello #{} from {}", greetings, driver.local_identity());
                driver.send(ChannelKind::Reliable, greeting.as_bytes());
            }
            _ = stats.tick() => {
                let current = driver.get_stats();
                info!(
                    "sent {} bytes, received {} bytes, rtt {} ms",
                    current.total_data_sent, current.total_data_received, current.rtt_ms
                );
            }
        }
    }
}

fn main() -> Result<()> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&raw)?;

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let identity = PeerIdentity::derive(&args.seed);
    let mut config = match &args.config {
        Some(path) => DriverConfig::from_json_file(path)?,
        None => DriverConfig::default(),
    };
    config.local_identity = identity;

    let mut relay = TcpRelayConfig::default();
    match &args.mode {
        Mode::Host { bind } => relay.bind_addr = *bind,
        Mode::Join { target, addr } => {
            relay = relay.with_peer(*target, *addr);
            config.target_identity = Some(*target);
        }
    }

    info!("Relay node {} starting", identity);
    let transport = TcpRelayTransport::new(identity, relay)?;
    let handle = transport.handle();
    let mut driver = RelayDriver::new(transport);

    if !driver.initialize(config) {
        bail!("Failed to initialize {}", driver.driver_name());
    }
    let started = match args.mode {
        Mode::Host { .. } => driver.listen(),
        Mode::Join { .. } => driver.connect(),
    };
    if !started {
        bail!("Failed to start {:?}", args.mode);
    }

    handle.block_on(run(&mut driver));
    driver.disconnect();
    info!("Relay node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_host() {
        let parsed = parse_args(&args(&["host", "alice", "127.0.0.1:27020"])).unwrap();
        assert_eq!(parsed.seed, "alice");
        assert_eq!(
            parsed.mode,
            Mode::Host {
                bind: "127.0.0.1:27020".parse().unwrap()
            }
        );
        assert!(!parsed.verbose);
        assert_eq!(parsed.config, None);
    }

    #[test]
    fn test_parse_join_with_options() {
        let parsed = parse_args(&args(&[
            "--verbose",
            "join",
            "bob",
            "alice",
            "10.0.0.2:27020",
            "--config",
            "node.json",
        ]))
        .unwrap();

        assert!(parsed.verbose);
        assert_eq!(parsed.config, Some(PathBuf::from("node.json")));
        assert_eq!(
            parsed.mode,
            Mode::Join {
                target: PeerIdentity::derive("alice"),
                addr: "10.0.0.2:27020".parse().unwrap()
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["host", "alice"])).is_err());
        assert!(parse_args(&args(&["host", "alice", "not-an-addr"])).is_err());
        assert!(parse_args(&args(&["serve", "alice", "127.0.0.1:1"])).is_err());
        assert!(parse_args(&args(&["host", "alice", "127.0.0.1:1", "--config"])).is_err());
    }
}

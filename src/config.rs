use std::fs::read_to_string;
use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// A single exit redirect or SOCKS/exit-policy rule, as it appears in the
/// config file. `policy.rs` compiles these into the ordered,
/// first-match-wins checks the `edge` crate's `SocksPolicy`/`ExitPolicy`/
/// redirect table traits expect.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyRule {
    /// `"accept"` or `"reject"`; ignored for redirect-table entries, which
    /// are always matched (only `redirect` decides whether they rewrite).
    #[serde(default)]
    pub action: PolicyAction,
    /// CIDR network, e.g. `"10.0.0.0/8"`.
    pub network: String,
    #[serde(default = "PolicyRule::port_min")]
    pub port_min: u16,
    #[serde(default = "PolicyRule::port_max")]
    pub port_max: u16,
    /// Present only on redirect-table entries with `redirect = true`.
    #[serde(default)]
    pub redirect_to: Option<(Ipv4Addr, u16)>,
}

impl PolicyRule {
    fn port_min() -> u16 {
        1
    }

    fn port_max() -> u16 {
        65535
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Accept,
    #[default]
    Reject,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Edge {
    /// SOCKS listen interfaces (entry-edge AP port). One process may bind
    /// several.
    #[serde(default)]
    pub listen: Vec<SocketAddr>,
    /// Address-policy rules filtering who may use the SOCKS port. Ports are
    /// ignored for this list and forced to 1-65535 at evaluation time.
    #[serde(default)]
    pub socks_policy: Vec<PolicyRule>,
    /// Seconds a circuit's `timestamp_dirty` is artificially aged by on a
    /// 15s stream timeout retry, so new streams prefer a fresher circuit.
    #[serde(default = "Edge::new_circuit_period")]
    pub new_circuit_period: u64,
    /// Local exit policy: may this exit relay a connection to
    /// `(addr, port)`? Evaluated only for general (non-rendezvous) streams.
    #[serde(default)]
    pub exit_policy: Vec<PolicyRule>,
    /// Exit redirect table, matched in declaration order, first match wins.
    #[serde(default)]
    pub redirect_table: Vec<PolicyRule>,
    /// Refuse new exit connections while bandwidth-hibernating. This crate
    /// only consumes the flag; deciding when to hibernate is someone else's
    /// job.
    #[serde(default)]
    pub hibernating: bool,
}

impl Edge {
    fn new_circuit_period() -> u64 {
        30 * 60
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub edge: Edge,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    /// Specify the configuration file path
    ///
    /// Example: tor-edge-relay --config /etc/tor-edge-relay/config.toml
    #[arg(long, short)]
    config: String,
}

impl Config {
    /// Load configure from config file and command line parameters.
    pub fn load() -> Result<Self> {
        let path = Cli::parse().config;
        let body = read_to_string(&path).with_context(|| format!("reading config file {path}"))?;
        Ok(toml::from_str::<Self>(&body)?)
    }
}

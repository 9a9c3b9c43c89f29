use anyhow::{Context, Result};
use std::io::prelude::*;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde_derive::Deserialize;

pub const BGP_DEFAULT_PORT: u16 = 179;
pub const BGP_DEFAULT_IDLE_HOLD: u16 = 4;
pub const BGP_DEFAULT_CONNECT_RETRY: u16 = 120;
pub const BGP_DEFAULT_OPEN_HOLD: u16 = 240;
/// Hold Time this speaker advertises in its own OPEN message. Not a
/// per-peer config knob in this trimmed model — only the three timer
/// intervals spec.md names are configurable.
pub const BGP_DEFAULT_HOLD_TIME: u16 = 180;

/// Mode a configured peer is allowed to establish a TCP connection in.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AllowedMode {
    ConnectOnly,
    AcceptOnly,
    #[default]
    Both,
}

/// Top-level speaker configuration: local identity plus the peers it runs
/// an FSM for.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Autonomous System Number (ASN) of the router.
    pub asn: u16,
    /// Router ID (RID) of the router.
    pub rid: Ipv4Addr,
    /// Local IP address the speaker listens/connects from.
    #[serde(default)]
    pub localips: Option<Vec<IpAddr>>,
    /// Port number for BGP connections.
    #[serde(default = "default_port")]
    pub port: u16,
    /// List of peers this speaker runs a Session for.
    #[serde(default)]
    pub neighbors: Vec<Neighbor>,
}

fn default_port() -> u16 {
    BGP_DEFAULT_PORT
}

pub fn read_config(path: &PathBuf) -> Result<Config> {
    let mut f = std::fs::File::open(path)
        .with_context(|| format!("Failed to open config file {}", path.display()))?;

    let mut c = String::new();
    f.read_to_string(&mut c)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config: Config = toml::from_str(&c)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;

    Ok(config)
}

fn default_idle_hold() -> u16 {
    BGP_DEFAULT_IDLE_HOLD
}

fn default_connect_retry() -> u16 {
    BGP_DEFAULT_CONNECT_RETRY
}

fn default_open_hold() -> u16 {
    BGP_DEFAULT_OPEN_HOLD
}

/// Configuration for a single BGP peer — exactly the fields the Session
/// data model needs: identity, the allowed connection mode, and the three
/// configured timer intervals spec.md names (IdleHold, ConnectRetry,
/// OpenHold). The negotiated Hold/Keepalive intervals are not configured
/// here; they come out of the OPEN exchange.
#[derive(Deserialize, Debug, Clone)]
pub struct Neighbor {
    /// Autonomous System Number (ASN) of the neighbor.
    pub asn: u16,
    /// IP address of the neighbor.
    pub ip: IpAddr,
    /// Port number for BGP connections to the neighbor.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Which direction(s) this peer is allowed to establish a connection in.
    #[serde(default)]
    pub allowed_mode: AllowedMode,
    /// IdleHoldTimer seed, in seconds, before backoff.
    #[serde(default = "default_idle_hold")]
    pub idle_hold: u16,
    /// ConnectRetryTimer interval, in seconds.
    #[serde(default = "default_connect_retry")]
    pub connect_retry: u16,
    /// OpenHoldTimer interval, in seconds.
    #[serde(default = "default_open_hold")]
    pub open_hold: u16,
}

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use migrant_networking::{Protocol, RedirectConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Port every node agent listens on.
    pub agent_port: u16,
    pub redirect: RedirectConfig,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("MIGRANT_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("invalid MIGRANT_LISTEN_ADDR")?;

        let agent_port = std::env::var("MIGRANT_AGENT_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("invalid MIGRANT_AGENT_PORT")?;

        let public_addr: IpAddr = std::env::var("MIGRANT_PUBLIC_ADDR")
            .context("MIGRANT_PUBLIC_ADDR must be set")?
            .parse()
            .context("invalid MIGRANT_PUBLIC_ADDR")?;

        let mut redirect = RedirectConfig::new(public_addr);

        if let Ok(port) = std::env::var("MIGRANT_WORKLOAD_PORT") {
            redirect.port = port.parse().context("invalid MIGRANT_WORKLOAD_PORT")?;
        }
        if let Ok(protocol) = std::env::var("MIGRANT_WORKLOAD_PROTOCOL") {
            redirect.protocol = protocol.parse::<Protocol>()?;
        }
        if let Ok(bin) = std::env::var("MIGRANT_IPTABLES_BIN") {
            redirect.iptables_bin = bin;
        }
        if let Ok(bin) = std::env::var("MIGRANT_CONNTRACK_BIN") {
            redirect.conntrack_bin = bin;
        }

        let log_level = std::env::var("MIGRANT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            agent_port,
            redirect,
            log_level,
        })
    }
}

//! Traffic redirection for the workload's public endpoint.
//!
//! Clients always talk to one fixed public address and port. The
//! orchestrator host rewrites that traffic with NAT rules so it reaches
//! whichever host currently serves the workload:
//!
//! - `PREROUTING` / `OUTPUT` DNAT: public address → serving host
//! - `POSTROUTING` SNAT: replies appear to come from the public address
//!
//! Every redirect replaces the whole NAT table (flush, then append) rather
//! than diffing, and then flushes connection tracking so existing UDP flows
//! are re-evaluated against the new rules.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use migrant_command::{CommandError, CommandRunner, Invocation};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Appending a NAT rule failed; traffic is not flowing to the target.
    #[error("redirect to {host} failed: {source}")]
    RedirectFailed {
        host: String,
        #[source]
        source: CommandError,
    },

    /// Unsupported transport protocol name.
    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    /// Empty or malformed host identifier.
    #[error("invalid host: {0:?}")]
    InvalidHost(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Transport protocol of the workload endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(NetworkError::InvalidProtocol(other.to_string())),
        }
    }
}

/// Redirector configuration.
#[derive(Debug, Clone)]
pub struct RedirectConfig {
    /// Stable public address clients connect to.
    pub public_addr: IpAddr,

    /// Workload port, identical on the public address and on every host.
    pub port: u16,

    /// Workload transport protocol.
    pub protocol: Protocol,

    /// Packet filter binary.
    pub iptables_bin: String,

    /// Connection tracking binary.
    pub conntrack_bin: String,
}

impl RedirectConfig {
    /// Create a configuration with the default port (27960/udp) and binaries.
    pub fn new(public_addr: IpAddr) -> Self {
        Self {
            public_addr,
            port: 27960,
            protocol: Protocol::Udp,
            iptables_bin: "iptables".to_string(),
            conntrack_bin: "conntrack".to_string(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }
}

// ============================================================================
// NAT rules
// ============================================================================

/// One rule appended to the `nat` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    /// Chain the rule is appended to.
    pub chain: &'static str,
    /// Match and target arguments after the chain name.
    pub spec: Vec<String>,
}

impl NatRule {
    fn new(chain: &'static str, spec: &[&str]) -> Self {
        Self {
            chain,
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn to_invocation(&self, iptables_bin: &str) -> Invocation {
        Invocation::new(iptables_bin)
            .args(["-t", "nat", "-A", self.chain])
            .args(self.spec.iter().cloned())
    }
}

/// Build the rule set that points the public endpoint at `host`.
///
/// Order matters only for readability of `iptables -t nat -L`; the three
/// rules live in different chains.
pub fn nat_rules(config: &RedirectConfig, host: &str) -> Vec<NatRule> {
    let public = config.public_addr.to_string();
    let port = config.port.to_string();
    let proto = config.protocol.as_str();
    let target = format!("{host}:{port}");

    vec![
        NatRule::new(
            "OUTPUT",
            &[
                "--dst",
                &public,
                "-p",
                proto,
                "--dport",
                &port,
                "-j",
                "DNAT",
                "--to-destination",
                &target,
            ],
        ),
        NatRule::new(
            "POSTROUTING",
            &[
                "-p",
                proto,
                "--dst",
                host,
                "--dport",
                &port,
                "-j",
                "SNAT",
                "--to-source",
                &public,
            ],
        ),
        NatRule::new(
            "PREROUTING",
            &[
                "-p",
                proto,
                "-d",
                &public,
                "--dport",
                &port,
                "-j",
                "DNAT",
                "--to-destination",
                &target,
            ],
        ),
    ]
}

// ============================================================================
// Redirector
// ============================================================================

/// Points the workload's public endpoint at a host.
#[async_trait]
pub trait TrafficRedirector: Send + Sync {
    /// Replace all redirection rules with a fresh set targeting `host`.
    async fn redirect_to(&self, host: &str) -> Result<(), NetworkError>;

    /// Remove every NAT rule. Best-effort: failures are logged.
    async fn flush(&self);
}

/// [`TrafficRedirector`] backed by `iptables` and `conntrack`.
pub struct IptablesRedirector {
    config: RedirectConfig,
    runner: Arc<dyn CommandRunner>,
}

impl IptablesRedirector {
    pub fn new(config: RedirectConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    async fn flush_conntrack(&self) {
        let invocation = Invocation::new(&self.config.conntrack_bin).args([
            "-D",
            "-p",
            self.config.protocol.as_str(),
        ]);

        // conntrack exits non-zero when no entries matched.
        if let Err(e) = self.runner.run(&invocation).await {
            debug!(error = %e, "Connection tracking flush reported failure");
        }
    }
}

#[async_trait]
impl TrafficRedirector for IptablesRedirector {
    async fn redirect_to(&self, host: &str) -> Result<(), NetworkError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(NetworkError::InvalidHost(host.to_string()));
        }

        info!(
            host = %host,
            public_addr = %self.config.public_addr,
            port = self.config.port,
            protocol = %self.config.protocol,
            "Redirecting workload traffic"
        );

        self.flush().await;

        for rule in nat_rules(&self.config, host) {
            let invocation = rule.to_invocation(&self.config.iptables_bin);
            self.runner
                .run(&invocation)
                .await
                .map_err(|source| NetworkError::RedirectFailed {
                    host: host.to_string(),
                    source,
                })?;
        }

        self.flush_conntrack().await;

        info!(host = %host, "Workload traffic redirected");
        Ok(())
    }

    async fn flush(&self) {
        let invocation = Invocation::new(&self.config.iptables_bin).args(["-t", "nat", "-F"]);
        if let Err(e) = self.runner.run(&invocation).await {
            warn!(error = %e, "Failed to flush NAT table");
        }
    }
}

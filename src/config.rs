//! Configuration model.
//!
//! The configuration file is an HCL document; every option carries the
//! default it had in the shipped deployment, so an empty file is a valid
//! configuration. Subsystems receive an immutable `Arc<Config>` snapshot at
//! construction; the supervisor builds a fresh snapshot on reload.

use crate::messages::Service;
use crate::prelude::*;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Slack added to the advertisement TTL so an entry survives until the next
/// tick refreshes it.
const ADVERTISEMENT_TTL_SLACK: Duration = Duration::from_millis(333);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read configuration file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse HCL configuration: {0}")]
    Invalid(#[from] hcl::Error),

    #[error("invalid bind address {addr:?} for {key}: {reason}")]
    InvalidBind {
        key: &'static str,
        addr: String,
        reason: &'static str,
    },
}

/// Which subcommand this process runs as.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    Agent,
    Server,
    Cluster,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::Server => "server",
            Role::Cluster => "cluster",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub suffix: String,
    pub lxd: LxdConfig,
    pub tls: TlsConfig,
    pub dns: DnsConfig,
    pub log: LogConfig,
    pub server: ServerConfig,
    pub agent: AgentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            suffix: "lexa".to_string(),
            lxd: LxdConfig::default(),
            tls: TlsConfig::default(),
            dns: DnsConfig::default(),
            log: LogConfig::default(),
            server: ServerConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LxdConfig {
    /// Container-manager control socket. Empty disables the local pull.
    pub socket: String,
}

impl Default for LxdConfig {
    fn default() -> Self {
        Self {
            socket: "/var/snap/lxd/common/lxd/unix.socket".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub bind: String,
    pub port: u16,
    pub certificate: Option<String>,
    pub key: Option<String>,
    pub so_reuse_port: bool,
    pub mtls: MtlsConfig,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 18433,
            certificate: None,
            key: None,
            so_reuse_port: false,
            mtls: MtlsConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MtlsConfig {
    pub ca_certificate: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub bind: String,
    pub port: u16,
    pub tls: DotConfig,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 18053,
            tls: DotConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DotConfig {
    pub bind: String,
    pub port: u16,
    pub certificate: Option<String>,
    pub key: Option<String>,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 18853,
            certificate: None,
            key: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub path: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "trace".to_string(),
            path: "stdout".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub p2p: P2pConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub p2p: P2pConfig,
    /// Services advertised by this node on every tick.
    pub service: Vec<Service>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub bind: String,
    pub port: u16,

    #[serde(rename = "bootstrapPeers")]
    pub bootstrap_peers: Vec<String>,

    /// Advertisement tick period in seconds; minimum 1.
    #[serde(rename = "peerScanInterval")]
    pub peer_scan_interval: u64,

    pub hostname: Option<String>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 45861,
            bootstrap_peers: Vec::new(),
            peer_scan_interval: 5,
            hostname: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        Ok(hcl::from_str(&raw)?)
    }

    pub fn p2p(&self, role: Role) -> &P2pConfig {
        match role {
            Role::Server => &self.server.p2p,
            _ => &self.agent.p2p,
        }
    }

    /// Zone apex with trailing dot, e.g. `lexa.`.
    pub fn zone(&self) -> String {
        format!("{}.", self.suffix)
    }

    pub fn dns_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr("dns.bind", &self.dns.bind, self.dns.port)
    }

    pub fn dot_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr("dns.tls.bind", &self.dns.tls.bind, self.dns.tls.port)
    }

    pub fn https_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr("tls.bind", &self.tls.bind, self.tls.port)
    }
}

impl P2pConfig {
    /// The overlay bind address. Unlike the resolver and API binds this must
    /// be a concrete, routable IPv4 address: no wildcard, loopback or
    /// multicast.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let invalid = |reason| ConfigError::InvalidBind {
            key: "p2p.bind",
            addr: self.bind.clone(),
            reason,
        };

        let ip: IpAddr = self.bind.parse().map_err(|_| invalid("not an IP address"))?;
        let IpAddr::V4(v4) = ip else {
            return Err(invalid("must be an IPv4 address"));
        };
        if v4.is_unspecified() {
            return Err(invalid("wildcard address"));
        }
        if v4.is_loopback() {
            return Err(invalid("loopback address"));
        }
        if v4.is_multicast() {
            return Err(invalid("multicast address"));
        }
        Ok(SocketAddr::from((v4, self.port)))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.peer_scan_interval.max(1))
    }

    /// TTL for cache entries created from an advertisement.
    pub fn advertisement_ttl(&self) -> Duration {
        self.scan_interval() + ADVERTISEMENT_TTL_SLACK
    }

    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|name| !name.is_empty()))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

fn socket_addr(key: &'static str, bind: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let ip: IpAddr = bind.parse().map_err(|_| ConfigError::InvalidBind {
        key,
        addr: bind.to_string(),
        reason: "not an IP address",
    })?;
    Ok(SocketAddr::from((ip, port)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::prelude::{assert_eq, *};
    use std::io::Write;

    const SAMPLE: &str = r#"
suffix = "internal"

dns {
  port = 19053

  tls {
    port = 19853
    bind = "127.0.0.1"
  }
}

tls {
  port = 19433
  so_reuse_port = true
}

server {
  p2p {
    bind = "192.0.2.10"
    bootstrapPeers = ["192.0.2.11:45861", "192.0.2.12:45861"]
    peerScanInterval = 10
    hostname = "ds1"
  }
}

agent {
  service = [
    { name = "http", port = 8080, proto = "tcp", tags = ["primary"], interface = "" }
  ]
}

log {
  level = "info"
}
"#;

    #[test]
    fn defaults_from_empty_document() {
        let config: Config = hcl::from_str("").unwrap();
        assert_eq!(config.suffix, "lexa");
        assert_eq!(config.zone(), "lexa.");
        assert_eq!(config.lxd.socket, "/var/snap/lxd/common/lxd/unix.socket");
        assert_eq!(config.tls.port, 18433);
        assert_eq!(config.dns.port, 18053);
        assert_eq!(config.dns.tls.port, 18853);
        assert_eq!(config.server.p2p.port, 45861);
        assert_eq!(config.server.p2p.peer_scan_interval, 5);
        assert_eq!(config.log.level, "trace");
        assert_eq!(config.log.path, "stdout");
        assert!(!config.tls.so_reuse_port);
    }

    #[test]
    fn sample_document_overrides() {
        let config: Config = hcl::from_str(SAMPLE).unwrap();
        assert_eq!(config.suffix, "internal");
        assert_eq!(config.dns.port, 19053);
        assert_eq!(config.dns.tls.port, 19853);
        assert_eq!(config.dns.tls.bind, "127.0.0.1");
        assert_eq!(config.tls.port, 19433);
        assert!(config.tls.so_reuse_port);
        assert_eq!(config.server.p2p.bind, "192.0.2.10");
        assert_eq!(config.server.p2p.bootstrap_peers.len(), 2);
        assert_eq!(config.server.p2p.peer_scan_interval, 10);
        assert_eq!(config.server.p2p.hostname.as_deref(), Some("ds1"));
        assert_eq!(config.agent.service.len(), 1);
        assert_eq!(config.agent.service[0].name, "http");
        assert_eq!(config.agent.service[0].port, 8080);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.suffix, "internal");
    }

    #[test]
    fn load_missing_file_errors() {
        let err = Config::load(Path::new("/nonexistent/lexa.hcl")).unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }

    #[test]
    fn p2p_bind_must_be_concrete_ipv4() {
        let reject = ["0.0.0.0", "127.0.0.1", "224.0.0.1", "::1", "2001:db8::1", "bogus"];
        for addr in reject {
            let p2p = P2pConfig {
                bind: addr.to_string(),
                ..P2pConfig::default()
            };
            assert!(p2p.bind_addr().is_err(), "accepted {addr}");
        }

        let p2p = P2pConfig {
            bind: "192.0.2.10".to_string(),
            ..P2pConfig::default()
        };
        assert_eq!(p2p.bind_addr().unwrap(), "192.0.2.10:45861".parse().unwrap());
    }

    #[test]
    fn scan_interval_clamps_to_one_second() {
        let p2p = P2pConfig {
            peer_scan_interval: 0,
            ..P2pConfig::default()
        };
        assert_eq!(p2p.scan_interval(), Duration::from_secs(1));
        assert_eq!(
            p2p.advertisement_ttl(),
            Duration::from_secs(1) + Duration::from_millis(333)
        );
    }
}

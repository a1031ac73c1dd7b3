//! SSU daemon configuration file parser
//!
//! Parses INI-style files with one [Transport] section and any number of
//! [Peer] sections.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::ConfigError;
use crate::protocol::context::{SessionSettings, CONNECT_TIMEOUT, TERMINATION_TIMEOUT};
use crate::registry::{RegistrySettings, KEEP_ALIVE_INTERVAL};
use crate::router::{Introducer, RouterAddress, RouterInfo};

/// Complete daemon configuration
#[derive(Debug, Clone)]
pub struct SsuConfig {
    /// Local transport configuration
    pub transport: TransportConfig,
    /// Routers to connect to at startup
    pub peers: Vec<PeerConfig>,
}

/// Local transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Ed25519 identity seed (32 bytes)
    pub private_key: [u8; 32],
    /// Published intro key (32 bytes)
    pub intro_key: [u8; 32],
    /// Published host, also the bind address when set
    pub host: Option<IpAddr>,
    pub listen_port: u16,
    /// Hand out relay tags to peers that connect to us
    pub introducer: bool,
    /// We are behind NAT and publish introducers
    pub unreachable: bool,
    /// Take part in peer tests
    pub peer_testing: bool,
    /// Abort the handshake on a bad SessionCreated signature
    pub strict_signatures: bool,
    pub connect_timeout: Duration,
    pub termination_timeout: Duration,
    pub keep_alive_interval: Duration,
}

/// A router to connect to
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer's Ed25519 identity (32 bytes)
    pub public_key: [u8; 32],
    /// Peer's published endpoint (IP:port)
    pub endpoint: Option<SocketAddr>,
    /// Peer's published intro key
    pub intro_key: Option<[u8; 32]>,
    /// Run a peer test once connected
    pub peer_test: bool,
    /// Introducers the peer publishes
    pub introducers: Vec<Introducer>,
}

impl SsuConfig {
    /// Parse a configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut transport: Option<TransportBuilder> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();
        let mut current_section: Option<Section> = None;
        let mut current_peer: Option<PeerBuilder> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.eq_ignore_ascii_case("[transport]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Transport);
                transport.get_or_insert_with(TransportBuilder::default);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Peer);
                current_peer = Some(PeerBuilder::default());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Transport) => {
                    let t = transport.get_or_insert_with(TransportBuilder::default);
                    match key.as_str() {
                        "privatekey" => t.private_key = Some(parse_key(value, "PrivateKey")?),
                        "introkey" => t.intro_key = Some(parse_key(value, "IntroKey")?),
                        "host" => {
                            t.host = Some(value.parse().map_err(|_| ConfigError::InvalidAddress {
                                value: value.to_string(),
                            })?);
                        }
                        "listenport" => {
                            t.listen_port = Some(value.parse().map_err(|_| {
                                ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid ListenPort: {}", value),
                                }
                            })?);
                        }
                        "introducer" => t.introducer = parse_bool(value, line_num)?,
                        "unreachable" => t.unreachable = parse_bool(value, line_num)?,
                        "peertesting" => t.peer_testing = parse_bool(value, line_num)?,
                        "strictsignatures" => t.strict_signatures = parse_bool(value, line_num)?,
                        "connecttimeout" => {
                            t.connect_timeout = Some(parse_secs(value, "ConnectTimeout", line_num)?)
                        }
                        "terminationtimeout" => {
                            t.termination_timeout =
                                Some(parse_secs(value, "TerminationTimeout", line_num)?)
                        }
                        "keepaliveinterval" => {
                            t.keep_alive_interval =
                                Some(parse_secs(value, "KeepAliveInterval", line_num)?)
                        }
                        _ => {
                            tracing::debug!("Unknown transport key: {}", key);
                        }
                    }
                }
                Some(Section::Peer) => {
                    let peer = current_peer.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "Peer value outside of [Peer] section".to_string(),
                    })?;

                    match key.as_str() {
                        "publickey" => peer.public_key = Some(parse_key(value, "PublicKey")?),
                        "endpoint" => peer.endpoint = Some(parse_endpoint(value)?),
                        "introkey" => peer.intro_key = Some(parse_key(value, "IntroKey")?),
                        "peertest" => peer.peer_test = parse_bool(value, line_num)?,
                        "introducer" => peer.introducers.push(parse_introducer(value, line_num)?),
                        _ => {
                            tracing::debug!("Unknown peer key: {}", key);
                        }
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        if let Some(peer) = current_peer.take() {
            peers.push(peer.build()?);
        }

        let transport = transport
            .ok_or(ConfigError::MissingField {
                field: "[Transport] section".to_string(),
            })?
            .build()?;

        Ok(SsuConfig { transport, peers })
    }
}

impl TransportConfig {
    /// Socket address to bind
    pub fn listen_addr(&self) -> SocketAddr {
        let ip = self.host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.listen_port)
    }

    /// Address record other routers use to reach us.
    ///
    /// Falls back to `bound` when no host is configured.
    pub fn published_address(&self, bound: SocketAddr) -> RouterAddress {
        let host = self.host.unwrap_or(bound.ip());
        RouterAddress::new(SocketAddr::new(host, bound.port()), self.intro_key)
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            session: SessionSettings {
                connect_timeout: self.connect_timeout,
                termination_timeout: self.termination_timeout,
                strict_signatures: self.strict_signatures,
            },
            keep_alive_interval: self.keep_alive_interval,
            ..RegistrySettings::default()
        }
    }
}

impl PeerConfig {
    /// Router record to hand to the transport
    pub fn router_info(&self) -> Result<RouterInfo, ConfigError> {
        let endpoint = self.endpoint.ok_or(ConfigError::MissingField {
            field: "Endpoint in [Peer]".to_string(),
        })?;
        let intro_key = self.intro_key.ok_or(ConfigError::MissingField {
            field: "IntroKey in [Peer]".to_string(),
        })?;

        let mut address = RouterAddress::new(endpoint, intro_key);
        address.introducers = self.introducers.clone();
        Ok(RouterInfo::new(self.public_key.to_vec(), Some(address)).with_peer_testing(self.peer_test))
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Transport,
    Peer,
}

/// Builder for TransportConfig during parsing
#[derive(Default)]
struct TransportBuilder {
    private_key: Option<[u8; 32]>,
    intro_key: Option<[u8; 32]>,
    host: Option<IpAddr>,
    listen_port: Option<u16>,
    introducer: bool,
    unreachable: bool,
    peer_testing: bool,
    strict_signatures: bool,
    connect_timeout: Option<Duration>,
    termination_timeout: Option<Duration>,
    keep_alive_interval: Option<Duration>,
}

impl TransportBuilder {
    fn build(self) -> Result<TransportConfig, ConfigError> {
        let private_key = self.private_key.ok_or(ConfigError::MissingField {
            field: "PrivateKey".to_string(),
        })?;
        let intro_key = self.intro_key.ok_or(ConfigError::MissingField {
            field: "IntroKey".to_string(),
        })?;
        let listen_port = self.listen_port.ok_or(ConfigError::MissingField {
            field: "ListenPort".to_string(),
        })?;

        Ok(TransportConfig {
            private_key,
            intro_key,
            host: self.host,
            listen_port,
            introducer: self.introducer,
            unreachable: self.unreachable,
            peer_testing: self.peer_testing,
            strict_signatures: self.strict_signatures,
            connect_timeout: self.connect_timeout.unwrap_or(CONNECT_TIMEOUT),
            termination_timeout: self.termination_timeout.unwrap_or(TERMINATION_TIMEOUT),
            keep_alive_interval: self.keep_alive_interval.unwrap_or(KEEP_ALIVE_INTERVAL),
        })
    }
}

/// Builder for PeerConfig during parsing
#[derive(Default)]
struct PeerBuilder {
    public_key: Option<[u8; 32]>,
    endpoint: Option<SocketAddr>,
    intro_key: Option<[u8; 32]>,
    peer_test: bool,
    introducers: Vec<Introducer>,
}

impl PeerBuilder {
    fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;

        Ok(PeerConfig {
            public_key,
            endpoint: self.endpoint,
            intro_key: self.intro_key,
            peer_test: self.peer_test,
            introducers: self.introducers,
        })
    }
}

/// Parse a base64-encoded 32-byte key
fn parse_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|_| ConfigError::InvalidKey {
            field: field_name.to_string(),
        })?;

    if bytes.len() != 32 {
        return Err(ConfigError::InvalidKey {
            field: field_name.to_string(),
        });
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Parse an endpoint (IP:port)
fn parse_endpoint(value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse::<SocketAddr>().map_err(|_| ConfigError::InvalidAddress {
        value: value.to_string(),
    })
}

fn parse_bool(value: &str, line: usize) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::ParseError {
            line,
            message: format!("Expected true or false, got: {}", value),
        }),
    }
}

fn parse_secs(value: &str, field_name: &str, line: usize) -> Result<Duration, ConfigError> {
    let secs: u64 = value.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid {}: {}", field_name, value),
    })?;
    if secs == 0 {
        return Err(ConfigError::ParseError {
            line,
            message: format!("{} must be positive", field_name),
        });
    }
    Ok(Duration::from_secs(secs))
}

/// Parse `host:port, tag, key`
fn parse_introducer(value: &str, line: usize) -> Result<Introducer, ConfigError> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    let [endpoint, tag, key] = parts.as_slice() else {
        return Err(ConfigError::ParseError {
            line,
            message: format!("Expected 'host:port, tag, key', got: {}", value),
        });
    };

    let endpoint = parse_endpoint(endpoint)?;
    let tag: u32 = tag.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid relay tag: {}", tag),
    })?;
    if tag == 0 {
        return Err(ConfigError::ParseError {
            line,
            message: "Relay tag must be non-zero".to_string(),
        });
    }

    Ok(Introducer {
        host: endpoint.ip(),
        port: endpoint.port(),
        tag,
        key: parse_key(key, "Introducer key")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"
# local router
[Transport]
PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=
IntroKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=
Host = 198.51.100.7
ListenPort = 12345
Introducer = true
ConnectTimeout = 10

[Peer]
PublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=
Endpoint = 203.0.113.9:23456
IntroKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=
PeerTest = yes

[Peer]
PublicKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=
Endpoint = 192.0.2.44:4000
IntroKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=
Introducer = 203.0.113.9:23456, 305419896, YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=
"#;

    #[test]
    fn test_parse_config() {
        let config = SsuConfig::parse(TEST_CONFIG).unwrap();

        let t = &config.transport;
        assert_eq!(t.listen_addr().to_string(), "198.51.100.7:12345");
        assert!(t.introducer);
        assert!(!t.unreachable);
        assert_eq!(t.connect_timeout, Duration::from_secs(10));
        assert_eq!(t.termination_timeout, TERMINATION_TIMEOUT);
        assert_eq!(t.keep_alive_interval, KEEP_ALIVE_INTERVAL);

        assert_eq!(config.peers.len(), 2);
        let direct = config.peers[0].router_info().unwrap();
        assert!(direct.peer_testing);
        assert!(!direct.uses_introducer);
        assert_eq!(
            direct.address.unwrap().endpoint().to_string(),
            "203.0.113.9:23456"
        );

        let introduced = config.peers[1].router_info().unwrap();
        assert!(introduced.uses_introducer);
        let introducer = &introduced.address.as_ref().unwrap().introducers[0];
        assert_eq!(introducer.tag, 0x1234_5678);
        assert_eq!(introducer.endpoint().to_string(), "203.0.113.9:23456");
    }

    #[test]
    fn test_registry_settings() {
        let config = SsuConfig::parse(TEST_CONFIG).unwrap();
        let settings = config.transport.registry_settings();
        assert_eq!(settings.session.connect_timeout, Duration::from_secs(10));
        assert!(!settings.session.strict_signatures);
        assert_eq!(settings.max_introducers, 3);
    }

    #[test]
    fn test_published_address_without_host() {
        let config = SsuConfig::parse(
            "[Transport]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\nIntroKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\nListenPort = 0\n",
        )
        .unwrap();
        assert_eq!(config.transport.listen_addr().to_string(), "0.0.0.0:0");

        let bound: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let address = config.transport.published_address(bound);
        assert_eq!(address.endpoint(), bound);
        assert_eq!(address.intro_key, config.transport.intro_key);
    }

    #[test]
    fn test_invalid_key() {
        assert!(parse_key("invalid-base64!", "TestKey").is_err());
        assert!(parse_key("dG9vIHNob3J0", "TestKey").is_err());
    }

    #[test]
    fn test_missing_transport() {
        let config = "[Peer]\nPublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n";
        assert!(matches!(
            SsuConfig::parse(config),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_missing_intro_key() {
        let config = "[Transport]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\nListenPort = 1\n";
        assert!(matches!(
            SsuConfig::parse(config),
            Err(ConfigError::MissingField { field }) if field == "IntroKey"
        ));
    }

    #[test]
    fn test_bad_values() {
        let bad_bool = "[Transport]\nUnreachable = maybe\n";
        assert!(matches!(
            SsuConfig::parse(bad_bool),
            Err(ConfigError::ParseError { line: 2, .. })
        ));

        assert!(parse_introducer("10.0.0.1:1, 0, YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=", 1).is_err());
        assert!(parse_introducer("10.0.0.1:1, 5", 1).is_err());
        assert!(parse_secs("0", "ConnectTimeout", 1).is_err());
    }

    #[test]
    fn test_peer_without_endpoint() {
        let config = SsuConfig::parse(
            "[Transport]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\nIntroKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\nListenPort = 1\n[Peer]\nPublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n",
        )
        .unwrap();
        assert!(config.peers[0].router_info().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssud.conf");
        std::fs::write(&path, TEST_CONFIG).unwrap();
        let config = SsuConfig::from_file(&path).unwrap();
        assert_eq!(config.peers.len(), 2);

        assert!(matches!(
            SsuConfig::from_file(dir.path().join("missing.conf")),
            Err(ConfigError::FileNotFound { .. })
        ));
    }
}

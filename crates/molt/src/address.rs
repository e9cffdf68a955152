//! Bind targets and their canonical identity.
//!
//! The canonical string (`tcp@0.0.0.0:8080`, `unix@/run/app.sock`) is the
//! key that correlates a listener across the parent/child boundary, so it
//! must be a pure function of the address fields.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::{GraceError, Result};

/// Host used when none is configured.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Port used by [`Address::default`].
pub const DEFAULT_PORT: u16 = 8080;

/// Socket family of a bind target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// TCP over IPv4 or IPv6.
    #[default]
    Tcp,
    /// TCP over IPv4 only.
    Tcp4,
    /// TCP over IPv6 only.
    Tcp6,
    /// Unix domain stream socket.
    Unix,
    /// Unix domain sequenced-packet socket.
    UnixPacket,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Unix => "unix",
            Network::UnixPacket => "unixpacket",
        }
    }

    /// Whether this family binds to a filesystem path instead of a port.
    pub fn is_unix(&self) -> bool {
        matches!(self, Network::Unix | Network::UnixPacket)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = GraceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "unix" => Ok(Network::Unix),
            "unixpacket" => Ok(Network::UnixPacket),
            other => Err(GraceError::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// A bind target: TCP host and port, or a Unix socket path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Socket file path, for unix families.
    #[serde(default)]
    pub sock: Option<PathBuf>,
}

impl Default for Address {
    fn default() -> Self {
        Self::tcp(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl Address {
    /// A TCP address.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::inet(Network::Tcp, host, port)
    }

    /// A TCP address restricted to one IP family (or plain tcp).
    pub fn inet(network: Network, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            network,
            host: unbracket(&host).to_string(),
            port,
            sock: None,
        }
    }

    /// A Unix stream socket address.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            network: Network::Unix,
            host: String::new(),
            port: 0,
            sock: Some(path.into()),
        }
    }

    /// A Unix sequenced-packet socket address.
    pub fn unix_packet(path: impl Into<PathBuf>) -> Self {
        Self {
            network: Network::UnixPacket,
            ..Self::unix(path)
        }
    }

    /// Validate the address.
    ///
    /// Unix families need a socket path; every other family needs a port.
    pub fn check(&self) -> Result<()> {
        if self.network.is_unix() {
            if self.sock_path().is_none() {
                return Err(GraceError::invalid_address(format!(
                    "{} address requires a socket path",
                    self.network
                )));
            }
        } else if self.port == 0 {
            return Err(GraceError::invalid_address(format!(
                "{} address requires a non-zero port",
                self.network
            )));
        }
        Ok(())
    }

    /// The socket path, if set and non-empty.
    pub fn sock_path(&self) -> Option<&std::path::Path> {
        self.sock
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    /// Host for display, `0.0.0.0` when unset.
    ///
    /// Never used to dial a unix socket.
    ///
    /// IPv6 brackets are stripped, so `[::1]` set directly or through a
    /// config file renders the same as `::1`.
    pub fn display_host(&self) -> &str {
        match unbracket(&self.host) {
            "" => DEFAULT_HOST,
            host => host,
        }
    }

    /// Canonical identity: `network@host:port` or `network@path`.
    pub fn canonical(&self) -> String {
        if self.network.is_unix() {
            let sock = self
                .sock
                .as_deref()
                .map(|path| path.display().to_string())
                .unwrap_or_default();
            format!("{}@{}", self.network, sock)
        } else {
            format!("{}@{}:{}", self.network, self.display_host(), self.port)
        }
    }

    /// OS listen string, without the network prefix.
    pub fn addr(&self) -> String {
        if self.network.is_unix() {
            self.sock
                .as_deref()
                .map(|path| path.display().to_string())
                .unwrap_or_default()
        } else if self.display_host().contains(':') {
            format!("[{}]:{}", self.display_host(), self.port)
        } else {
            format!("{}:{}", self.display_host(), self.port)
        }
    }

    /// Environment key carrying this address's inherited fd offset:
    /// the lowercase hex MD5 digest of [`Address::canonical`].
    pub fn env_key(&self) -> String {
        env_key_for(&self.canonical())
    }
}

fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Lowercase hex MD5 digest of a canonical address string.
pub fn env_key_for(canonical: &str) -> String {
    hex::encode(Md5::digest(canonical.as_bytes()))
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Parses the canonical form back into an address.
///
/// The network prefix is optional and defaults to `tcp`; IPv6 hosts may be
/// written bare (`tcp6@::1:8080`) or bracketed (`tcp6@[::1]:8080`).
impl FromStr for Address {
    type Err = GraceError;

    fn from_str(s: &str) -> Result<Self> {
        let (network, rest) = match s.split_once('@') {
            Some((network, rest)) => (network.parse::<Network>()?, rest),
            None => (Network::Tcp, s),
        };

        if network.is_unix() {
            return Ok(Self {
                network,
                ..Self::unix(rest)
            });
        }

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| GraceError::invalid_address(format!("missing port in {s}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| GraceError::invalid_address(format!("bad port in {s}: {e}")))?;
        Ok(Self::inet(network, host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_address() {
        let addr = Address::default();
        assert_eq!(addr.network, Network::Tcp);
        assert_eq!(addr.canonical(), "tcp@0.0.0.0:8080");
        assert_eq!(addr.addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_canonical_is_stable() {
        let addr = Address::tcp("127.0.0.1", 9000);
        let first = addr.canonical();
        for _ in 0..3 {
            assert_eq!(addr.canonical(), first);
            assert_eq!(addr.clone().to_string(), first);
        }
        assert_eq!(first, "tcp@127.0.0.1:9000");
    }

    #[test]
    fn test_empty_host_defaults_in_canonical() {
        let addr = Address::tcp("", 8081);
        assert_eq!(addr.canonical(), "tcp@0.0.0.0:8081");
        assert_eq!(addr.canonical(), Address::tcp("0.0.0.0", 8081).canonical());
        // The fields themselves are left untouched.
        assert!(addr.host.is_empty());
    }

    #[test]
    fn test_unix_canonical_and_addr() {
        let addr = Address::unix("/tmp/molt.sock");
        assert_eq!(addr.canonical(), "unix@/tmp/molt.sock");
        assert_eq!(addr.addr(), "/tmp/molt.sock");

        let packet = Address::unix_packet("/tmp/molt.sock");
        assert_eq!(packet.canonical(), "unixpacket@/tmp/molt.sock");
    }

    #[test]
    fn test_unix_host_is_display_only() {
        let addr = Address::unix("/tmp/display.sock");
        assert_eq!(addr.display_host(), DEFAULT_HOST);
        assert_eq!(addr.addr(), "/tmp/display.sock");
        assert!(!addr.canonical().contains(DEFAULT_HOST));
    }

    #[test]
    fn test_check_rejects_unix_without_path() {
        let mut addr = Address::unix("");
        assert!(matches!(addr.check(), Err(GraceError::InvalidAddress(_))));

        addr.sock = None;
        assert!(matches!(addr.check(), Err(GraceError::InvalidAddress(_))));

        addr.sock = Some("/tmp/ok.sock".into());
        assert!(addr.check().is_ok());
    }

    #[test]
    fn test_check_rejects_zero_port() {
        assert!(matches!(
            Address::tcp("127.0.0.1", 0).check(),
            Err(GraceError::InvalidAddress(_))
        ));
        assert!(Address::tcp("127.0.0.1", 1).check().is_ok());
        assert!(Address::inet(Network::Tcp6, "::1", 443).check().is_ok());
    }

    #[test]
    fn test_ipv6_addr_is_bracketed() {
        let addr = Address::inet(Network::Tcp6, "::1", 8443);
        assert_eq!(addr.canonical(), "tcp6@::1:8443");
        assert_eq!(addr.addr(), "[::1]:8443");
    }

    #[test]
    fn test_bracketed_host_is_normalised() {
        let direct = Address {
            network: Network::Tcp6,
            host: "[::1]".to_string(),
            port: 8443,
            sock: None,
        };
        assert_eq!(direct.addr(), "[::1]:8443");
        assert_eq!(direct.canonical(), "tcp6@::1:8443");
        assert_eq!(direct.env_key(), Address::inet(Network::Tcp6, "::1", 8443).env_key());

        assert_eq!(Address::inet(Network::Tcp6, "[::1]", 8443).host, "::1");
    }

    #[test]
    fn test_env_key_is_md5_of_canonical() {
        let addr = Address::default();
        let key = addr.env_key();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(key, env_key_for("tcp@0.0.0.0:8080"));
        assert_ne!(key, Address::tcp("0.0.0.0", 8081).env_key());
        // Well-known digest of the empty string.
        assert_eq!(env_key_for(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_parse_round_trips_canonical() {
        for text in [
            "tcp@0.0.0.0:8080",
            "tcp4@127.0.0.1:80",
            "tcp6@::1:8443",
            "unix@/tmp/a.sock",
            "unixpacket@/tmp/b.sock",
        ] {
            let addr: Address = text.parse().unwrap();
            assert_eq!(addr.canonical(), text);
        }
    }

    #[test]
    fn test_parse_without_network_defaults_to_tcp() {
        let addr: Address = "127.0.0.1:3000".parse().unwrap();
        assert_eq!(addr, Address::tcp("127.0.0.1", 3000));

        let bracketed: Address = "tcp6@[::1]:3000".parse().unwrap();
        assert_eq!(bracketed.host, "::1");
    }

    #[test]
    fn test_parse_rejects_unsupported_network() {
        let err = "udp@0.0.0.0:53".parse::<Address>().unwrap_err();
        assert!(matches!(err, GraceError::UnsupportedNetwork(ref n) if n == "udp"));

        assert!(matches!(
            "tcp@0.0.0.0".parse::<Address>(),
            Err(GraceError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct File {
            listen: Vec<Address>,
        }

        let file: File = toml::from_str(
            r#"
            [[listen]]
            port = 8080

            [[listen]]
            network = "unixpacket"
            sock = "/tmp/p.sock"

            [[listen]]
            network = "tcp6"
            host = "[::1]"
            port = 9443
            "#,
        )
        .unwrap();

        assert_eq!(file.listen[0].canonical(), "tcp@0.0.0.0:8080");
        assert_eq!(file.listen[1].canonical(), "unixpacket@/tmp/p.sock");
        assert_eq!(file.listen[2].addr(), "[::1]:9443");
        assert_eq!(file.listen[2].canonical(), "tcp6@::1:9443");
    }
}

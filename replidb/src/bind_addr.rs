use core::fmt;
use std::io;
use std::net::{Ipv6Addr, SocketAddr, ToSocketAddrs as _};
use std::str::FromStr;

/// Port assumed when an endpoint string omits one.
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, PartialEq, Eq)]
pub enum BadBindAddr {
    Empty,
    HostMissing,
    BadPort { value: String },
}

impl fmt::Display for BadBindAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BadBindAddr::Empty => write!(f, "endpoint string is empty"),
            BadBindAddr::HostMissing => write!(f, "host is missing"),
            BadBindAddr::BadPort { value } => write!(f, "bad port value: {value}"),
        }
    }
}

impl std::error::Error for BadBindAddr {}

/// A parsed endpoint string.
///
/// Two families are supported, distinguished by the first character:
/// `@[PATH]` is a local-domain abstract endpoint (the sole string `@`
/// meaning "let the kernel pick a path"), anything else is `HOST[:PORT]`
/// with HOST an IPv4/IPv6 literal or a DNS name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddr {
    Tcp { host: String, port: u16 },
    Local { path: Option<String> },
}

impl BindAddr {
    pub fn parse(s: &str) -> Result<Self, BadBindAddr> {
        if s.is_empty() {
            return Err(BadBindAddr::Empty);
        }

        if let Some(path) = s.strip_prefix('@') {
            let path = (!path.is_empty()).then(|| path.to_owned());
            return Ok(BindAddr::Local { path });
        }

        // A bare IPv6 literal has colons of its own; only the bracketed
        // form may carry a port.
        if s.parse::<Ipv6Addr>().is_ok() {
            return Ok(BindAddr::Tcp {
                host: s.to_owned(),
                port: DEFAULT_PORT,
            });
        }

        let is_bracketed = s.starts_with('[');

        let port_start = if is_bracketed {
            s.rfind("]:").map(|idx| idx + 2)
        } else {
            s.rfind(':').map(|idx| idx + 1)
        };

        let (host, port) = if let Some(port_start) = port_start {
            let port = &s[port_start..];
            let port = port.parse::<u16>().map_err(|_| BadBindAddr::BadPort {
                value: port.to_owned(),
            })?;
            (&s[..port_start - 1], port)
        } else {
            (s, DEFAULT_PORT)
        };

        let host = if is_bracketed {
            host.trim_start_matches('[').trim_end_matches(']')
        } else {
            host
        };

        if host.is_empty() {
            return Err(BadBindAddr::HostMissing);
        }

        Ok(BindAddr::Tcp {
            host: host.to_owned(),
            port,
        })
    }

    /// Resolves the network form to a concrete socket address (first
    /// result wins, as for outbound dials).
    pub(crate) fn resolve(&self) -> io::Result<SocketAddr> {
        match self {
            BindAddr::Tcp { host, port } => (host.as_str(), *port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host lookup yielded no result")),
            BindAddr::Local { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "local-domain endpoints have no socket address",
            )),
        }
    }
}

impl FromStr for BindAddr {
    type Err = BadBindAddr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BindAddr::parse(s)
    }
}

impl fmt::Display for BindAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindAddr::Tcp { host, port } => {
                if host.contains(':') {
                    write!(f, "[{host}]:{port}")
                } else {
                    write!(f, "{host}:{port}")
                }
            }
            BindAddr::Local { path: Some(path) } => write!(f, "@{path}"),
            BindAddr::Local { path: None } => write!(f, "@"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("127.0.0.1:9001", "127.0.0.1", 9001)]
    #[case("127.0.0.1", "127.0.0.1", DEFAULT_PORT)]
    #[case("localhost", "localhost", DEFAULT_PORT)]
    #[case("db-3.internal:7000", "db-3.internal", 7000)]
    #[case("[::1]:9001", "::1", 9001)]
    #[case("::1", "::1", DEFAULT_PORT)]
    #[case("2001:db8::8a2e:370:7334", "2001:db8::8a2e:370:7334", DEFAULT_PORT)]
    fn network_endpoints(#[case] repr: &str, #[case] host: &str, #[case] port: u16) {
        let addr = BindAddr::parse(repr).unwrap();
        assert_eq!(
            addr,
            BindAddr::Tcp {
                host: host.to_owned(),
                port
            }
        );
    }

    #[rstest]
    #[case("@", None)]
    #[case("@replidb-1", Some("replidb-1"))]
    fn local_endpoints(#[case] repr: &str, #[case] path: Option<&str>) {
        let addr = BindAddr::parse(repr).unwrap();
        assert_eq!(
            addr,
            BindAddr::Local {
                path: path.map(str::to_owned)
            }
        );
    }

    #[rstest]
    #[case("", BadBindAddr::Empty)]
    #[case(":8080", BadBindAddr::HostMissing)]
    #[case("localhost:port", BadBindAddr::BadPort { value: "port".to_owned() })]
    #[case("localhost:99999", BadBindAddr::BadPort { value: "99999".to_owned() })]
    fn rejected_endpoints(#[case] repr: &str, #[case] expected: BadBindAddr) {
        assert_eq!(BindAddr::parse(repr).unwrap_err(), expected);
    }

    #[rstest]
    #[case("127.0.0.1:9001")]
    #[case("[::1]:9001")]
    #[case("@")]
    #[case("@replidb-1")]
    fn display_round_trips(#[case] repr: &str) {
        let addr = BindAddr::parse(repr).unwrap();
        assert_eq!(BindAddr::parse(&addr.to_string()).unwrap(), addr);
    }

    #[test]
    fn resolve_network_form() {
        let addr = BindAddr::parse("127.0.0.1:9001").unwrap();
        assert_eq!(addr.resolve().unwrap(), "127.0.0.1:9001".parse().unwrap());
    }
}

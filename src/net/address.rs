use std::{
    fmt, io,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use clap::ValueEnum;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid endpoint '{0}'")]
    Invalid(String),

    #[error("unknown scheme '{0}', expected oncrpc, oncrpcu or oncrpcs")]
    UnknownScheme(String),

    #[error("endpoint '{0}' is missing a port")]
    MissingPort(String),

    #[error("failed to resolve '{host}': {source}")]
    Resolve { host: String, source: io::Error },

    #[error("'{0}' did not resolve to any address")]
    NoAddress(String),
}

/// How bytes travel between peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, ValueEnum)]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
    /// TCP with a handshake performed before any request bytes flow.
    Tunnel,
}

impl Transport {
    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Tcp => "oncrpc",
            Transport::Udp => "oncrpcu",
            Transport::Tunnel => "oncrpcs",
        }
    }

    pub fn is_stream(&self) -> bool {
        !matches!(self, Transport::Udp)
    }
}

/// An unresolved peer location: `oncrpc://host:port`, `oncrpcu://host:port`,
/// `oncrpcs://host:port` or a bare `host:port` (TCP).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(transport: Transport, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
        }
    }

    /// Resolves the host to the first matching socket address.
    pub fn resolve(&self) -> Result<SocketAddr, AddressError> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        (host, self.port)
            .to_socket_addrs()
            .map_err(|source| AddressError::Resolve {
                host: self.host.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| AddressError::NoAddress(self.to_string()))
    }
}

impl FromStr for Endpoint {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (transport, rest) = match s.split_once("://") {
            Some((scheme, rest)) => {
                let transport = match scheme.to_ascii_lowercase().as_str() {
                    "oncrpc" | "tcp" => Transport::Tcp,
                    "oncrpcu" | "udp" => Transport::Udp,
                    "oncrpcs" => Transport::Tunnel,
                    other => return Err(AddressError::UnknownScheme(other.to_string())),
                };
                (transport, rest)
            }
            None => (Transport::Tcp, s),
        };

        // Anything after the authority (a path, a query) is not ours to interpret.
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(AddressError::Invalid(s.to_string()));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && (!host.contains(':') || host.ends_with(']')) => {
                (host, port)
            }
            _ => return Err(AddressError::MissingPort(s.to_string())),
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressError::Invalid(s.to_string()))?;

        Ok(Endpoint::new(transport, host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.transport.scheme(), self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_schemes() {
        let inputs = vec![
            ("oncrpc://localhost:32638", Transport::Tcp),
            ("oncrpcu://localhost:32638", Transport::Udp),
            ("oncrpcs://localhost:32638", Transport::Tunnel),
            ("localhost:32638", Transport::Tcp),
        ];

        for (uri, expected) in inputs {
            let endpoint: Endpoint = uri.parse().unwrap();
            assert_eq!(endpoint.transport, expected);
            assert_eq!(endpoint.host, "localhost");
            assert_eq!(endpoint.port, 32638);
        }
    }

    #[test]
    fn parse_ignores_path() {
        let endpoint: Endpoint = "oncrpc://127.0.0.1:2049/export".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new(Transport::Tcp, "127.0.0.1", 2049));
    }

    #[test]
    fn parse_ipv6_literal() {
        let endpoint: Endpoint = "oncrpc://[::1]:111".parse().unwrap();
        assert_eq!(endpoint.host, "[::1]");
        assert_eq!(endpoint.resolve().unwrap(), "[::1]:111".parse().unwrap());
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(matches!(
            "http://localhost:80".parse::<Endpoint>(),
            Err(AddressError::UnknownScheme(_))
        ));
        assert!(matches!(
            "oncrpc://localhost".parse::<Endpoint>(),
            Err(AddressError::MissingPort(_))
        ));
        assert!(matches!(
            "oncrpc://localhost:notaport".parse::<Endpoint>(),
            Err(AddressError::Invalid(_))
        ));
        assert!(matches!(
            "oncrpc://".parse::<Endpoint>(),
            Err(AddressError::Invalid(_))
        ));
    }

    #[test]
    fn resolve_loopback() {
        let endpoint = Endpoint::new(Transport::Udp, "127.0.0.1", 9000);
        assert_eq!(endpoint.resolve().unwrap(), "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn display_round_trips_scheme() {
        let endpoint = Endpoint::new(Transport::Tunnel, "example.org", 443);
        assert_eq!(endpoint.to_string(), "oncrpcs://example.org:443");
    }
}

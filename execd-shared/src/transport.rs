//! Transport types for daemon-client communication.

use std::path::PathBuf;

/// Transport mechanism for the execd control socket.
///
/// Represents the underlying connection type used by both the daemon (to
/// listen) and clients (to connect).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Transport {
    /// TCP transport
    Tcp { host: String, port: u16 },

    /// Unix socket transport
    Unix { socket_path: PathBuf },
}

impl Transport {
    /// Create a TCP transport.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Create a Unix socket transport.
    pub fn unix(socket_path: impl Into<PathBuf>) -> Self {
        Self::Unix {
            socket_path: socket_path.into(),
        }
    }

    /// Get the URI representation of this transport.
    pub fn to_uri(&self) -> String {
        match self {
            Transport::Tcp { host, port } => format!("tcp://{}:{}", host, port),
            Transport::Unix { socket_path } => format!("unix://{}", socket_path.display()),
        }
    }

    /// Parse a transport from a URI string.
    pub fn from_uri(uri: &str) -> Result<Self, String> {
        if let Some(rest) = uri.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| format!("invalid TCP URI '{}': missing port", uri))?;
            if host.is_empty() {
                return Err(format!("invalid TCP URI '{}': missing host", uri));
            }
            let port = port
                .parse::<u16>()
                .map_err(|e| format!("invalid TCP port in '{}': {}", uri, e))?;
            Ok(Self::tcp(host, port))
        } else if let Some(path) = uri.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(format!("invalid unix URI '{}': missing socket path", uri));
            }
            Ok(Self::unix(path))
        } else {
            Err(format!(
                "invalid transport URI '{}': expected tcp:// or unix://",
                uri
            ))
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_uri(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix() {
        let t: Transport = "unix:///run/execd/execd.sock".parse().unwrap();
        assert_eq!(t, Transport::unix("/run/execd/execd.sock"));
        assert_eq!(t.to_uri(), "unix:///run/execd/execd.sock");
    }

    #[test]
    fn test_parse_tcp() {
        let t = Transport::from_uri("tcp://127.0.0.1:2375").unwrap();
        assert_eq!(t, Transport::tcp("127.0.0.1", 2375));
        assert_eq!(t.to_string(), "tcp://127.0.0.1:2375");
    }

    #[test]
    fn test_parse_rejects_bad_uris() {
        assert!(Transport::from_uri("tcp://localhost").is_err());
        assert!(Transport::from_uri("tcp://:80").is_err());
        assert!(Transport::from_uri("tcp://host:notaport").is_err());
        assert!(Transport::from_uri("unix://").is_err());
        assert!(Transport::from_uri("vsock://2695").is_err());
    }
}

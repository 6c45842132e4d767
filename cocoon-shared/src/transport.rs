//! Listen and notify address parsing.
//!
//! The supervisor listens on a vsock port in production; unix and tcp
//! transports exist for development and tests.

use std::path::PathBuf;

use crate::errors::{CocoonError, CocoonResult};

/// A parsed transport URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// `vsock://<port>`
    Vsock { port: u32 },
    /// `unix://<path>`
    Unix { socket_path: PathBuf },
    /// `tcp://<port>`, bound on localhost
    Tcp { port: u16 },
}

impl Transport {
    /// Parse a transport URI.
    pub fn from_uri(uri: &str) -> CocoonResult<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| CocoonError::InvalidArguments(format!("missing scheme in '{uri}'")))?;

        match scheme {
            "vsock" => {
                let port = rest.parse::<u32>().map_err(|_| {
                    CocoonError::InvalidArguments(format!("invalid vsock port '{rest}'"))
                })?;
                Ok(Transport::Vsock { port })
            }
            "unix" => {
                if rest.is_empty() {
                    return Err(CocoonError::InvalidArguments(format!(
                        "empty unix socket path in '{uri}'"
                    )));
                }
                Ok(Transport::Unix {
                    socket_path: PathBuf::from(rest),
                })
            }
            "tcp" => {
                // Accept both "tcp://8080" and "tcp://127.0.0.1:8080".
                let port_str = rest.rsplit(':').next().unwrap_or(rest);
                let port = port_str.parse::<u16>().map_err(|_| {
                    CocoonError::InvalidArguments(format!("invalid tcp port '{rest}'"))
                })?;
                Ok(Transport::Tcp { port })
            }
            other => Err(CocoonError::InvalidArguments(format!(
                "unsupported transport scheme '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Vsock { port } => write!(f, "vsock://{port}"),
            Transport::Unix { socket_path } => write!(f, "unix://{}", socket_path.display()),
            Transport::Tcp { port } => write!(f, "tcp://{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vsock() {
        assert_eq!(
            Transport::from_uri("vsock://2695").unwrap(),
            Transport::Vsock { port: 2695 }
        );
    }

    #[test]
    fn parses_unix() {
        assert_eq!(
            Transport::from_uri("unix:///run/cocoon.sock").unwrap(),
            Transport::Unix {
                socket_path: PathBuf::from("/run/cocoon.sock")
            }
        );
    }

    #[test]
    fn parses_tcp_with_and_without_host() {
        assert_eq!(
            Transport::from_uri("tcp://8080").unwrap(),
            Transport::Tcp { port: 8080 }
        );
        assert_eq!(
            Transport::from_uri("tcp://127.0.0.1:8080").unwrap(),
            Transport::Tcp { port: 8080 }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(Transport::from_uri("2695").is_err());
        assert!(Transport::from_uri("vsock://many").is_err());
        assert!(Transport::from_uri("ftp://x").is_err());
        assert!(Transport::from_uri("unix://").is_err());
    }
}

//! Protocol adapter layer. Every protocol module follows the same shape: a
//! *server* exposes a subset of tags at addressed protocol points and feeds
//! inbound writes into the pending update queues, while a *client* owns one
//! or more connections that poll a remote server and mirror values into a
//! local register table.

pub mod bacnet;
pub mod command;
pub mod dnp3;
pub mod goose;
pub mod iec104;
pub mod modbus;
pub mod registers;

use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use thiserror::Error;

pub use registers::RegisterBank;

/// Register semantics of a mirrored point: `Status` kinds are boolean,
/// `Value` kinds are floating, `Int` kinds integer. Read/write decides
/// which side of the protocol may drive the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterKind {
    #[default]
    None,
    StatusReadOnly,
    StatusReadWrite,
    ValueReadOnly,
    ValueReadWrite,
    IntReadOnly,
    IntReadWrite,
}

/// A client connection's cached mirror of one remote point, plus its
/// protocol addressing.
#[derive(Debug, Clone, Default)]
pub struct RegisterDescriptor {
    pub kind: RegisterKind,
    pub address: u16,
    pub tag: String,
    pub status: bool,
    pub float_value: f32,
    pub int_value: i32,
}

impl RegisterDescriptor {
    pub fn binary(address: u16, tag: &str, kind: RegisterKind) -> Self {
        Self {
            kind,
            address,
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    pub fn analog(address: u16, tag: &str, kind: RegisterKind) -> Self {
        Self {
            kind,
            address,
            tag: tag.to_string(),
            ..Default::default()
        }
    }
}

/// Whether a mapped server point is fed from the process side (input) or
/// commanded by masters (output).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointDirection {
    Input,
    Output,
}

/// Errors shared across the protocol adapters.
#[derive(Debug, Error)]
pub enum CommsError {
    #[error("Unable to find tag -- {0}")]
    UnknownTag(String),
    #[error("unknown endpoint protocol ({0})")]
    InvalidEndpoint(String),
    #[error("unable to bind to {0}")]
    BindFailed(String),
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
    #[error("remote replied with an exception: {0}")]
    RemoteException(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// Capability surface a protocol client exposes to the command interface:
/// enumerate its tags, answer cached reads, and issue protocol writes.
#[async_trait]
pub trait CommsClient: Send + Sync {
    fn tags(&self) -> Vec<String>;

    fn is_valid_tag(&self, tag: &str) -> bool;

    /// Answers from the local register cache without touching the wire.
    fn read_tag(&self, tag: &str) -> Result<RegisterDescriptor, CommsError>;

    async fn write_binary_tag(&self, tag: &str, status: bool) -> Result<(), CommsError>;

    async fn write_analog_tag(&self, tag: &str, value: f64) -> Result<(), CommsError>;
}

/// Parsed form of a configured endpoint string: `tcp://host:port`,
/// `udp://host:port`, or anything without a scheme as a serial device path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Udp { host: String, port: u16 },
    Serial { device: String },
}

impl Endpoint {
    pub fn parse(value: &str) -> Result<Self, CommsError> {
        let split_host_port = |rest: &str| -> Result<(String, u16), CommsError> {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| CommsError::InvalidEndpoint(value.to_string()))?;
            let port = port
                .parse()
                .map_err(|_| CommsError::InvalidEndpoint(value.to_string()))?;
            Ok((host.to_string(), port))
        };
        if let Some(rest) = value.strip_prefix("tcp://") {
            let (host, port) = split_host_port(rest)?;
            Ok(Endpoint::Tcp { host, port })
        } else if let Some(rest) = value.strip_prefix("udp://") {
            let (host, port) = split_host_port(rest)?;
            Ok(Endpoint::Udp { host, port })
        } else if value.contains("://") {
            Err(CommsError::InvalidEndpoint(value.to_string()))
        } else {
            Ok(Endpoint::Serial {
                device: value.to_string(),
            })
        }
    }

    /// `host:port` form for the socket APIs; serial endpoints have none.
    pub fn socket_addr(&self) -> Option<String> {
        match self {
            Endpoint::Tcp { host, port } | Endpoint::Udp { host, port } => {
                Some(format!("{}:{}", host, port))
            }
            Endpoint::Serial { .. } => None,
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Endpoint::parse(&value).map_err(|err| err.to_string())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Endpoint::Udp { host, port } => write!(f, "udp://{}:{}", host, port),
            Endpoint::Serial { device } => f.write_str(device),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Endpoint;

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:502").unwrap(),
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 502
            }
        );
        assert_eq!(
            Endpoint::parse("udp://0.0.0.0:47808").unwrap(),
            Endpoint::Udp {
                host: "0.0.0.0".to_string(),
                port: 47808
            }
        );
        assert_eq!(
            Endpoint::parse("/dev/ttyS1").unwrap(),
            Endpoint::Serial {
                device: "/dev/ttyS1".to_string()
            }
        );
        assert!(Endpoint::parse("ipc:///tmp/sock").is_err());
        assert!(Endpoint::parse("tcp://missing-port").is_err());
    }
}

//! Networking primitives.
//!
//! Goals:
//! - Describe endpoints for a reliable (TCP) or unreliable (UDP) transport.
//! - Provide the two heartbeat tokens and their fixed-size wire form.
//! - Put every socket operation behind the [`Transport`] trait so the session
//!   never touches sockets directly and never blocks.
//!
//! The wire protocol is the closed set `{"Ping", "Pong"}` as NUL-terminated
//! text. Anything richer should move to a tagged, length-prefixed message.

use std::{fmt, io, net::SocketAddr};

use anyhow::Context;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Length of one encoded token, terminator included.
pub const TOKEN_LEN: usize = 5;

/// Largest datagram a transport hands to the session.
pub const MAX_DATAGRAM_LEN: usize = 512;

/// Transport flavour shared by both roles of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransportMode {
    /// Stream sockets: reliable, ordered, needs a handshake.
    #[default]
    #[serde(rename = "tcp", alias = "connection_oriented")]
    ConnectionOriented,
    /// Datagram sockets: ready immediately.
    #[serde(rename = "udp", alias = "connectionless")]
    Connectionless,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::ConnectionOriented => f.write_str("tcp"),
            TransportMode::Connectionless => f.write_str("udp"),
        }
    }
}

impl std::str::FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "stream" | "connection_oriented" => Ok(TransportMode::ConnectionOriented),
            "udp" | "datagram" | "connectionless" => Ok(TransportMode::Connectionless),
            other => anyhow::bail!("unknown transport mode {other:?}"),
        }
    }
}

/// Which side of the exchange a socket plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Listening role (binds, accepts for TCP).
    Server,
    /// Initiating role (connects to the peer).
    Client,
}

/// Address plus transport mode. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
    mode: TransportMode,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, mode: TransportMode) -> anyhow::Result<Self> {
        let host = host.into();
        if host.is_empty() {
            anyhow::bail!("endpoint host is empty");
        }
        Ok(Self { host, port, mode })
    }

    /// Parses `host:port`. IPv6 hosts must be bracketed (`[::1]:4950`).
    pub fn parse(addr: &str, mode: TransportMode) -> anyhow::Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .with_context(|| format!("missing port in {addr:?}"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port in {addr:?}"))?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .with_context(|| format!("unclosed bracket in {addr:?}"))?,
            None if host.contains(':') => {
                anyhow::bail!("IPv6 host must be bracketed in {addr:?}, e.g. [::1]:4950")
            }
            None => host,
        };
        Self::new(host, port, mode)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Resolves the endpoint to a socket address (first result wins).
    pub async fn resolve(&self) -> anyhow::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("resolve {self}"))?
            .next()
            .with_context(|| format!("no address for {self}"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.mode, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.mode, self.host, self.port)
        }
    }
}

/// Opaque transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u32);

/// Heartbeat token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    Ping,
    Pong,
}

impl Token {
    pub fn as_str(self) -> &'static str {
        match self {
            Token::Ping => "Ping",
            Token::Pong => "Pong",
        }
    }

    /// The token owed in reply to this one.
    pub fn reply(self) -> Token {
        match self {
            Token::Ping => Token::Pong,
            Token::Pong => Token::Ping,
        }
    }

    /// Encodes the token as NUL-terminated text.
    pub fn encode(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TOKEN_LEN);
        buf.extend_from_slice(self.as_str().as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }

    /// Decodes exactly one encoded token. Truncated, oversized and foreign
    /// input yields `None`.
    pub fn decode(buf: &[u8]) -> Option<Token> {
        if buf.len() != TOKEN_LEN || buf[TOKEN_LEN - 1] != 0 {
            return None;
        }
        match &buf[..TOKEN_LEN - 1] {
            b"Ping" => Some(Token::Ping),
            b"Pong" => Some(Token::Pong),
            _ => None,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one readability poll.
#[derive(Debug, Default)]
pub struct Readiness {
    /// Handles with at least one buffered message.
    pub ready: Vec<HandleId>,
    /// Handles whose receive failed during the poll.
    pub failed: Vec<(HandleId, io::Error)>,
}

/// Socket-level collaborator driven by a session.
///
/// Every method must return promptly: accept and connect checks use a zero
/// timeout and the data plane is non-blocking.
#[async_trait]
pub trait Transport: Send {
    /// Creates a socket for `endpoint`. Servers bind (and listen for TCP);
    /// clients start connecting.
    async fn open(&mut self, endpoint: &Endpoint, role: Role) -> anyhow::Result<HandleId>;

    /// Accepts one pending peer on a listening handle, if any.
    async fn accept(&mut self, listener: HandleId) -> anyhow::Result<Option<HandleId>>;

    /// Reports whether a client handle has finished connecting.
    async fn poll_connected(&mut self, handle: HandleId) -> anyhow::Result<bool>;

    /// Pulls pending input off the given handles into per-handle buffers.
    fn poll_readable(&mut self, handles: &[HandleId]) -> Readiness;

    /// Pops the next buffered message for `handle`.
    fn recv(&mut self, handle: HandleId) -> Option<Bytes>;

    /// Sends `payload` on `handle` without blocking.
    fn send(&mut self, handle: HandleId, payload: &[u8]) -> io::Result<usize>;

    fn local_addr(&self, handle: HandleId) -> anyhow::Result<SocketAddr>;
}

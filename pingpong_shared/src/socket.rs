//! Tokio socket transport.
//!
//! Setup goes through the async tokio API wrapped in zero-timeout polls, so a
//! caller never waits on the network. The data plane uses the `try_*` family
//! only, which relies on the runtime driver marking sockets ready between
//! frames.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    pin::Pin,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream, UdpSocket},
    time,
};
use tracing::{debug, info, warn};

use crate::net::{
    Endpoint, HandleId, Readiness, Role, Transport, TransportMode, MAX_DATAGRAM_LEN, TOKEN_LEN,
};

/// Backlog passed to `listen`.
const LISTEN_BACKLOG: u32 = 16;

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

enum Socket {
    Listener(TcpListener),
    Connecting {
        connect: ConnectFuture,
        local: SocketAddr,
    },
    Stream {
        stream: TcpStream,
        inbound: BytesMut,
        closed: bool,
    },
    Datagram {
        socket: UdpSocket,
        inbound: VecDeque<Bytes>,
        /// Last sender, used to answer on an unconnected socket.
        reply_to: Option<SocketAddr>,
        connected: bool,
    },
}

/// Transport backed by real TCP/UDP sockets.
#[derive(Default)]
pub struct SocketTransport {
    next_id: u32,
    sockets: HashMap<HandleId, Socket>,
    /// Zero unless a test wants to give slow peers some slack.
    poll_timeout: Duration,
}

impl SocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the timeout used for accept/connect polls.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    fn insert(&mut self, socket: Socket) -> HandleId {
        self.next_id += 1;
        let id = HandleId(self.next_id);
        self.sockets.insert(id, socket);
        id
    }

    fn socket_mut(&mut self, handle: HandleId) -> anyhow::Result<&mut Socket> {
        self.sockets
            .get_mut(&handle)
            .with_context(|| format!("unknown handle {handle:?}"))
    }

    fn open_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
        let socket = new_tcp_socket(addr).context("tcp create")?;
        socket.set_reuseaddr(true).context("tcp setsockopt")?;
        socket.bind(addr).context("tcp bind")?;
        socket.listen(LISTEN_BACKLOG).context("tcp listen")
    }

    /// Drains whatever the socket has into its inbound buffer.
    fn fill(socket: &mut Socket) -> io::Result<()> {
        match socket {
            Socket::Stream {
                stream,
                inbound,
                closed,
            } => {
                if *closed {
                    return Ok(());
                }
                let mut buf = [0u8; MAX_DATAGRAM_LEN];
                loop {
                    match stream.try_read(&mut buf) {
                        Ok(0) => {
                            *closed = true;
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "peer closed the stream",
                            ));
                        }
                        Ok(n) => inbound.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
            }
            Socket::Datagram {
                socket,
                inbound,
                reply_to,
                ..
            } => {
                // One byte over the limit so oversized datagrams stay detectable.
                let mut buf = [0u8; MAX_DATAGRAM_LEN + 1];
                loop {
                    match socket.try_recv_from(&mut buf) {
                        Ok((n, from)) => {
                            *reply_to = Some(from);
                            inbound.push_back(Bytes::copy_from_slice(&buf[..n]));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
            }
            Socket::Listener(_) | Socket::Connecting { .. } => Ok(()),
        }
    }

    fn has_message(socket: &Socket) -> bool {
        match socket {
            Socket::Stream { inbound, .. } => stream_frame_len(inbound).is_some(),
            Socket::Datagram { inbound, .. } => !inbound.is_empty(),
            Socket::Listener(_) | Socket::Connecting { .. } => false,
        }
    }
}

/// Length of the next message at the front of a stream buffer: up to and
/// including the first NUL, or `MAX_DATAGRAM_LEN` bytes when no terminator
/// shows up within that many.
fn stream_frame_len(inbound: &[u8]) -> Option<usize> {
    match inbound.iter().position(|&b| b == 0) {
        Some(nul) if nul < MAX_DATAGRAM_LEN => Some(nul + 1),
        _ if inbound.len() >= MAX_DATAGRAM_LEN => Some(MAX_DATAGRAM_LEN),
        _ => None,
    }
}

fn new_tcp_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn open(&mut self, endpoint: &Endpoint, role: Role) -> anyhow::Result<HandleId> {
        let addr = endpoint.resolve().await?;
        let socket = match (endpoint.mode(), role) {
            (TransportMode::ConnectionOriented, Role::Server) => {
                let listener = Self::open_listener(addr)?;
                info!(addr = %listener.local_addr()?, "TCP listening");
                Socket::Listener(listener)
            }
            (TransportMode::ConnectionOriented, Role::Client) => {
                let socket = new_tcp_socket(addr).context("tcp create")?;
                let local = unspecified_for(addr);
                let mut connect: ConnectFuture = Box::pin(socket.connect(addr));
                // First poll issues the non-blocking connect.
                let polled = time::timeout(Duration::ZERO, connect.as_mut()).await;
                match polled {
                    Ok(Ok(stream)) => {
                        info!(peer = %addr, "TCP connected");
                        Socket::Stream {
                            stream,
                            inbound: BytesMut::with_capacity(TOKEN_LEN * 4),
                            closed: false,
                        }
                    }
                    Ok(Err(e)) => return Err(e).context("tcp connect"),
                    Err(_) => {
                        debug!(peer = %addr, "TCP connect in progress");
                        Socket::Connecting { connect, local }
                    }
                }
            }
            (TransportMode::Connectionless, Role::Server) => {
                let socket = UdpSocket::bind(addr).await.context("udp bind")?;
                socket.writable().await.context("udp writable")?;
                info!(addr = %socket.local_addr()?, "UDP bound");
                Socket::Datagram {
                    socket,
                    inbound: VecDeque::new(),
                    reply_to: None,
                    connected: false,
                }
            }
            (TransportMode::Connectionless, Role::Client) => {
                let socket = UdpSocket::bind(unspecified_for(addr))
                    .await
                    .context("udp bind")?;
                socket.connect(addr).await.context("udp connect")?;
                socket.writable().await.context("udp writable")?;
                debug!(peer = %addr, local = %socket.local_addr()?, "UDP connected");
                Socket::Datagram {
                    socket,
                    inbound: VecDeque::new(),
                    reply_to: None,
                    connected: true,
                }
            }
        };
        Ok(self.insert(socket))
    }

    async fn accept(&mut self, listener: HandleId) -> anyhow::Result<Option<HandleId>> {
        let poll_timeout = self.poll_timeout;
        let Socket::Listener(l) = self.socket_mut(listener)? else {
            anyhow::bail!("handle {listener:?} is not listening");
        };
        let polled = time::timeout(poll_timeout, l.accept()).await;
        match polled {
            Ok(Ok((stream, peer))) => {
                info!(%peer, "TCP peer accepted");
                let id = self.insert(Socket::Stream {
                    stream,
                    inbound: BytesMut::with_capacity(TOKEN_LEN * 4),
                    closed: false,
                });
                Ok(Some(id))
            }
            Ok(Err(e)) => Err(e).context("tcp accept"),
            Err(_) => Ok(None),
        }
    }

    async fn poll_connected(&mut self, handle: HandleId) -> anyhow::Result<bool> {
        let poll_timeout = self.poll_timeout;
        let socket = self.socket_mut(handle)?;
        let Socket::Connecting { connect, .. } = socket else {
            return Ok(true);
        };
        let polled = time::timeout(poll_timeout, connect.as_mut()).await;
        match polled {
            Ok(Ok(stream)) => {
                info!(peer = %stream.peer_addr()?, local = %stream.local_addr()?, "TCP connected");
                *socket = Socket::Stream {
                    stream,
                    inbound: BytesMut::with_capacity(TOKEN_LEN * 4),
                    closed: false,
                };
                Ok(true)
            }
            Ok(Err(e)) => {
                self.sockets.remove(&handle);
                Err(e).context("tcp connect")
            }
            Err(_) => Ok(false),
        }
    }

    fn poll_readable(&mut self, handles: &[HandleId]) -> Readiness {
        let mut readiness = Readiness::default();
        for &handle in handles {
            let Some(socket) = self.sockets.get_mut(&handle) else {
                continue;
            };
            if let Err(e) = Self::fill(socket) {
                readiness.failed.push((handle, e));
            }
            if Self::has_message(socket) {
                readiness.ready.push(handle);
            }
        }
        readiness
    }

    fn recv(&mut self, handle: HandleId) -> Option<Bytes> {
        match self.sockets.get_mut(&handle)? {
            Socket::Stream { inbound, .. } => {
                let len = stream_frame_len(inbound)?;
                Some(inbound.split_to(len).freeze())
            }
            Socket::Datagram { inbound, .. } => inbound.pop_front(),
            _ => None,
        }
    }

    fn send(&mut self, handle: HandleId, payload: &[u8]) -> io::Result<usize> {
        let socket = self
            .sockets
            .get_mut(&handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown handle"))?;
        match socket {
            Socket::Stream { stream, .. } => stream.try_write(payload),
            Socket::Datagram {
                socket,
                connected: true,
                ..
            } => socket.try_send(payload),
            Socket::Datagram {
                socket, reply_to, ..
            } => match reply_to {
                Some(peer) => socket.try_send_to(payload, *peer),
                None => Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no datagram peer to answer",
                )),
            },
            Socket::Listener(_) | Socket::Connecting { .. } => {
                warn!(?handle, "send on a handle without a peer");
                Err(io::Error::from(io::ErrorKind::NotConnected))
            }
        }
    }

    fn local_addr(&self, handle: HandleId) -> anyhow::Result<SocketAddr> {
        let socket = self
            .sockets
            .get(&handle)
            .with_context(|| format!("unknown handle {handle:?}"))?;
        let addr = match socket {
            Socket::Listener(l) => l.local_addr()?,
            Socket::Connecting { local, .. } => *local,
            Socket::Stream { stream, .. } => stream.local_addr()?,
            Socket::Datagram { socket, .. } => socket.local_addr()?,
        };
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Token;

    async fn settle() {
        time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn udp_listener_answers_last_sender() -> anyhow::Result<()> {
        let mut t = SocketTransport::new();
        let server = t
            .open(
                &Endpoint::parse("127.0.0.1:0", TransportMode::Connectionless)?,
                Role::Server,
            )
            .await?;
        let port = t.local_addr(server)?.port();
        let client = t
            .open(
                &Endpoint::new("127.0.0.1", port, TransportMode::Connectionless)?,
                Role::Client,
            )
            .await?;

        assert!(t.send(server, &Token::Pong.encode()).is_err());

        t.send(client, &Token::Ping.encode())?;
        settle().await;
        let readiness = t.poll_readable(&[server, client]);
        assert_eq!(readiness.ready, vec![server]);
        assert_eq!(t.recv(server).as_deref(), Some(&b"Ping\0"[..]));
        assert_eq!(t.recv(server), None);

        t.send(server, &Token::Pong.encode())?;
        settle().await;
        t.poll_readable(&[client]);
        assert_eq!(t.recv(client).as_deref(), Some(&b"Pong\0"[..]));
        Ok(())
    }

    #[tokio::test]
    async fn tcp_stream_is_framed_on_terminator() -> anyhow::Result<()> {
        let mut t = SocketTransport::new().with_poll_timeout(Duration::from_millis(500));
        let listener = t
            .open(
                &Endpoint::parse("127.0.0.1:0", TransportMode::ConnectionOriented)?,
                Role::Server,
            )
            .await?;
        let port = t.local_addr(listener)?.port();
        let client = t
            .open(
                &Endpoint::new("127.0.0.1", port, TransportMode::ConnectionOriented)?,
                Role::Client,
            )
            .await?;

        assert!(t.poll_connected(client).await?);
        let accepted = t.accept(listener).await?.expect("peer accepted");

        t.send(client, b"Ping\0Pong\0Pi")?;
        settle().await;
        let readiness = t.poll_readable(&[accepted]);
        assert_eq!(readiness.ready, vec![accepted]);
        assert_eq!(t.recv(accepted).as_deref(), Some(&b"Ping\0"[..]));
        assert_eq!(t.recv(accepted).as_deref(), Some(&b"Pong\0"[..]));
        assert_eq!(t.recv(accepted), None);
        Ok(())
    }

    async fn tcp_pair(t: &mut SocketTransport) -> anyhow::Result<(HandleId, HandleId)> {
        let listener = t
            .open(
                &Endpoint::parse("127.0.0.1:0", TransportMode::ConnectionOriented)?,
                Role::Server,
            )
            .await?;
        let port = t.local_addr(listener)?.port();
        let client = t
            .open(
                &Endpoint::new("127.0.0.1", port, TransportMode::ConnectionOriented)?,
                Role::Client,
            )
            .await?;
        assert!(t.poll_connected(client).await?);
        let accepted = t.accept(listener).await?.expect("peer accepted");
        Ok((client, accepted))
    }

    #[tokio::test]
    async fn truncated_token_does_not_desync_stream() -> anyhow::Result<()> {
        let mut t = SocketTransport::new().with_poll_timeout(Duration::from_millis(500));
        let (client, accepted) = tcp_pair(&mut t).await?;

        t.send(client, b"Pin\0")?;
        t.send(client, &Token::Ping.encode())?;
        t.send(client, &Token::Ping.encode())?;
        settle().await;
        t.poll_readable(&[accepted]);

        let first = t.recv(accepted).expect("truncated message");
        assert_eq!(Token::decode(&first), None);
        assert_eq!(t.recv(accepted).as_deref().and_then(Token::decode), Some(Token::Ping));
        assert_eq!(t.recv(accepted).as_deref().and_then(Token::decode), Some(Token::Ping));
        assert_eq!(t.recv(accepted), None);
        Ok(())
    }

    #[tokio::test]
    async fn unterminated_stream_input_is_bounded() -> anyhow::Result<()> {
        let mut t = SocketTransport::new().with_poll_timeout(Duration::from_millis(500));
        let (client, accepted) = tcp_pair(&mut t).await?;

        t.send(client, &[b'x'; MAX_DATAGRAM_LEN])?;
        t.send(client, &Token::Pong.encode())?;
        settle().await;
        t.poll_readable(&[accepted]);

        assert_eq!(t.recv(accepted).map(|m| m.len()), Some(MAX_DATAGRAM_LEN));
        assert_eq!(t.recv(accepted).as_deref(), Some(&b"Pong\0"[..]));
        assert_eq!(t.recv(accepted), None);
        Ok(())
    }

    #[test]
    fn frame_len_stops_at_first_nul() {
        assert_eq!(stream_frame_len(b"Ping\0Pong\0"), Some(5));
        assert_eq!(stream_frame_len(b"\0"), Some(1));
        assert_eq!(stream_frame_len(b"Pi"), None);
        assert_eq!(stream_frame_len(&[]), None);
    }

    #[tokio::test]
    async fn accept_without_peer_returns_none() -> anyhow::Result<()> {
        let mut t = SocketTransport::new();
        let listener = t
            .open(
                &Endpoint::parse("127.0.0.1:0", TransportMode::ConnectionOriented)?,
                Role::Server,
            )
            .await?;
        assert_eq!(t.accept(listener).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn second_listener_on_same_port_fails() -> anyhow::Result<()> {
        let mut t = SocketTransport::new();
        let first = t
            .open(
                &Endpoint::parse("127.0.0.1:0", TransportMode::Connectionless)?,
                Role::Server,
            )
            .await?;
        let port = t.local_addr(first)?.port();
        let err = t
            .open(
                &Endpoint::new("127.0.0.1", port, TransportMode::Connectionless)?,
                Role::Server,
            )
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("udp bind"));
        Ok(())
    }
}

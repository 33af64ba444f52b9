//! In-process transport.
//!
//! A headless stand-in for [`SocketTransport`](crate::socket::SocketTransport):
//! messages are pushed in by hand, sends are recorded, and accept/connect
//! completion is scripted. Useful for deterministic tests of anything that
//! drives a [`Transport`].

use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::net::{Endpoint, HandleId, Readiness, Role, Transport};

#[derive(Debug)]
struct Slot {
    role: Role,
    port: u16,
    inbound: VecDeque<Bytes>,
    /// Remaining `poll_connected` calls before a client reports connected.
    connect_polls: u32,
}

/// Scripted transport that never touches the network.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    next_id: u32,
    slots: HashMap<HandleId, Slot>,
    sent: Vec<(HandleId, Bytes)>,
    pending_accepts: u32,
    connect_polls: u32,
    fail_open: HashSet<u16>,
    fail_send: bool,
    fail_recv: HashSet<HandleId>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client handles report connected after `polls` calls to `poll_connected`.
    pub fn with_connect_delay(mut self, polls: u32) -> Self {
        self.connect_polls = polls;
        self
    }

    /// Makes `open` fail for endpoints on `port`.
    pub fn fail_open_on(mut self, port: u16) -> Self {
        self.fail_open.insert(port);
        self
    }

    /// Makes every send fail.
    pub fn fail_sends(&mut self, fail: bool) {
        self.fail_send = fail;
    }

    /// Makes the next poll of `handle` report a receive error.
    pub fn fail_next_recv(&mut self, handle: HandleId) {
        self.fail_recv.insert(handle);
    }

    /// Queues one peer for the next `accept`.
    pub fn queue_accept(&mut self) {
        self.pending_accepts += 1;
    }

    /// Delivers `payload` to `handle` as one message.
    pub fn push_inbound(&mut self, handle: HandleId, payload: impl Into<Bytes>) {
        if let Some(slot) = self.slots.get_mut(&handle) {
            slot.inbound.push_back(payload.into());
        }
    }

    /// Takes everything sent so far.
    pub fn take_sent(&mut self) -> Vec<(HandleId, Bytes)> {
        std::mem::take(&mut self.sent)
    }

    /// Handles opened or accepted so far, in creation order.
    pub fn handles(&self) -> Vec<HandleId> {
        let mut ids: Vec<_> = self.slots.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn role(&self, handle: HandleId) -> Option<Role> {
        self.slots.get(&handle).map(|s| s.role)
    }

    fn insert(&mut self, role: Role, port: u16, connect_polls: u32) -> HandleId {
        self.next_id += 1;
        let id = HandleId(self.next_id);
        self.slots.insert(
            id,
            Slot {
                role,
                port,
                inbound: VecDeque::new(),
                connect_polls,
            },
        );
        id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self, endpoint: &Endpoint, role: Role) -> anyhow::Result<HandleId> {
        if self.fail_open.contains(&endpoint.port()) {
            let err = io::Error::from(io::ErrorKind::AddrInUse);
            return Err(anyhow::Error::new(err).context("memory bind"));
        }
        let polls = match role {
            Role::Server => 0,
            Role::Client => self.connect_polls,
        };
        Ok(self.insert(role, endpoint.port(), polls))
    }

    async fn accept(&mut self, listener: HandleId) -> anyhow::Result<Option<HandleId>> {
        let Some(slot) = self.slots.get(&listener) else {
            anyhow::bail!("unknown handle {listener:?}");
        };
        if self.pending_accepts == 0 {
            return Ok(None);
        }
        self.pending_accepts -= 1;
        let port = slot.port;
        Ok(Some(self.insert(Role::Server, port, 0)))
    }

    async fn poll_connected(&mut self, handle: HandleId) -> anyhow::Result<bool> {
        let Some(slot) = self.slots.get_mut(&handle) else {
            anyhow::bail!("unknown handle {handle:?}");
        };
        if slot.connect_polls == 0 {
            return Ok(true);
        }
        slot.connect_polls -= 1;
        Ok(slot.connect_polls == 0)
    }

    fn poll_readable(&mut self, handles: &[HandleId]) -> Readiness {
        let mut readiness = Readiness::default();
        for &handle in handles {
            if self.fail_recv.remove(&handle) {
                readiness
                    .failed
                    .push((handle, io::Error::from(io::ErrorKind::ConnectionReset)));
            }
            if self
                .slots
                .get(&handle)
                .is_some_and(|slot| !slot.inbound.is_empty())
            {
                readiness.ready.push(handle);
            }
        }
        readiness
    }

    fn recv(&mut self, handle: HandleId) -> Option<Bytes> {
        self.slots.get_mut(&handle)?.inbound.pop_front()
    }

    fn send(&mut self, handle: HandleId, payload: &[u8]) -> io::Result<usize> {
        if self.fail_send {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if !self.slots.contains_key(&handle) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        self.sent.push((handle, Bytes::copy_from_slice(payload)));
        Ok(payload.len())
    }

    fn local_addr(&self, handle: HandleId) -> anyhow::Result<SocketAddr> {
        let slot = self
            .slots
            .get(&handle)
            .ok_or_else(|| anyhow::anyhow!("unknown handle {handle:?}"))?;
        Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), slot.port))
    }
}

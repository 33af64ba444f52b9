//! Heartbeat session.
//!
//! One owned aggregate per exchange: the transport, the listening and
//! initiating roles, the handles opened for them and the heartbeat. The host
//! loop calls [`Session::connect`] every frame until the link is up and
//! [`Session::tick`] afterwards. Nothing here blocks; setup failures are
//! logged and recorded, never propagated.

use std::{fmt, io, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    config::SessionConfig,
    heartbeat::{Heartbeat, HeartbeatState, Received},
    net::{Endpoint, HandleId, Role, Token, Transport, TransportMode, TOKEN_LEN},
};

/// Weight of the previous value in the smoothed round trip.
const RTT_SMOOTHING: f64 = 0.8;

/// Link lifecycle. One-way: there is no disconnect handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
}

/// A setup step that failed for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupFailure {
    pub role: Role,
    /// Full error chain, stage label first (e.g. `tcp bind: Address in use`).
    pub message: String,
    pub os_error: Option<i32>,
}

impl SetupFailure {
    fn new(role: Role, err: &anyhow::Error) -> Self {
        Self {
            role,
            message: format!("{err:#}"),
            os_error: err
                .downcast_ref::<io::Error>()
                .and_then(io::Error::raw_os_error),
        }
    }
}

impl fmt::Display for SetupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.role, self.message)?;
        if let Some(code) = self.os_error {
            write!(f, " (os error {code})")?;
        }
        Ok(())
    }
}

/// Running counters for one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatStats {
    pub pings_sent: u64,
    pub pongs_sent: u64,
    pub pings_received: u64,
    pub pongs_received: u64,
    /// Messages that were neither token.
    pub ignored: u64,
    /// Tokens received while another token was already owed.
    pub collisions: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
    /// Payload bytes handed to the transport, short writes included.
    pub bytes_sent: u64,
    /// Payload bytes received, ignored messages included.
    pub bytes_received: u64,
    /// Session time from the last Ping sent to the Pong that followed it.
    pub last_rtt: Option<Duration>,
    pub smoothed_rtt: Option<Duration>,
}

impl HeartbeatStats {
    fn record_rtt(&mut self, rtt: Duration) {
        self.last_rtt = Some(rtt);
        self.smoothed_rtt = Some(match self.smoothed_rtt {
            Some(prev) => prev.mul_f64(RTT_SMOOTHING) + rtt.mul_f64(1.0 - RTT_SMOOTHING),
            None => rtt,
        });
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Tokens decoded this tick, in arrival order.
    pub received: Vec<Token>,
    /// Messages dropped as unrecognized.
    pub ignored: usize,
    /// Token sent (or attempted) at a period boundary.
    pub sent: Option<Token>,
}

/// Ping/pong exchange over one transport.
pub struct Session<T: Transport> {
    transport: T,
    mode: TransportMode,
    listen: Option<Endpoint>,
    peer: Option<Endpoint>,

    listener: Option<HandleId>,
    initiator: Option<HandleId>,
    accepted: Option<HandleId>,
    initiator_ready: bool,
    /// Time since the initiator was last checked.
    connect_elapsed: Duration,

    link: LinkState,
    heartbeat: Heartbeat,
    stats: HeartbeatStats,
    failures: Vec<SetupFailure>,

    /// Sum of every `dt` seen by `tick`.
    clock: Duration,
    ping_sent_at: Option<Duration>,
}

impl<T: Transport> Session<T> {
    /// Builds a session from config. No sockets are created yet.
    pub fn new(cfg: &SessionConfig, transport: T) -> anyhow::Result<Self> {
        if cfg.period_ms == 0 {
            anyhow::bail!("heartbeat period must be non-zero");
        }
        let listen = cfg
            .listen_addr
            .as_deref()
            .map(|a| Endpoint::parse(a, cfg.mode))
            .transpose()?;
        let peer = cfg
            .peer_addr
            .as_deref()
            .map(|a| Endpoint::parse(a, cfg.mode))
            .transpose()?;
        if listen.is_none() && peer.is_none() {
            anyhow::bail!("session needs a listen address, a peer address, or both");
        }

        Ok(Self {
            transport,
            mode: cfg.mode,
            listen,
            peer,
            listener: None,
            initiator: None,
            accepted: None,
            initiator_ready: false,
            connect_elapsed: Duration::ZERO,
            link: LinkState::Disconnected,
            heartbeat: Heartbeat::new(cfg.period()),
            stats: HeartbeatStats::default(),
            failures: Vec::new(),
            clock: Duration::ZERO,
            ping_sent_at: None,
        })
    }

    /// Creates the sockets: listening role first, then the initiator.
    pub async fn open(&mut self) {
        if let Some(ep) = self.listen.clone() {
            match self.transport.open(&ep, Role::Server).await {
                Ok(h) => {
                    info!(endpoint = %ep, handle = ?h, "Listening role ready");
                    self.listener = Some(h);
                }
                Err(e) => self.record_failure(Role::Server, &e),
            }
        }
        if let Some(ep) = self.peer.clone() {
            match self.transport.open(&ep, Role::Client).await {
                Ok(h) => {
                    info!(endpoint = %ep, handle = ?h, "Initiating role ready");
                    self.initiator = Some(h);
                }
                Err(e) => self.record_failure(Role::Client, &e),
            }
        }
    }

    fn record_failure(&mut self, role: Role, err: &anyhow::Error) {
        let failure = SetupFailure::new(role, err);
        warn!(
            ?role,
            error = %failure.message,
            os_error = ?failure.os_error,
            "Socket setup failed"
        );
        self.failures.push(failure);
    }

    /// Drives the handshake. Safe to call every frame.
    pub async fn connect(&mut self, dt: Duration) {
        if self.link == LinkState::Connected {
            return;
        }
        match self.mode {
            TransportMode::Connectionless => {
                let listen_ok = self.listen.is_none() || self.listener.is_some();
                let peer_ok = self.peer.is_none() || self.initiator.is_some();
                if listen_ok && peer_ok {
                    self.initiator_ready = self.initiator.is_some();
                    self.establish();
                }
            }
            TransportMode::ConnectionOriented => {
                self.poll_listener().await;
                self.poll_initiator(dt).await;

                let listen_ok = self.listen.is_none() || self.accepted.is_some();
                let peer_ok = self.peer.is_none() || self.initiator_ready;
                if listen_ok && peer_ok {
                    self.establish();
                }
            }
        }
    }

    async fn poll_listener(&mut self) {
        let Some(listener) = self.listener else {
            return;
        };
        if self.accepted.is_some() {
            return;
        }
        match self.transport.accept(listener).await {
            Ok(Some(h)) => {
                info!(handle = ?h, "Peer accepted");
                self.accepted = Some(h);
            }
            Ok(None) => {}
            Err(e) => {
                let error = format!("{e:#}");
                warn!(%error, "Accept failed");
            }
        }
    }

    async fn poll_initiator(&mut self, dt: Duration) {
        let Some(initiator) = self.initiator else {
            return;
        };
        if self.initiator_ready {
            return;
        }
        // Checked at most once per period.
        self.connect_elapsed += dt;
        if self.connect_elapsed < self.heartbeat.period() {
            return;
        }
        self.connect_elapsed = Duration::ZERO;

        match self.transport.poll_connected(initiator).await {
            Ok(true) => {
                info!(handle = ?initiator, "Initiator connected");
                self.initiator_ready = true;
            }
            Ok(false) => debug!(handle = ?initiator, "Initiator still connecting"),
            Err(e) => {
                self.record_failure(Role::Client, &e);
                self.initiator = None;
            }
        }
    }

    fn establish(&mut self) {
        self.link = LinkState::Connected;
        self.heartbeat.reset_timer();
        if let (Some(h), true) = (self.initiator, self.initiator_ready) {
            self.heartbeat.seed_ping(h);
        }
        info!(
            mode = %self.mode,
            handles = ?self.poll_set(),
            "Session connected"
        );
    }

    /// Handles polled for input once connected.
    fn poll_set(&self) -> Vec<HandleId> {
        let listener = match self.mode {
            // The UDP listener receives directly; the TCP one only accepts.
            TransportMode::Connectionless => self.listener,
            TransportMode::ConnectionOriented => None,
        };
        [self.initiator, self.accepted, listener]
            .into_iter()
            .flatten()
            .collect()
    }

    /// The per-frame step: receive, then send on a period boundary.
    pub fn tick(&mut self, dt: Duration) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if self.link != LinkState::Connected {
            return outcome;
        }
        self.clock += dt;

        let handles = self.poll_set();
        let readiness = self.transport.poll_readable(&handles);
        if !readiness.ready.is_empty() {
            debug!(
                ready = readiness.ready.len(),
                "Socket(s) with data to be processed"
            );
        }
        for (handle, err) in readiness.failed {
            self.stats.recv_errors += 1;
            warn!(?handle, error = %err, "Receive failed");
        }

        for handle in readiness.ready {
            while let Some(msg) = self.transport.recv(handle) {
                self.stats.bytes_received += msg.len() as u64;
                match Token::decode(&msg) {
                    Some(token) => {
                        self.on_token(token, handle);
                        outcome.received.push(token);
                    }
                    None => {
                        self.stats.ignored += 1;
                        outcome.ignored += 1;
                        debug!(?handle, len = msg.len(), "Ignoring unrecognized message");
                    }
                }
            }
        }

        if let Some((token, via)) = self.heartbeat.advance(dt) {
            self.send_token(token, via);
            outcome.sent = Some(token);
        }
        outcome
    }

    fn on_token(&mut self, token: Token, from: HandleId) {
        debug!(?from, %token, "Token received");
        match token {
            Token::Ping => self.stats.pings_received += 1,
            Token::Pong => {
                self.stats.pongs_received += 1;
                if let Some(sent_at) = self.ping_sent_at.take() {
                    self.stats.record_rtt(self.clock - sent_at);
                }
            }
        }
        if let Received::Collision { .. } = self.heartbeat.on_token(token, from) {
            self.stats.collisions += 1;
        }
    }

    fn send_token(&mut self, token: Token, via: HandleId) {
        let written = self.transport.send(via, &token.encode());
        if let Ok(n) = written {
            self.stats.bytes_sent += n as u64;
        }
        match written {
            Ok(n) if n == TOKEN_LEN => {
                debug!(?via, %token, "Token sent");
                match token {
                    Token::Ping => {
                        self.stats.pings_sent += 1;
                        self.ping_sent_at = Some(self.clock);
                    }
                    Token::Pong => self.stats.pongs_sent += 1,
                }
            }
            Ok(n) => {
                self.stats.send_errors += 1;
                warn!(?via, %token, written = n, "Short write");
            }
            Err(e) => {
                self.stats.send_errors += 1;
                warn!(?via, %token, error = %e, "Send failed");
            }
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub fn is_connected(&self) -> bool {
        self.link == LinkState::Connected
    }

    pub fn heartbeat_state(&self) -> HeartbeatState {
        self.heartbeat.state()
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn stats(&self) -> &HeartbeatStats {
        &self.stats
    }

    pub fn setup_failures(&self) -> &[SetupFailure] {
        &self.failures
    }

    pub fn listen_endpoint(&self) -> Option<&Endpoint> {
        self.listen.as_ref()
    }

    pub fn peer_endpoint(&self) -> Option<&Endpoint> {
        self.peer.as_ref()
    }

    /// Handle of the listening role, if it opened.
    pub fn listener(&self) -> Option<HandleId> {
        self.listener
    }

    /// Handle of the initiating role, if it opened.
    pub fn initiator(&self) -> Option<HandleId> {
        self.initiator
    }

    /// Handle of the accepted TCP peer.
    pub fn accepted(&self) -> Option<HandleId> {
        self.accepted
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

//! Host loop.
//!
//! Stands in for the render loop that used to own the session: every frame
//! it calls `connect` until the link is up, then `tick`, always with the
//! same fixed timestep.
//!
//! Console commands:
//! - `status` - link state, heartbeat state and counters
//! - `quit`   - stop the loop

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::Context;
use pingpong_shared::{
    config::SessionConfig,
    net::{Transport, TransportMode},
    session::{Session, TickOutcome},
    socket::SocketTransport,
};
use tokio::{
    net::{TcpListener, UdpSocket},
    time::Instant,
};
use tracing::{debug, info};

/// Fixed-timestep driver owning one session.
pub struct HostLoop<T: Transport> {
    session: Session<T>,
    frame: Duration,
    frames: u64,
    quit: bool,
}

impl<T: Transport> HostLoop<T> {
    pub fn new(session: Session<T>, frame: Duration) -> Self {
        Self {
            session,
            frame,
            frames: 0,
            quit: false,
        }
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<T> {
        &mut self.session
    }

    /// Frames run so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame
    }

    pub fn quit_requested(&self) -> bool {
        self.quit
    }

    /// Runs one frame. Returns the tick outcome once connected.
    pub async fn frame(&mut self) -> Option<TickOutcome> {
        self.frames += 1;
        if !self.session.is_connected() {
            self.session.connect(self.frame).await;
            if self.session.is_connected() {
                info!(frames = self.frames, "Link up");
            }
            return None;
        }
        let outcome = self.session.tick(self.frame);
        if let Some(token) = outcome.sent {
            debug!(frame = self.frames, %token, "Heartbeat");
        }
        Some(outcome)
    }

    /// Runs `frames` frames at the fixed rate.
    pub async fn run_for_frames(&mut self, frames: u64) -> anyhow::Result<()> {
        let mut next = Instant::now();
        for _ in 0..frames {
            next += self.frame;
            self.frame().await;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(cmd) = tokens.first() else {
            return Vec::new();
        };

        match *cmd {
            "status" => self.status_lines(),
            "quit" | "exit" => {
                info!("Host shutting down");
                self.quit = true;
                vec!["Bye.".to_string()]
            }
            "help" => vec![
                "status  - show session state".to_string(),
                "quit    - exit".to_string(),
            ],
            other => vec![format!("Unknown command: {other}")],
        }
    }

    fn status_lines(&self) -> Vec<String> {
        let s = &self.session;
        let stats = s.stats();
        let mut out = vec![
            format!("Mode: {}", s.mode()),
            format!("Link: {:?}", s.link_state()),
            format!("Heartbeat: {:?}", s.heartbeat_state()),
            format!("Frames: {}", self.frames),
        ];
        if let Some(ep) = s.listen_endpoint() {
            out.push(format!("Listen: {ep}"));
        }
        if let Some(ep) = s.peer_endpoint() {
            out.push(format!("Peer: {ep}"));
        }
        out.push(format!(
            "Sent: {} ping / {} pong, received: {} ping / {} pong",
            stats.pings_sent, stats.pongs_sent, stats.pings_received, stats.pongs_received
        ));
        out.push(format!(
            "Ignored: {}, collisions: {}, send errors: {}, recv errors: {}",
            stats.ignored, stats.collisions, stats.send_errors, stats.recv_errors
        ));
        out.push(format!(
            "Bytes: {} sent, {} received",
            stats.bytes_sent, stats.bytes_received
        ));
        if let Some(rtt) = stats.smoothed_rtt {
            out.push(format!("RTT: {} ms", rtt.as_millis()));
        }
        for failure in s.setup_failures() {
            out.push(format!("Setup failure: {failure}"));
        }
        out
    }
}

/// Grabs a free loopback port for `mode` by binding port 0 and letting go.
pub async fn reserve_port(mode: TransportMode) -> anyhow::Result<u16> {
    let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let port = match mode {
        TransportMode::ConnectionOriented => TcpListener::bind(any)
            .await
            .context("reserve tcp port")?
            .local_addr()?
            .port(),
        TransportMode::Connectionless => UdpSocket::bind(any)
            .await
            .context("reserve udp port")?
            .local_addr()?
            .port(),
    };
    Ok(port)
}

/// Helper for tests: both roles on one free loopback port, sockets opened.
pub async fn bind_loopback(
    mode: TransportMode,
    period: Duration,
    frame_hz: u32,
) -> anyhow::Result<(HostLoop<SocketTransport>, SessionConfig)> {
    let port = reserve_port(mode).await?;
    let addr = format!("{}:{}", Ipv4Addr::LOCALHOST, port);
    let cfg = SessionConfig {
        mode,
        listen_addr: Some(addr.clone()),
        peer_addr: Some(addr),
        period_ms: period.as_millis() as u64,
        frame_hz,
    };

    let mut session = Session::new(&cfg, SocketTransport::new()).context("create session")?;
    session.open().await;
    Ok((HostLoop::new(session, cfg.frame_interval()), cfg))
}

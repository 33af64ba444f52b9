//! Standalone host binary.
//!
//! Usage:
//!   cargo run -p pingpong_host -- [--config session.json] [--mode tcp|udp]
//!       [--listen 127.0.0.1:4950] [--peer 127.0.0.1:4950] [--no-listen] [--no-peer]
//!       [--period-ms 1000] [--frame-hz 60] [--frames N]
//!
//! With both roles (the default) one process plays server and client and
//! bounces Ping/Pong through the loopback. Run with `--no-peer` in one
//! process and `--no-listen` in another to split the roles.
//!
//! Console commands:
//!   status - Show session status
//!   quit   - Exit

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use pingpong_host::HostLoop;
use pingpong_shared::{
    config::SessionConfig, net::TransportMode, session::Session, socket::SocketTransport,
};
use tokio::sync::mpsc;
use tracing::info;

struct Args {
    cfg: SessionConfig,
    /// Stop after this many frames.
    frames: Option<u64>,
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {

    // The config file is the base; flags override it wherever they appear.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = &args[i + 1];
            let text = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
            SessionConfig::from_json_str(&text).with_context(|| format!("parse {path}"))?
        }
        _ => SessionConfig::default(),
    };
    let mut frames = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                i += 2;
            }
            "--mode" if i + 1 < args.len() => {
                cfg.mode = args[i + 1].parse::<TransportMode>().context("--mode")?;
                i += 2;
            }
            "--listen" if i + 1 < args.len() => {
                cfg.listen_addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--peer" if i + 1 < args.len() => {
                cfg.peer_addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--no-listen" => {
                cfg.listen_addr = None;
                i += 1;
            }
            "--no-peer" => {
                cfg.peer_addr = None;
                i += 1;
            }
            "--period-ms" if i + 1 < args.len() => {
                cfg.period_ms = args[i + 1].parse().unwrap_or(1000);
                i += 2;
            }
            "--frame-hz" if i + 1 < args.len() => {
                cfg.frame_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            "--frames" if i + 1 < args.len() => {
                frames = Some(
                    args[i + 1]
                        .parse::<u64>()
                        .with_context(|| format!("--frames {:?}", args[i + 1]))?,
                );
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(Args { cfg, frames })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let Args { cfg, frames } = parse_args(&args)?;
    info!(
        mode = %cfg.mode,
        listen = ?cfg.listen_addr,
        peer = ?cfg.peer_addr,
        period_ms = cfg.period_ms,
        frame_hz = cfg.frame_hz,
        "Starting host"
    );

    let mut session = Session::new(&cfg, SocketTransport::new()).context("create session")?;
    session.open().await;
    let mut host = HostLoop::new(session, cfg.frame_interval());

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Host ready. Type 'status' for info, 'quit' to exit.");
    println!();

    // Main frame loop.
    let frame = host.frame_interval();
    let mut next_frame = tokio::time::Instant::now();

    loop {
        while let Ok(line) = console_rx.try_recv() {
            for out in host.exec_console(&line) {
                println!("{}", out);
            }
        }
        if host.quit_requested() {
            break;
        }
        if frames.is_some_and(|max| host.frames() >= max) {
            break;
        }

        host.frame().await;

        next_frame += frame;
        tokio::time::sleep_until(next_frame).await;
    }

    for out in host.exec_console("status") {
        println!("{}", out);
    }
    Ok(())
}

//! `pingpong_host`
//!
//! Headless host for a heartbeat session:
//! - Fixed timestep frame loop (`connect` until linked, then `tick`)
//! - Console commands (`status`, `quit`)
//! - Loopback helpers for tests
//!
//! Networking model:
//! - TCP: accept + connect handshake, then tokens over the streams
//! - UDP: ready immediately, tokens over datagrams

pub mod host;

pub use host::HostLoop;

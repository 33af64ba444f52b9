//! `pingpong_shared`
//!
//! Heartbeat session library shared by the host binary and the tests.
//!
//! Design goals:
//! - One owned [`session::Session`] per exchange, no process-wide state.
//! - Non-blocking only: every socket call is a `try_*` or a zero-timeout poll.
//! - Sockets behind the [`net::Transport`] trait so the state machine can be
//!   driven headless.
//! - No `unsafe`.

pub mod config;
pub mod heartbeat;
pub mod memory;
pub mod net;
pub mod session;
pub mod socket;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::heartbeat::{Heartbeat, HeartbeatState};
    pub use crate::memory::MemoryTransport;
    pub use crate::net::*;
    pub use crate::session::*;
    pub use crate::socket::SocketTransport;
}

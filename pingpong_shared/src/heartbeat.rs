//! Ping/pong heartbeat state machine.
//!
//! Pure bookkeeping: no sockets, no clocks. The session feeds it received
//! tokens and frame deltas and sends whatever [`Heartbeat::advance`] returns.
//!
//! Only one token can be owed at a time. When a second obligation shows up,
//! the owed Ping always wins over a Pong reply.

use std::time::Duration;

use tracing::warn;

use crate::net::{HandleId, Token};

/// Default heartbeat period.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

/// What the heartbeat owes its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// Nothing owed.
    Idle,
    /// A Ping goes out at the next boundary.
    AwaitingPing,
    /// A Pong reply goes out at the next boundary.
    AwaitingPong,
}

impl HeartbeatState {
    fn owed(self) -> Option<Token> {
        match self {
            HeartbeatState::Idle => None,
            HeartbeatState::AwaitingPing => Some(Token::Ping),
            HeartbeatState::AwaitingPong => Some(Token::Pong),
        }
    }

    fn owing(token: Token) -> Self {
        match token {
            Token::Ping => HeartbeatState::AwaitingPing,
            Token::Pong => HeartbeatState::AwaitingPong,
        }
    }
}

/// Effect of feeding one received token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// The reply is now owed.
    Owed(Token),
    /// Another token was already owed; the tie-break kept `kept`.
    Collision { kept: Token, dropped: Token },
}

/// Heartbeat timer plus the single owed token.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    state: HeartbeatState,
    reply_via: Option<HandleId>,
    elapsed: Duration,
    period: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(DEFAULT_PERIOD)
    }
}

impl Heartbeat {
    pub fn new(period: Duration) -> Self {
        Self {
            state: HeartbeatState::Idle,
            reply_via: None,
            elapsed: Duration::ZERO,
            period,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Time accumulated since the last boundary.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Handle the owed token will be sent on.
    pub fn reply_via(&self) -> Option<HandleId> {
        self.reply_via
    }

    /// Restarts the period without touching the owed token.
    pub fn reset_timer(&mut self) {
        self.elapsed = Duration::ZERO;
    }

    /// Owes the opening Ping, sent through `via`.
    pub fn seed_ping(&mut self, via: HandleId) {
        self.state = HeartbeatState::AwaitingPing;
        self.reply_via = Some(via);
    }

    /// Records a token received on `from`; the reply is owed back through it.
    pub fn on_token(&mut self, token: Token, from: HandleId) -> Received {
        let wanted = token.reply();
        match self.state.owed() {
            Some(current) if current != wanted => {
                // Ping outranks Pong whichever arrived first.
                let (kept, dropped) = if current == Token::Ping {
                    (Token::Ping, wanted)
                } else {
                    self.state = HeartbeatState::AwaitingPing;
                    self.reply_via = Some(from);
                    (Token::Ping, current)
                };
                warn!(
                    received = %token,
                    kept = %kept,
                    dropped = %dropped,
                    "Heartbeat collision: two tokens owed"
                );
                Received::Collision { kept, dropped }
            }
            _ => {
                self.state = HeartbeatState::owing(wanted);
                self.reply_via = Some(from);
                Received::Owed(wanted)
            }
        }
    }

    /// Advances the timer. On a period boundary the accumulator resets and
    /// the owed token, if any, is returned together with its route.
    pub fn advance(&mut self, dt: Duration) -> Option<(Token, HandleId)> {
        self.elapsed += dt;
        if self.elapsed < self.period {
            return None;
        }
        self.elapsed = Duration::ZERO;

        let token = self.state.owed()?;
        let via = self.reply_via.take()?;
        self.state = HeartbeatState::Idle;
        Some((token, via))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: HandleId = HandleId(1);

    #[test]
    fn first_ping_after_two_half_periods() {
        let mut hb = Heartbeat::new(Duration::from_secs(1));
        hb.seed_ping(H);
        assert_eq!(hb.advance(Duration::from_millis(500)), None);
        assert_eq!(hb.advance(Duration::from_millis(500)), Some((Token::Ping, H)));
        assert_eq!(hb.state(), HeartbeatState::Idle);
        assert_eq!(hb.elapsed(), Duration::ZERO);
    }

    #[test]
    fn boundary_resets_even_when_idle() {
        let mut hb = Heartbeat::new(Duration::from_secs(1));
        assert_eq!(hb.advance(Duration::from_millis(1500)), None);
        assert_eq!(hb.elapsed(), Duration::ZERO);

        hb.on_token(Token::Ping, H);
        assert_eq!(hb.advance(Duration::from_millis(999)), None);
        assert_eq!(hb.advance(Duration::from_millis(1)), Some((Token::Pong, H)));
    }

    #[test]
    fn at_most_one_send_per_period() {
        let mut hb = Heartbeat::new(Duration::from_millis(100));
        let mut sent = 0;
        for step in 0..100 {
            if step % 3 == 0 {
                hb.on_token(Token::Pong, H);
            }
            if hb.advance(Duration::from_millis(10)).is_some() {
                sent += 1;
            }
        }
        assert_eq!(sent, 10);
    }

    #[test]
    fn reply_goes_back_through_receiving_handle() {
        let mut hb = Heartbeat::default();
        assert_eq!(hb.on_token(Token::Pong, HandleId(7)), Received::Owed(Token::Ping));
        assert_eq!(hb.state(), HeartbeatState::AwaitingPing);
        assert_eq!(hb.reply_via(), Some(HandleId(7)));
    }

    #[test]
    fn repeated_token_keeps_single_obligation() {
        let mut hb = Heartbeat::default();
        hb.on_token(Token::Ping, H);
        assert_eq!(hb.on_token(Token::Ping, HandleId(2)), Received::Owed(Token::Pong));
        assert_eq!(hb.state(), HeartbeatState::AwaitingPong);
        assert_eq!(hb.reply_via(), Some(HandleId(2)));
    }

    #[test]
    fn owed_ping_survives_incoming_ping() {
        let mut hb = Heartbeat::default();
        hb.seed_ping(H);
        let res = hb.on_token(Token::Ping, HandleId(2));
        assert_eq!(
            res,
            Received::Collision {
                kept: Token::Ping,
                dropped: Token::Pong
            }
        );
        assert_eq!(hb.state(), HeartbeatState::AwaitingPing);
        assert_eq!(hb.reply_via(), Some(H));
    }

    #[test]
    fn incoming_pong_upgrades_owed_pong_to_ping() {
        let mut hb = Heartbeat::default();
        hb.on_token(Token::Ping, H);
        let res = hb.on_token(Token::Pong, HandleId(2));
        assert_eq!(
            res,
            Received::Collision {
                kept: Token::Ping,
                dropped: Token::Pong
            }
        );
        assert_eq!(hb.state(), HeartbeatState::AwaitingPing);
        assert_eq!(hb.reply_via(), Some(HandleId(2)));
    }
}

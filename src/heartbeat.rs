//! Heartbeat supervision: periodic keep-alives, missed-response counting and
//! idle-connection detection.
//!
//! The supervisor is a pure counter state machine; the connection driver owns
//! the actual timers and calls in when a reader- or writer-idle countdown
//! expires. Heartbeat frames are protocol-internal and never reach the
//! application consumer.

use log::{debug, warn};
use std::time::Duration;

/// De-facto wire convention for the heartbeat body.
pub const HEARTBEAT_PAYLOAD: &[u8] = br#"{"dps":""}"#;

/// Idle thresholds and the missed-heartbeat budget.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatThresholds {
    /// No inbound traffic at all for this long is fatal.
    pub reader_idle: Duration,
    /// Outbound silence for this long triggers a heartbeat probe.
    pub writer_idle: Duration,
    /// Heartbeats allowed to go unanswered before the connection is dead.
    pub max_missed: u32,
}

impl Default for HeartbeatThresholds {
    fn default() -> Self {
        Self {
            reader_idle: Duration::from_secs(30),
            writer_idle: Duration::from_secs(7),
            max_missed: 3,
        }
    }
}

/// What the driver must do after a timer expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Emit a `HeartBeat` frame and restart the writer-idle countdown.
    SendHeartbeat,
    /// The connection is unrecoverable; tear down the transport.
    ConnectionDead,
}

/// Tracks missed heartbeat replies for one connection.
pub struct HeartbeatSupervisor {
    thresholds: HeartbeatThresholds,
    missed: u32,
    dead: bool,
}

impl HeartbeatSupervisor {
    pub fn new(thresholds: HeartbeatThresholds) -> Self {
        Self {
            thresholds,
            missed: 0,
            dead: false,
        }
    }

    pub fn thresholds(&self) -> HeartbeatThresholds {
        self.thresholds
    }

    pub fn missed_count(&self) -> u32 {
        self.missed
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Writer-idle countdown expired without an intervening heartbeat reply.
    pub fn on_writer_idle(&mut self) -> HeartbeatAction {
        if self.dead {
            return HeartbeatAction::ConnectionDead;
        }
        self.missed += 1;
        if self.missed > self.thresholds.max_missed {
            warn!(
                "no heartbeat reply after {} probes, declaring connection dead",
                self.thresholds.max_missed
            );
            self.dead = true;
            HeartbeatAction::ConnectionDead
        } else {
            debug!("heartbeat probe {}/{}", self.missed, self.thresholds.max_missed);
            HeartbeatAction::SendHeartbeat
        }
    }

    /// Reader-idle countdown expired: nothing received within the read
    /// timeout. Fatal regardless of the missed-heartbeat count.
    pub fn on_reader_idle(&mut self) -> HeartbeatAction {
        if !self.dead {
            warn!("reader idle timeout, declaring connection dead");
            self.dead = true;
        }
        HeartbeatAction::ConnectionDead
    }

    /// A `HeartBeat`-typed frame arrived. Resets the miss counter; the caller
    /// must not forward the frame upward.
    pub fn on_heartbeat_reply(&mut self) {
        if self.missed > 0 {
            debug!("heartbeat reply received, resetting miss counter");
        }
        self.missed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(max_missed: u32) -> HeartbeatSupervisor {
        HeartbeatSupervisor::new(HeartbeatThresholds {
            reader_idle: Duration::from_secs(30),
            writer_idle: Duration::from_secs(7),
            max_missed,
        })
    }

    #[test]
    fn dead_fires_exactly_once_after_budget_exhausted() {
        let max = 3;
        let mut hb = supervisor(max);
        let mut dead_events = 0;
        for tick in 1..=max + 1 {
            match hb.on_writer_idle() {
                HeartbeatAction::SendHeartbeat => {
                    assert!(tick <= max, "probe sent after budget exhausted");
                }
                HeartbeatAction::ConnectionDead => {
                    assert_eq!(tick, max + 1, "dead fired early at tick {}", tick);
                    dead_events += 1;
                }
            }
        }
        assert_eq!(dead_events, 1);
        assert!(hb.is_dead());
    }

    #[test]
    fn reply_resets_the_miss_counter() {
        let mut hb = supervisor(2);
        assert_eq!(hb.on_writer_idle(), HeartbeatAction::SendHeartbeat);
        assert_eq!(hb.on_writer_idle(), HeartbeatAction::SendHeartbeat);
        hb.on_heartbeat_reply();
        assert_eq!(hb.missed_count(), 0);
        // Full budget available again after the reply.
        assert_eq!(hb.on_writer_idle(), HeartbeatAction::SendHeartbeat);
        assert_eq!(hb.on_writer_idle(), HeartbeatAction::SendHeartbeat);
        assert_eq!(hb.on_writer_idle(), HeartbeatAction::ConnectionDead);
    }

    #[test]
    fn reader_idle_is_unconditionally_fatal() {
        let mut hb = supervisor(5);
        assert_eq!(hb.missed_count(), 0);
        assert_eq!(hb.on_reader_idle(), HeartbeatAction::ConnectionDead);
        assert!(hb.is_dead());
        // Once dead, writer ticks stay dead.
        assert_eq!(hb.on_writer_idle(), HeartbeatAction::ConnectionDead);
    }

    #[test]
    fn heartbeat_payload_is_wire_convention() {
        let v: serde_json::Value = serde_json::from_slice(HEARTBEAT_PAYLOAD).unwrap();
        assert_eq!(v["dps"], "");
    }
}

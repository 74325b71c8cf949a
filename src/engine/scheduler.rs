//! One monotonic scheduler for the five gossip timers.
//!
//! The state loop computes the minimum deadline, waits at most that long for
//! traffic, then fires whatever came due. A single scheduler keeps shutdown
//! trivial (the loop exits, nothing else ticks) and lets tests drive time
//! with explicit instants.

use std::time::{Duration, Instant};

use crate::config::TimerConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Unicast heartbeat (with state hash) to live peers.
    Heartbeat,
    /// Resend or drop pending un-ACKed deltas.
    RetryAck,
    /// Unicast state hash to known peers.
    StateHash,
    /// Send full state to known peers.
    FullSync,
    /// Drain the persistent broadcast retry queue.
    RetryQueue,
}

#[derive(Debug)]
struct Slot {
    kind: TimerKind,
    period: Duration,
    next: Instant,
}

#[derive(Debug)]
pub struct Timers {
    slots: Vec<Slot>,
}

impl Timers {
    pub fn new(config: &TimerConfig, now: Instant) -> Self {
        let slot = |kind, ms: u64| {
            let period = Duration::from_millis(ms.max(1));
            Slot {
                kind,
                period,
                next: now + period,
            }
        };
        Timers {
            slots: vec![
                slot(TimerKind::Heartbeat, config.heartbeat_ms),
                slot(TimerKind::RetryAck, config.retry_ack_ms),
                slot(TimerKind::StateHash, config.state_hash_ms),
                slot(TimerKind::FullSync, config.full_sync_ms),
                slot(TimerKind::RetryQueue, config.retry_queue_ms),
            ],
        }
    }

    /// Time until the earliest deadline; zero if one is already due.
    pub fn until_next(&self, now: Instant) -> Duration {
        self.slots
            .iter()
            .map(|slot| slot.next.saturating_duration_since(now))
            .min()
            .unwrap_or(Duration::ZERO)
    }

    /// Fire and reschedule every timer whose deadline has passed.
    pub fn due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut fired = Vec::new();
        for slot in &mut self.slots {
            if slot.next <= now {
                slot.next = now + slot.period;
                fired.push(slot.kind);
            }
        }
        fired
    }
}

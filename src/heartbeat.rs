//! Two-phase liveness watchdog.
//!
//! Phase 1 waits `interval` for inbound traffic. When it elapses quietly a probe is due and
//! phase 2 waits `ack_timeout` for the acknowledgment. Any inbound frame, the acknowledgment
//! included, puts the watchdog back into phase 1. An unanswered phase 2 expires the channel.
//!
//! The watchdog owns no timers: the connection loop sleeps until [`Watchdog::deadline`] and
//! then calls [`Watchdog::poll`].

use std::time::Duration;

use tokio::time::Instant;

use crate::config::HeartbeatConfig;

/// What the connection loop has to do after [`Watchdog::poll`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Send the probe on the regular send path
    SendProbe,
    /// No acknowledgment arrived in time; force-close the channel
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Idle { deadline: Instant },
    AwaitingAck { deadline: Instant },
}

#[derive(Debug)]
pub struct Watchdog {
    enabled: bool,
    interval: Duration,
    ack_timeout: Duration,
    // A single phase keeps at most one of the two timers armed.
    phase: Phase,
}

impl Watchdog {
    #[must_use]
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            enabled: config.enabled,
            interval: config.interval,
            ack_timeout: config.ack_timeout,
            phase: Phase::Stopped,
        }
    }

    /// Arm phase 1. Does nothing when heartbeats are disabled.
    pub fn start(&mut self, now: Instant) {
        if self.enabled {
            self.phase = Phase::Idle {
                deadline: now + self.interval,
            };
        }
    }

    pub fn stop(&mut self) {
        self.phase = Phase::Stopped;
    }

    /// Inbound traffic (or the acknowledgment) proves the channel is alive.
    pub fn record_activity(&mut self, now: Instant) {
        if self.is_running() {
            self.phase = Phase::Idle {
                deadline: now + self.interval,
            };
        }
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Stopped => None,
            Phase::Idle { deadline } | Phase::AwaitingAck { deadline } => Some(deadline),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase != Phase::Stopped
    }

    #[must_use]
    pub fn is_awaiting_ack(&self) -> bool {
        matches!(self.phase, Phase::AwaitingAck { .. })
    }

    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Advance the watchdog if its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<WatchdogAction> {
        match self.phase {
            Phase::Idle { deadline } if now >= deadline => {
                self.phase = Phase::AwaitingAck {
                    deadline: now + self.ack_timeout,
                };
                Some(WatchdogAction::SendProbe)
            }
            Phase::AwaitingAck { deadline } if now >= deadline => {
                self.phase = Phase::Stopped;
                Some(WatchdogAction::Expired)
            }
            _ => None,
        }
    }
}

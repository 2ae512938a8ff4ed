//! Idle standby and wake-up policy

use crate::config::ActiveMode;
use crate::latency::ResponseTimer;
use crate::queue::TurnQueue;
use crate::session::SessionStatus;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Single-flight flag for the connect handshake
#[derive(Debug, Default)]
pub struct HandshakeGuard {
    started_at: Option<Instant>,
}

impl HandshakeGuard {
    /// Claim the handshake. False if one is already running.
    pub fn try_begin(&mut self, now: Instant) -> bool {
        if self.started_at.is_some() {
            return false;
        }
        self.started_at = Some(now);
        true
    }

    pub fn finish(&mut self) {
        self.started_at = None;
    }

    pub fn is_in_flight(&self) -> bool {
        self.started_at.is_some()
    }
}

/// What the engine knows about activity at the time of a monitor tick
#[derive(Debug, Clone, Copy)]
pub struct ActivitySnapshot {
    pub mode: ActiveMode,
    pub status: SessionStatus,
    pub pending_turns: usize,
    pub in_flight: usize,
    /// Hybrid buffer, connecting buffer or local playback in use
    pub buffering: bool,
    /// Remote peer still inside its predicted busy window, or streaming
    pub remote_busy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorDecision {
    Stay,
    /// Idle long enough: close the session into standby
    Standby,
    /// Idle, nothing pending, but in-flight turns outlived their busy
    /// window: treat them as dropped by the peer
    ExpireUnconfirmed,
}

/// Decides when to suspend the transport and when to wake it
#[derive(Debug)]
pub struct BackgroundMonitor {
    auto_sleep: Duration,
    last_speech: Instant,
    handshake: HandshakeGuard,
}

impl BackgroundMonitor {
    pub fn new(auto_sleep: Duration, now: Instant) -> Self {
        Self {
            auto_sleep,
            last_speech: now,
            handshake: HandshakeGuard::default(),
        }
    }

    /// Speech was detected; restarts the idle countdown
    pub fn note_speech(&mut self, now: Instant) {
        self.last_speech = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_speech)
    }

    /// Time left before standby
    pub fn countdown(&self, now: Instant) -> Duration {
        self.auto_sleep.saturating_sub(self.idle_for(now))
    }

    pub fn evaluate(&self, snapshot: &ActivitySnapshot, now: Instant) -> MonitorDecision {
        if snapshot.mode == ActiveMode::Off
            || snapshot.status != SessionStatus::Connected
            || self.handshake.is_in_flight()
            || snapshot.buffering
            || self.idle_for(now) < self.auto_sleep
        {
            return MonitorDecision::Stay;
        }
        if snapshot.pending_turns > 0 {
            return MonitorDecision::Stay;
        }
        if snapshot.in_flight > 0 {
            return if snapshot.remote_busy {
                MonitorDecision::Stay
            } else {
                MonitorDecision::ExpireUnconfirmed
            };
        }
        MonitorDecision::Standby
    }

    /// Speech onset while dormant: claim the handshake and report whether to wake
    pub fn try_wake(&mut self, mode: ActiveMode, status: SessionStatus, now: Instant) -> bool {
        if mode == ActiveMode::Off || !status.is_dormant() {
            return false;
        }
        if !self.handshake.try_begin(now) {
            debug!("Wake suppressed, handshake already in flight");
            return false;
        }
        info!(%status, "🌅 Activity detected while dormant, waking up");
        true
    }

    /// Clear queue state accumulated while the transport was unreachable
    pub fn manual_flush(&self, queue: &mut TurnQueue, timer: &mut ResponseTimer) -> usize {
        let cleared = queue.clear();
        timer.clear_pending();
        if cleared > 0 {
            warn!(cleared, "Cleared turns stranded while the transport was unreachable");
        }
        cleared
    }

    pub fn handshake(&self) -> &HandshakeGuard {
        &self.handshake
    }

    pub fn handshake_mut(&mut self) -> &mut HandshakeGuard {
        &mut self.handshake
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::TurnPackage;
    use chrono::Utc;

    const SLEEP: Duration = Duration::from_secs(120);

    fn snapshot() -> ActivitySnapshot {
        ActivitySnapshot {
            mode: ActiveMode::Translate,
            status: SessionStatus::Connected,
            pending_turns: 0,
            in_flight: 0,
            buffering: false,
            remote_busy: false,
        }
    }

    #[test]
    fn test_standby_after_idle_timeout() {
        let start = Instant::now();
        let monitor = BackgroundMonitor::new(SLEEP, start);
        assert_eq!(monitor.evaluate(&snapshot(), start + Duration::from_secs(60)), MonitorDecision::Stay);
        assert_eq!(monitor.evaluate(&snapshot(), start + SLEEP), MonitorDecision::Standby);
        assert_eq!(monitor.countdown(start + Duration::from_secs(100)), Duration::from_secs(20));
    }

    #[test]
    fn test_outstanding_work_blocks_standby() {
        let start = Instant::now();
        let monitor = BackgroundMonitor::new(SLEEP, start);
        let later = start + SLEEP * 2;

        let pending = ActivitySnapshot { pending_turns: 1, ..snapshot() };
        assert_eq!(monitor.evaluate(&pending, later), MonitorDecision::Stay);

        let buffering = ActivitySnapshot { buffering: true, ..snapshot() };
        assert_eq!(monitor.evaluate(&buffering, later), MonitorDecision::Stay);

        let busy = ActivitySnapshot { in_flight: 2, remote_busy: true, ..snapshot() };
        assert_eq!(monitor.evaluate(&busy, later), MonitorDecision::Stay);

        let dropped = ActivitySnapshot { in_flight: 2, ..snapshot() };
        assert_eq!(monitor.evaluate(&dropped, later), MonitorDecision::ExpireUnconfirmed);

        let off = ActivitySnapshot { mode: ActiveMode::Off, ..snapshot() };
        assert_eq!(monitor.evaluate(&off, later), MonitorDecision::Stay);
    }

    #[test]
    fn test_speech_restarts_countdown() {
        let start = Instant::now();
        let mut monitor = BackgroundMonitor::new(SLEEP, start);
        monitor.note_speech(start + Duration::from_secs(100));
        assert_eq!(monitor.evaluate(&snapshot(), start + SLEEP), MonitorDecision::Stay);
    }

    #[test]
    fn test_wake_is_single_flight() {
        let now = Instant::now();
        let mut monitor = BackgroundMonitor::new(SLEEP, now);

        assert!(monitor.try_wake(ActiveMode::Translate, SessionStatus::Standby, now));
        assert!(!monitor.try_wake(ActiveMode::Translate, SessionStatus::Standby, now));
        assert!(!monitor.try_wake(ActiveMode::Translate, SessionStatus::Disconnected, now));

        monitor.handshake_mut().finish();
        assert!(monitor.try_wake(ActiveMode::Transcribe, SessionStatus::Disconnected, now));
    }

    #[test]
    fn test_no_wake_when_off_or_connected() {
        let now = Instant::now();
        let mut monitor = BackgroundMonitor::new(SLEEP, now);
        assert!(!monitor.try_wake(ActiveMode::Off, SessionStatus::Standby, now));
        assert!(!monitor.try_wake(ActiveMode::Translate, SessionStatus::Connected, now));
        assert!(!monitor.handshake().is_in_flight());
    }

    #[test]
    fn test_manual_flush_clears_queue() {
        let now = Instant::now();
        let monitor = BackgroundMonitor::new(SLEEP, now);
        let mut queue = TurnQueue::new();
        let mut timer = ResponseTimer::new();
        queue.enqueue(TurnPackage {
            id: "turn-1".into(),
            sequence: 1,
            timestamp: Utc::now(),
            duration_ms: 900,
            confidence_score: 0.9,
        });
        timer.track_sent("turn-1", 900, now);

        assert_eq!(monitor.manual_flush(&mut queue, &mut timer), 1);
        assert!(!queue.is_pending_work());
        assert_eq!(timer.pending_sends(), 0);
    }
}

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use super::types::Event;

/// A monotonic, one-shot timer that raises a single `Event` on a
/// Connection's channel when it fires. Dropping the handle cancels it —
/// there is no explicit `stop()`, matching the single-owner-slot shape of
/// `Connection::hold_timer`/`keepalive_timer`.
#[derive(Debug)]
pub struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    /// Arms a timer for `interval` seconds. If `jitter` is set, the actual
    /// fire time is reduced by a uniform random amount in `[0, 25%)` of the
    /// interval, per the timer suite's jitter rule. An `interval` of zero
    /// means "do not arm" — callers should check this before calling `arm`
    /// and simply clear the slot instead.
    pub fn arm(interval: u16, jitter: bool, tx: mpsc::Sender<Event>, event: Event) -> Timer {
        let mut secs = interval as f64;
        if jitter {
            let reduction = rand::thread_rng().gen_range(0.0..0.25);
            secs -= secs * reduction;
        }
        let duration = Duration::from_secs_f64(secs.max(0.0));

        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(event).await;
        });

        Timer { handle }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub const IDLE_HOLD_MIN: u16 = 4;
pub const IDLE_HOLD_MAX: u16 = 120;
pub const IDLE_HOLD_INITIAL: u16 = 1;
pub const COURTESY_HOLD: u16 = 5;
pub const STOPPING_HOLD: u16 = 20;

/// Doubles the IdleHoldTimer interval on repeated fall-backs to Idle,
/// clamped to `[4, 120]` s (§5, §8 scenario 6).
pub fn backoff_idle_hold(current: u16) -> u16 {
    if current == 0 {
        IDLE_HOLD_MIN
    } else {
        (current.saturating_mul(2)).clamp(IDLE_HOLD_MIN, IDLE_HOLD_MAX)
    }
}

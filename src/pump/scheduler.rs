use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::trace;

/// The engine's "do some work now" entry point.
pub trait EnginePump {
    fn run_pump_once(&self);
}

impl<F: Fn()> EnginePump for F {
    fn run_pump_once(&self) {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    Counting(Duration),
    DuePump,
}

/// Countdown to the next requested pump.
///
/// A request always replaces the pending one, it never merges with it.
/// `request_pump` may be called from any thread; `tick` belongs to the host
/// frame loop.
#[derive(Debug, Default)]
pub struct MessagePumpScheduler {
    countdown: Mutex<Option<Duration>>,
}

impl MessagePumpScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a pump `delay_ms` from now. Negative delays mean "now".
    pub fn request_pump(&self, delay_ms: i64) {
        let delay = Duration::from_millis(delay_ms.max(0).unsigned_abs());
        trace!(target: "pump", delay_ms = delay.as_millis() as u64, "pump requested");
        *self.lock() = Some(delay);
    }

    /// Advances the countdown by `delta` and runs `pump` if it is due or
    /// `force` is set. Returns whether the pump ran.
    pub fn tick(&self, delta: Duration, force: bool, pump: &dyn EnginePump) -> bool {
        let due = {
            let mut countdown = self.lock();
            let due = match countdown.as_mut() {
                Some(remaining) => {
                    *remaining = remaining.saturating_sub(delta);
                    remaining.is_zero() || force
                }
                None => force,
            };
            if due {
                // Cleared before pumping so a request raised by the pump survives.
                *countdown = None;
            }
            due
        };

        if due {
            trace!(target: "pump", force, "running engine pump");
            pump.run_pump_once();
        }
        due
    }

    pub fn state(&self) -> PumpState {
        match *self.lock() {
            None => PumpState::Idle,
            Some(remaining) if remaining.is_zero() => PumpState::DuePump,
            Some(remaining) => PumpState::Counting(remaining),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Duration>> {
        self.countdown.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn idle_without_requests() {
        let scheduler = MessagePumpScheduler::new();
        let pumps = Cell::new(0);
        let pump = || pumps.set(pumps.get() + 1);
        for _ in 0..100 {
            assert!(!scheduler.tick(MS, false, &pump));
        }
        assert_eq!(pumps.get(), 0);
        assert_eq!(scheduler.state(), PumpState::Idle);
    }

    #[test]
    fn negative_delay_is_due_on_next_tick() {
        let scheduler = MessagePumpScheduler::new();
        scheduler.request_pump(-25);
        assert_eq!(scheduler.state(), PumpState::DuePump);
        assert!(scheduler.tick(Duration::ZERO, false, &|| {}));
        assert_eq!(scheduler.state(), PumpState::Idle);
    }

    #[test]
    fn counts_down_then_pumps_once() {
        let scheduler = MessagePumpScheduler::new();
        scheduler.request_pump(5);
        for _ in 0..4 {
            assert!(!scheduler.tick(MS, false, &|| {}));
        }
        assert_eq!(scheduler.state(), PumpState::Counting(MS));
        assert!(scheduler.tick(MS, false, &|| {}));
        assert!(!scheduler.tick(MS, false, &|| {}));
    }

    #[test]
    fn force_pumps_even_when_idle() {
        let scheduler = MessagePumpScheduler::new();
        assert!(scheduler.tick(MS, true, &|| {}));
        scheduler.request_pump(1000);
        assert!(scheduler.tick(MS, true, &|| {}));
        assert_eq!(scheduler.state(), PumpState::Idle);
    }

    #[test]
    fn request_raised_during_pump_survives() {
        let scheduler = MessagePumpScheduler::new();
        scheduler.request_pump(0);
        let pump = || scheduler.request_pump(7);
        assert!(scheduler.tick(MS, false, &pump));
        assert_eq!(scheduler.state(), PumpState::Counting(Duration::from_millis(7)));
    }
}

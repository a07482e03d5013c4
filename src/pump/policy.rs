use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::config::SchedulerConfig;

#[derive(Debug)]
struct Timing {
    since_last_pump: Duration,
    to_next_forced: Duration,
}

/// Decides whether a frame forces an engine pump.
///
/// A pump is forced when the minimum rate would otherwise be missed, or when
/// forcing is wanted (configured, or pages are live) and the maximum forced
/// rate allows it.
#[derive(Debug)]
pub struct ForcePolicy {
    min_interval: Duration,
    max_forced_interval: Duration,
    force_message_loop: bool,
    timing: Mutex<Timing>,
}

impl ForcePolicy {
    pub fn new(config: &SchedulerConfig) -> Self {
        let config = config.clamped();
        let max_forced_interval = config.max_forced_interval();
        Self {
            min_interval: config.min_interval(),
            max_forced_interval,
            force_message_loop: config.force_message_loop,
            timing: Mutex::new(Timing {
                since_last_pump: Duration::ZERO,
                to_next_forced: max_forced_interval,
            }),
        }
    }

    /// Accumulates `delta` and returns the `force` flag for this frame's tick.
    pub fn advance(&self, delta: Duration, active_sessions: usize) -> bool {
        let mut timing = self.lock();
        timing.since_last_pump += delta;
        timing.to_next_forced = timing.to_next_forced.saturating_sub(delta);

        let want_force = self.force_message_loop || active_sessions > 0;
        let can_force = timing.to_next_forced.is_zero();
        let must_force = timing.since_last_pump >= self.min_interval;

        must_force || (want_force && can_force)
    }

    /// Resets both accumulators; called after any pump, forced or requested.
    pub fn on_pump(&self) {
        let mut timing = self.lock();
        timing.since_last_pump = Duration::ZERO;
        timing.to_next_forced = self.max_forced_interval;
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn max_forced_interval(&self) -> Duration {
        self.max_forced_interval
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

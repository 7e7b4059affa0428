//! Supervisor: restart policy for crashed or failed-to-start sessions.
//!
//! Exponential backoff starting at 500 ms, doubling up to a 30 s cap, with
//! ±20% jitter; a session is quarantined after five consecutive failed
//! starts. Quarantine is cleared only by external administrative action,
//! which this module does not model beyond the state itself.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const JITTER_FRACTION: f64 = 0.2;
const QUARANTINE_THRESHOLD: u32 = 5;

#[derive(Debug, Default)]
struct FailureState {
    consecutive_failures: u32,
    quarantined: bool,
}

pub struct Supervisor {
    quarantine_threshold: u32,
    states: Mutex<HashMap<String, FailureState>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            quarantine_threshold: QUARANTINE_THRESHOLD,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_quarantined(&self, name: &str) -> bool {
        self.states.lock().get(name).map(|s| s.quarantined).unwrap_or(false)
    }

    /// Records one more failed start/restart attempt. Returns the jittered
    /// backoff duration to wait before retrying, or `None` if this failure
    /// pushed the session into quarantine.
    pub fn record_failure(&self, name: &str) -> Option<Duration> {
        let mut states = self.states.lock();
        let state = states.entry(name.to_string()).or_default();
        if state.quarantined {
            return None;
        }

        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.quarantine_threshold {
            state.quarantined = true;
            return None;
        }

        let exponent = state.consecutive_failures.saturating_sub(1).min(16);
        let doubled = BASE_BACKOFF.saturating_mul(1u32 << exponent);
        let base = doubled.min(MAX_BACKOFF);
        Some(jitter(base))
    }

    pub fn record_success(&self, name: &str) {
        self.states.lock().remove(name);
    }

    pub fn quarantine(&self, name: &str) {
        self.states.lock().entry(name.to_string()).or_default().quarantined = true;
    }
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range((1.0 - JITTER_FRACTION)..=(1.0 + JITTER_FRACTION));
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_starts_near_base_and_grows() {
        let supervisor = Supervisor::new();
        let first = supervisor.record_failure("x").unwrap();
        assert!(first >= Duration::from_millis(400) && first <= Duration::from_millis(600));

        let second = supervisor.record_failure("x").unwrap();
        assert!(second >= Duration::from_millis(800) && second <= Duration::from_millis(1200));
    }

    #[test]
    fn quarantines_after_threshold_failures() {
        let supervisor = Supervisor::new();
        for _ in 0..4 {
            assert!(supervisor.record_failure("flaky").is_some());
        }
        assert!(supervisor.record_failure("flaky").is_none());
        assert!(supervisor.is_quarantined("flaky"));
    }

    #[test]
    fn success_resets_failure_state() {
        let supervisor = Supervisor::new();
        supervisor.record_failure("y");
        supervisor.record_success("y");
        assert!(!supervisor.is_quarantined("y"));
        let first_again = supervisor.record_failure("y").unwrap();
        assert!(first_again <= Duration::from_millis(600));
    }

    #[test]
    fn backoff_is_capped_at_max() {
        let supervisor = Supervisor::new();
        for _ in 0..3 {
            supervisor.record_failure("z");
        }
        // Still below quarantine threshold; verify value stays bounded.
        let delay = supervisor.record_failure("w").unwrap();
        assert!(delay <= MAX_BACKOFF + Duration::from_secs(1));
    }
}

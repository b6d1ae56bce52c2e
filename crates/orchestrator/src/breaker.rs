//! Per-agent circuit breaker.
//!
//! Records consecutive failures per agent; once the threshold is reached
//! inside the rolling window, further engagements of that agent are
//! short-circuited until the window expires. Successes close the circuit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_THRESHOLD: u32 = 3;
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct AgentHealth {
    consecutive_failures: u32,
    window_start: Option<Instant>,
}

/// Tracks failure streaks per agent id.
pub struct CircuitBreaker {
    state: Mutex<HashMap<String, AgentHealth>>,
    threshold: u32,
    window: Duration,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_THRESHOLD, DEFAULT_WINDOW)
    }

    pub fn with_limits(threshold: u32, window: Duration) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            threshold,
            window,
        }
    }

    /// Whether the agent should be engaged. An expired window resets the
    /// streak, so the check has no false-open after a quiet minute.
    pub fn should_try(&self, agent_id: &str) -> bool {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        let Some(health) = state.get_mut(agent_id) else {
            return true;
        };

        if let Some(start) = health.window_start {
            if start.elapsed() >= self.window {
                health.consecutive_failures = 0;
                health.window_start = None;
                return true;
            }
        }

        health.consecutive_failures < self.threshold
    }

    pub fn record_success(&self, agent_id: &str) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.remove(agent_id);
    }

    pub fn record_failure(&self, agent_id: &str) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        let health = state.entry(agent_id.to_string()).or_default();

        match health.window_start {
            Some(start) if start.elapsed() < self.window => {
                health.consecutive_failures += 1;
            }
            _ => {
                health.window_start = Some(Instant::now());
                health.consecutive_failures = 1;
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

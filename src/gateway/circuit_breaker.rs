//! Per-server circuit breakers.
//!
//! State machine: Closed → Open → HalfOpen → (Closed | Open)
//! - Closed: consecutive failures are counted, a success resets the count,
//!   reaching the server's threshold opens the circuit.
//! - Open: calls are rejected until the open duration has elapsed. The next
//!   `allow` after that moves to HalfOpen; there is no timer.
//! - HalfOpen: exactly one probe is admitted. Its success closes the circuit,
//!   its failure reopens it with a fresh timestamp.
//!
//! Every admitted call holds a [`BreakerToken`]. Tokens remember the circuit
//! generation they were issued in, so reports arriving after a transition are
//! ignored. A token dropped without being reported counts as a failure.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::store::BreakerSettings;

/// Hint returned while a half-open probe is still running.
const PROBE_IN_FLIGHT_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// State change caused by a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Closed → Open after reaching the failure threshold.
    Opened,
    /// HalfOpen → Open after a failed probe.
    Reopened,
    /// HalfOpen → Closed after a successful probe.
    Recovered,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Opened => "opened",
            Transition::Reopened => "reopened",
            Transition::Recovered => "recovered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub probe_in_flight: bool,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Bumped on every state change; tokens from older generations are stale.
    generation: u64,
    probe_in_flight: bool,
    settings: BreakerSettings,
}

impl Circuit {
    fn new(settings: BreakerSettings) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            generation: 0,
            probe_in_flight: false,
            settings,
        }
    }

    fn transition_to(&mut self, state: CircuitState) {
        self.state = state;
        self.generation += 1;
        self.probe_in_flight = false;
        match state {
            CircuitState::Open => self.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.opened_at = None;
            }
            CircuitState::HalfOpen => {}
        }
    }
}

type SharedCircuit = Arc<Mutex<Circuit>>;

fn lock(circuit: &SharedCircuit) -> MutexGuard<'_, Circuit> {
    circuit.lock().unwrap_or_else(|e| e.into_inner())
}

/// Permit for one call through a circuit. Settle it with
/// [`CircuitBreaker::report`] or [`CircuitBreaker::release`].
pub struct BreakerToken {
    server_id: String,
    circuit: SharedCircuit,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl fmt::Debug for BreakerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerToken")
            .field("server_id", &self.server_id)
            .field("generation", &self.generation)
            .field("probe", &self.probe)
            .finish()
    }
}

impl BreakerToken {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    fn settle(&mut self, success: bool) -> Option<Transition> {
        self.settled = true;
        let mut circuit = lock(&self.circuit);

        if circuit.generation != self.generation {
            debug!(
                "Ignoring stale breaker report for server {} (generation {} vs {})",
                self.server_id, self.generation, circuit.generation
            );
            return None;
        }

        if self.probe {
            if success {
                info!("Circuit for server {} closed after successful probe", self.server_id);
                circuit.transition_to(CircuitState::Closed);
                Some(Transition::Recovered)
            } else {
                warn!("Probe failed, circuit for server {} reopened", self.server_id);
                circuit.transition_to(CircuitState::Open);
                Some(Transition::Reopened)
            }
        } else if success {
            circuit.consecutive_failures = 0;
            None
        } else {
            circuit.consecutive_failures += 1;
            let threshold = circuit.settings.failure_threshold.max(1);
            if circuit.consecutive_failures >= threshold {
                warn!(
                    "Circuit for server {} opened after {} consecutive failures",
                    self.server_id, circuit.consecutive_failures
                );
                circuit.transition_to(CircuitState::Open);
                Some(Transition::Opened)
            } else {
                None
            }
        }
    }

    fn release_slot(&mut self) {
        self.settled = true;
        let mut circuit = lock(&self.circuit);
        if self.probe && circuit.generation == self.generation {
            circuit.probe_in_flight = false;
        }
    }
}

impl Drop for BreakerToken {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                "Breaker token for server {} dropped unsettled, counting as failure",
                self.server_id
            );
            self.settle(false);
        }
    }
}

/// Result of [`CircuitBreaker::allow`].
#[derive(Debug)]
pub enum Admission {
    Permitted(BreakerToken),
    Rejected { retry_after: Duration },
}

/// Registry of circuits keyed by server identity.
#[derive(Default)]
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, SharedCircuit>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    fn circuit(&self, server_id: &str, settings: BreakerSettings) -> SharedCircuit {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Circuit::new(settings))))
            .clone()
    }

    /// Decides whether a call to `server_id` may proceed. `settings` are the
    /// server's current breaker configuration.
    pub fn allow(&self, server_id: &str, settings: BreakerSettings) -> Admission {
        let shared = self.circuit(server_id, settings);
        let mut circuit = lock(&shared);
        circuit.settings = settings;

        let probe = match circuit.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed < settings.open_duration {
                    return Admission::Rejected {
                        retry_after: settings.open_duration - elapsed,
                    };
                }
                info!("Circuit for server {} half-open, admitting probe", server_id);
                circuit.transition_to(CircuitState::HalfOpen);
                circuit.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    return Admission::Rejected {
                        retry_after: PROBE_IN_FLIGHT_RETRY,
                    };
                }
                circuit.probe_in_flight = true;
                true
            }
        };

        let generation = circuit.generation;
        drop(circuit);
        Admission::Permitted(BreakerToken {
            server_id: server_id.to_string(),
            circuit: shared,
            generation,
            probe,
            settled: false,
        })
    }

    /// Records the outcome of an admitted call.
    pub fn report(&self, mut token: BreakerToken, success: bool) -> Option<Transition> {
        token.settle(success)
    }

    /// Returns a permit without recording an outcome, e.g. when the call was
    /// refused by a later check before any I/O happened.
    pub fn release(&self, mut token: BreakerToken) {
        token.release_slot();
    }

    pub fn snapshot(&self, server_id: &str) -> Option<CircuitSnapshot> {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits.get(server_id).map(|shared| {
            let circuit = lock(shared);
            CircuitSnapshot {
                state: circuit.state,
                consecutive_failures: circuit.consecutive_failures,
                probe_in_flight: circuit.probe_in_flight,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: u32, open_secs: u64) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: threshold,
            open_duration: Duration::from_secs(open_secs),
        }
    }

    fn permit(breaker: &CircuitBreaker, id: &str, s: BreakerSettings) -> BreakerToken {
        match breaker.allow(id, s) {
            Admission::Permitted(token) => token,
            Admission::Rejected { retry_after } => {
                panic!("expected permit, rejected for {:?}", retry_after)
            }
        }
    }

    fn state(breaker: &CircuitBreaker, id: &str) -> CircuitState {
        breaker.snapshot(id).unwrap().state
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new();
        let s = settings(3, 30);

        for i in 0..3 {
            let token = permit(&breaker, "s1", s);
            let transition = breaker.report(token, false);
            if i < 2 {
                assert_eq!(transition, None);
                assert_eq!(state(&breaker, "s1"), CircuitState::Closed);
            } else {
                assert_eq!(transition, Some(Transition::Opened));
            }
        }

        assert_eq!(state(&breaker, "s1"), CircuitState::Open);
        match breaker.allow("s1", s) {
            Admission::Rejected { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(30))
            }
            Admission::Permitted(_) => panic!("open circuit admitted a call"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new();
        let s = settings(3, 30);

        for _ in 0..2 {
            breaker.report(permit(&breaker, "s1", s), false);
        }
        breaker.report(permit(&breaker, "s1", s), true);
        assert_eq!(breaker.snapshot("s1").unwrap().consecutive_failures, 0);

        for _ in 0..2 {
            breaker.report(permit(&breaker, "s1", s), false);
        }
        assert_eq!(state(&breaker, "s1"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new();
        let s = settings(1, 30);
        breaker.report(permit(&breaker, "s1", s), false);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(breaker.allow("s1", s), Admission::Rejected { .. }));

        tokio::time::advance(Duration::from_secs(1)).await;
        let probe = permit(&breaker, "s1", s);
        assert!(probe.is_probe());
        assert_eq!(state(&breaker, "s1"), CircuitState::HalfOpen);

        // Everyone else is turned away while the probe runs
        for _ in 0..5 {
            assert!(matches!(breaker.allow("s1", s), Admission::Rejected { .. }));
        }

        assert_eq!(breaker.report(probe, true), Some(Transition::Recovered));
        let snapshot = breaker.snapshot("s1").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(!permit(&breaker, "s1", s).is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_with_fresh_timestamp() {
        let breaker = CircuitBreaker::new();
        let s = settings(1, 30);
        breaker.report(permit(&breaker, "s1", s), false);

        tokio::time::advance(Duration::from_secs(45)).await;
        let probe = permit(&breaker, "s1", s);
        assert_eq!(breaker.report(probe, false), Some(Transition::Reopened));

        tokio::time::advance(Duration::from_secs(10)).await;
        match breaker.allow("s1", s) {
            Admission::Rejected { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(20))
            }
            Admission::Permitted(_) => panic!("reopened circuit admitted a call"),
        }
    }

    #[test]
    fn test_concurrent_allow_in_half_open_yields_one_probe() {
        let breaker = Arc::new(CircuitBreaker::new());
        // Zero open duration: the first allow after the trip is already a probe
        let s = settings(1, 0);
        breaker.report(permit(&breaker, "s1", s), false);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || match breaker.allow("s1", s) {
                    Admission::Permitted(token) => {
                        let probe = token.is_probe();
                        // Keep the slot held for the rest of the test
                        std::mem::forget(token);
                        probe
                    }
                    Admission::Rejected { .. } => false,
                })
            })
            .collect();

        let probes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|p| *p)
            .count();
        assert_eq!(probes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reports_are_ignored() {
        let breaker = CircuitBreaker::new();
        let s = settings(2, 30);

        let slow = permit(&breaker, "s1", s);
        breaker.report(permit(&breaker, "s1", s), false);
        breaker.report(permit(&breaker, "s1", s), false);
        assert_eq!(state(&breaker, "s1"), CircuitState::Open);

        // A success from before the trip must not close the circuit
        assert_eq!(breaker.report(slow, true), None);
        assert_eq!(state(&breaker, "s1"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_frees_probe_slot() {
        let breaker = CircuitBreaker::new();
        let s = settings(1, 5);
        breaker.report(permit(&breaker, "s1", s), false);
        tokio::time::advance(Duration::from_secs(5)).await;

        let probe = permit(&breaker, "s1", s);
        breaker.release(probe);

        let snapshot = breaker.snapshot("s1").unwrap();
        assert_eq!(snapshot.state, CircuitState::HalfOpen);
        assert!(!snapshot.probe_in_flight);
        assert!(permit(&breaker, "s1", s).is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_token_counts_as_failure() {
        let breaker = CircuitBreaker::new();
        let s = settings(1, 30);

        drop(permit(&breaker, "s1", s));
        assert_eq!(state(&breaker, "s1"), CircuitState::Open);
    }

    #[test]
    fn test_servers_are_isolated() {
        let breaker = CircuitBreaker::new();
        let s = settings(1, 30);

        breaker.report(permit(&breaker, "s1", s), false);
        assert_eq!(state(&breaker, "s1"), CircuitState::Open);
        assert!(matches!(breaker.allow("s2", s), Admission::Permitted(_)));
        assert!(breaker.snapshot("s3").is_none());
    }
}

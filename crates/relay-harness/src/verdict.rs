//! Step outcomes, run verdicts and exit-status mapping

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::capture::CapturedEvent;
use crate::scenario::{Scenario, TestStep};
use crate::session::{Direction, Role, SessionToken};

/// Every step passed
pub const EXIT_SUCCESS: i32 = 0;
/// A step failed or the run hit a connection/runtime error
pub const EXIT_FAILURE: i32 = 1;
/// The operator interrupted the run
pub const EXIT_INTERRUPTED: i32 = 2;

// ----------------------------------------------------------------------------
// Step Failures
// ----------------------------------------------------------------------------

/// Why a step did not pass
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepFailure {
    #[error("no delivery within {budget:?}")]
    Timeout { budget: Duration },

    #[error("cross-talk: received {observed}, which belongs to another step")]
    CrossTalk { observed: CapturedEvent },

    #[error("unexpected event {observed} (expected '{expected}')")]
    UnexpectedEvent {
        expected: String,
        observed: CapturedEvent,
    },

    #[error("payload mismatch: expected {expected}, received {observed}")]
    PayloadMismatch { expected: Value, observed: Value },

    #[error("publish failed: {reason}")]
    PublishFailed { reason: String },

    #[error("destination connection closed while waiting")]
    QueueClosed,

    #[error("interrupted while in flight")]
    Interrupted,

    #[error("not attempted: {reason}")]
    NotAttempted { reason: String },
}

// ----------------------------------------------------------------------------
// Step Outcome
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub index: usize,
    pub step_id: String,
    pub description: String,
    pub direction: Direction,
    /// Delivery consumed by the assertion, if any arrived
    pub observed: Option<CapturedEvent>,
    pub failure: Option<StepFailure>,
    pub elapsed: Duration,
}

impl StepOutcome {
    pub fn passed(index: usize, step: &TestStep, observed: CapturedEvent, elapsed: Duration) -> Self {
        Self {
            index,
            step_id: step.id.clone(),
            description: step.description.clone(),
            direction: step.direction,
            observed: Some(observed),
            failure: None,
            elapsed,
        }
    }

    pub fn failed(
        index: usize,
        step: &TestStep,
        observed: Option<CapturedEvent>,
        failure: StepFailure,
        elapsed: Duration,
    ) -> Self {
        Self {
            index,
            step_id: step.id.clone(),
            description: step.description.clone(),
            direction: step.direction,
            observed,
            failure: Some(failure),
            elapsed,
        }
    }

    pub fn is_pass(&self) -> bool {
        self.failure.is_none()
    }
}

// ----------------------------------------------------------------------------
// Run Verdict
// ----------------------------------------------------------------------------

/// Why a run stopped before executing every step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunAbort {
    Connection(String),
    UserInterrupt,
}

impl fmt::Display for RunAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunAbort::Connection(reason) => write!(f, "connection error: {}", reason),
            RunAbort::UserInterrupt => f.write_str("aborted by user"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunVerdict {
    pub session: SessionToken,
    pub scenario: String,
    pub outcomes: Vec<StepOutcome>,
    pub abort: Option<RunAbort>,
    /// Deliveries still buffered at teardown, per receiving role
    pub unclaimed: Vec<(Role, CapturedEvent)>,
}

impl RunVerdict {
    pub fn all_passed(&self) -> bool {
        self.abort.is_none() && self.outcomes.iter().all(StepOutcome::is_pass)
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.is_pass())
            .map(|outcome| outcome.step_id.as_str())
            .collect()
    }

    pub fn exit_code(&self) -> i32 {
        match (&self.abort, self.all_passed()) {
            (Some(RunAbort::UserInterrupt), _) => EXIT_INTERRUPTED,
            (_, true) => EXIT_SUCCESS,
            _ => EXIT_FAILURE,
        }
    }

    /// Human-readable summary of the run
    pub fn render_report(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RunVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== TEST RESULTS: {} (session {}) ===", self.scenario, self.session)?;

        for outcome in &self.outcomes {
            match &outcome.failure {
                None => writeln!(
                    f,
                    "  PASS  {} [{}] {} ({:?})",
                    outcome.step_id, outcome.direction, outcome.description, outcome.elapsed
                )?,
                Some(failure) => writeln!(
                    f,
                    "  FAIL  {} [{}] {}: {}",
                    outcome.step_id, outcome.direction, outcome.description, failure
                )?,
            }
        }

        if let Some(abort) = &self.abort {
            writeln!(f, "Run aborted: {}", abort)?;
        }

        for (role, event) in &self.unclaimed {
            writeln!(f, "  Unclaimed delivery on {}: {}", role, event)?;
        }

        if self.all_passed() {
            write!(f, "All {} steps passed", self.outcomes.len())
        } else {
            write!(f, "Failed steps: [{}]", self.failed_steps().join(", "))
        }
    }
}

// ----------------------------------------------------------------------------
// Verdict Aggregator
// ----------------------------------------------------------------------------

/// Collects outcomes as a run progresses and publishes the final verdict
pub struct VerdictAggregator {
    session: SessionToken,
    scenario: String,
    outcomes: Vec<StepOutcome>,
    in_flight: Option<(usize, TestStep)>,
    abort: Option<RunAbort>,
    done: watch::Sender<Option<RunVerdict>>,
}

impl VerdictAggregator {
    pub fn new(session: SessionToken, scenario: impl Into<String>) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            session,
            scenario: scenario.into(),
            outcomes: Vec::new(),
            in_flight: None,
            abort: None,
            done,
        }
    }

    /// Handle that resolves once [`finalize`](Self::finalize) runs
    pub fn completion(&self) -> VerdictHandle {
        VerdictHandle {
            rx: self.done.subscribe(),
        }
    }

    pub fn session(&self) -> &SessionToken {
        &self.session
    }

    pub fn outcomes(&self) -> &[StepOutcome] {
        &self.outcomes
    }

    /// Mark a step as attempted so an interrupt can still account for it
    pub fn begin(&mut self, index: usize, step: &TestStep) {
        info!("--- Step {} ({}): {} [{}] ---", index + 1, step.id, step.description, step.direction);
        self.in_flight = Some((index, step.clone()));
    }

    pub fn record(&mut self, outcome: StepOutcome) {
        match &outcome.failure {
            None => info!("Step {} passed in {:?}", outcome.step_id, outcome.elapsed),
            Some(failure) => warn!("Step {} failed: {}", outcome.step_id, failure),
        }
        if matches!(&self.in_flight, Some((index, _)) if *index == outcome.index) {
            self.in_flight = None;
        }
        self.outcomes.push(outcome);
    }

    /// Stop the run: the in-flight step (if any) and every step not yet reached
    /// are recorded as failures so no step goes missing from the verdict.
    pub fn abort(&mut self, reason: RunAbort, scenario: &Scenario) {
        warn!("Run aborted: {}", reason);

        if let Some((index, step)) = self.in_flight.take() {
            let failure = match reason {
                RunAbort::UserInterrupt => StepFailure::Interrupted,
                RunAbort::Connection(_) => StepFailure::NotAttempted {
                    reason: reason.to_string(),
                },
            };
            self.outcomes
                .push(StepOutcome::failed(index, &step, None, failure, Duration::ZERO));
        }

        let reached = self
            .outcomes
            .iter()
            .map(|outcome| outcome.index + 1)
            .max()
            .unwrap_or(0);

        for (index, step) in scenario.steps.iter().enumerate().skip(reached) {
            self.outcomes.push(StepOutcome::failed(
                index,
                step,
                None,
                StepFailure::NotAttempted {
                    reason: reason.to_string(),
                },
                Duration::ZERO,
            ));
        }

        self.abort = Some(reason);
    }

    /// Seal the verdict and wake every [`VerdictHandle`]
    pub fn finalize(self, unclaimed: Vec<(Role, CapturedEvent)>) -> RunVerdict {
        for (role, event) in &unclaimed {
            warn!("Unclaimed delivery on {}: {}", role, event);
        }

        let verdict = RunVerdict {
            session: self.session,
            scenario: self.scenario,
            outcomes: self.outcomes,
            abort: self.abort,
            unclaimed,
        };

        self.done.send_replace(Some(verdict.clone()));
        verdict
    }
}

/// Waits for a run's final verdict
#[derive(Debug, Clone)]
pub struct VerdictHandle {
    rx: watch::Receiver<Option<RunVerdict>>,
}

impl VerdictHandle {
    /// Resolves to the final verdict, or `None` if the run ended without one
    pub async fn wait(mut self) -> Option<RunVerdict> {
        loop {
            if let Some(verdict) = self.rx.borrow_and_update().clone() {
                return Some(verdict);
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scenario() -> Scenario {
        Scenario::pinpoint()
    }

    fn pass(index: usize, scenario: &Scenario) -> StepOutcome {
        let step = &scenario.steps[index];
        StepOutcome::passed(
            index,
            step,
            CapturedEvent::new(step.expected_event(), step.expected_payload().clone()),
            Duration::from_millis(5),
        )
    }

    #[test]
    fn test_all_passed_maps_to_success() {
        let scenario = scenario();
        let mut aggregator = VerdictAggregator::new(SessionToken::from_string("s"), &scenario.name);
        for index in 0..scenario.steps.len() {
            aggregator.record(pass(index, &scenario));
        }

        let verdict = aggregator.finalize(vec![]);
        assert!(verdict.all_passed());
        assert_eq!(verdict.exit_code(), EXIT_SUCCESS);
        assert!(verdict.render_report().contains("All 4 steps passed"));
    }

    #[test]
    fn test_single_timeout_fails_run() {
        let scenario = scenario();
        let mut aggregator = VerdictAggregator::new(SessionToken::from_string("s"), &scenario.name);
        aggregator.record(pass(0, &scenario));
        aggregator.record(StepOutcome::failed(
            1,
            &scenario.steps[1],
            None,
            StepFailure::Timeout {
                budget: Duration::from_secs(5),
            },
            Duration::from_secs(5),
        ));
        aggregator.record(pass(2, &scenario));
        aggregator.record(pass(3, &scenario));

        let verdict = aggregator.finalize(vec![]);
        assert!(!verdict.all_passed());
        assert_eq!(verdict.exit_code(), EXIT_FAILURE);
        assert_eq!(verdict.failed_steps(), vec![scenario.steps[1].id.as_str()]);
        assert!(verdict.render_report().contains("no delivery within 5s"));
    }

    #[test]
    fn test_interrupt_accounts_for_every_step() {
        let scenario = scenario();
        let mut aggregator = VerdictAggregator::new(SessionToken::from_string("s"), &scenario.name);
        aggregator.begin(0, &scenario.steps[0]);
        aggregator.record(pass(0, &scenario));
        aggregator.begin(1, &scenario.steps[1]);
        aggregator.abort(RunAbort::UserInterrupt, &scenario);

        let verdict = aggregator.finalize(vec![]);
        assert_eq!(verdict.outcomes.len(), 4);
        assert_eq!(verdict.outcomes[1].failure, Some(StepFailure::Interrupted));
        assert!(matches!(
            verdict.outcomes[3].failure,
            Some(StepFailure::NotAttempted { .. })
        ));
        assert_eq!(verdict.exit_code(), EXIT_INTERRUPTED);
    }

    #[test]
    fn test_setup_abort_marks_all_steps_not_attempted() {
        let scenario = scenario();
        let mut aggregator = VerdictAggregator::new(SessionToken::from_string("s"), &scenario.name);
        aggregator.abort(RunAbort::Connection("refused".into()), &scenario);

        let verdict = aggregator.finalize(vec![(Role::Sender, CapturedEvent::new("x", json!(1)))]);
        assert_eq!(verdict.failed_steps().len(), 4);
        assert_eq!(verdict.exit_code(), EXIT_FAILURE);

        let report = verdict.render_report();
        assert!(report.contains("Run aborted: connection error: refused"));
        assert!(report.contains("Unclaimed delivery on sender"));
    }

    #[test]
    fn test_connection_abort_mid_step_is_not_a_publish_failure() {
        let scenario = scenario();
        let mut aggregator = VerdictAggregator::new(SessionToken::from_string("s"), &scenario.name);
        aggregator.begin(0, &scenario.steps[0]);
        aggregator.record(pass(0, &scenario));
        aggregator.begin(1, &scenario.steps[1]);
        aggregator.abort(RunAbort::Connection("reset by peer".into()), &scenario);

        let verdict = aggregator.finalize(vec![]);
        assert_eq!(verdict.outcomes.len(), 4);
        assert_eq!(
            verdict.outcomes[1].failure,
            Some(StepFailure::NotAttempted {
                reason: "connection error: reset by peer".to_string()
            })
        );
        assert!(!verdict
            .outcomes
            .iter()
            .any(|outcome| matches!(outcome.failure, Some(StepFailure::PublishFailed { .. }))));
        assert_eq!(verdict.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn test_failure_messages() {
        let unexpected = StepFailure::UnexpectedEvent {
            expected: "log".into(),
            observed: CapturedEvent::new("rogue", json!(1)),
        };
        assert_eq!(unexpected.to_string(), "unexpected event rogue: 1 (expected 'log')");

        let mismatch = StepFailure::PayloadMismatch {
            expected: json!({"a": 1}),
            observed: json!({"a": 2}),
        };
        assert_eq!(
            mismatch.to_string(),
            r#"payload mismatch: expected {"a":1}, received {"a":2}"#
        );
    }

    #[tokio::test]
    async fn test_completion_handle_resolves_on_finalize() {
        let scenario = scenario();
        let aggregator = VerdictAggregator::new(SessionToken::from_string("s"), &scenario.name);
        let handle = aggregator.completion();

        let waiter = tokio::spawn(handle.wait());
        tokio::task::yield_now().await;
        let verdict = aggregator.finalize(vec![]);

        assert_eq!(waiter.await.unwrap(), Some(verdict));
    }

    #[tokio::test]
    async fn test_completion_handle_without_verdict() {
        let aggregator = VerdictAggregator::new(SessionToken::from_string("s"), "dropped");
        let handle = aggregator.completion();
        drop(aggregator);
        assert_eq!(handle.wait().await, None);
    }
}

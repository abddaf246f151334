//! Sequential step execution
//!
//! Each step publishes from its source role, then waits on the destination's
//! capture queue for one delivery within the step's budget. A failed step is
//! recorded and the run moves on.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info};

use crate::capture::CapturedEvent;
use crate::connection::RoleConnection;
use crate::error::CaptureError;
use crate::scenario::{Scenario, TestStep};
use crate::session::Direction;
use crate::verdict::{StepFailure, StepOutcome, VerdictAggregator};

pub struct ScenarioRunner<'a> {
    sender: &'a mut RoleConnection,
    receiver: &'a mut RoleConnection,
    default_timeout: Duration,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(
        sender: &'a mut RoleConnection,
        receiver: &'a mut RoleConnection,
        default_timeout: Duration,
    ) -> Self {
        Self {
            sender,
            receiver,
            default_timeout,
        }
    }

    /// Run every step in order, recording each outcome as it completes
    pub async fn run(&mut self, scenario: &Scenario, verdict: &mut VerdictAggregator) {
        info!("Running scenario '{}' ({} steps)", scenario.name, scenario.steps.len());

        for (index, step) in scenario.steps.iter().enumerate() {
            verdict.begin(index, step);
            let outcome = self.run_step(scenario, index, step).await;
            verdict.record(outcome);
        }
    }

    async fn run_step(&mut self, scenario: &Scenario, index: usize, step: &TestStep) -> StepOutcome {
        let budget = step.timeout(self.default_timeout);
        let started = Instant::now();
        let (source, destination) = self.endpoints(step.direction);

        if let Err(e) = source.publish(&step.event, step.payload.clone()).await {
            let failure = StepFailure::PublishFailed {
                reason: e.to_string(),
            };
            return StepOutcome::failed(index, step, None, failure, started.elapsed());
        }

        debug!("Waiting up to {:?} for '{}' on {}", budget, step.expected_event(), destination.role());

        let observed = match destination.pop(budget).await {
            Ok(observed) => observed,
            Err(CaptureError::Timeout { budget }) => {
                let failure = StepFailure::Timeout { budget };
                return StepOutcome::failed(index, step, None, failure, started.elapsed());
            }
            Err(CaptureError::Closed) => {
                return StepOutcome::failed(index, step, None, StepFailure::QueueClosed, started.elapsed());
            }
        };

        match evaluate(scenario, step, &observed) {
            Ok(()) => StepOutcome::passed(index, step, observed, started.elapsed()),
            Err(failure) => StepOutcome::failed(index, step, Some(observed), failure, started.elapsed()),
        }
    }

    fn endpoints(&mut self, direction: Direction) -> (&RoleConnection, &mut RoleConnection) {
        match direction {
            Direction::SenderToReceiver => (&*self.sender, &mut *self.receiver),
            Direction::ReceiverToSender => (&*self.receiver, &mut *self.sender),
        }
    }
}

/// Compare a delivery against what `step` expects.
///
/// A wrong name is cross-talk when another step of the same scenario uses it,
/// otherwise the relay produced an event nothing asked for.
pub fn evaluate(scenario: &Scenario, step: &TestStep, observed: &CapturedEvent) -> Result<(), StepFailure> {
    let expected_event = step.expected_event();

    if observed.event != expected_event {
        return if scenario.expected_events().contains(observed.event.as_str()) {
            Err(StepFailure::CrossTalk {
                observed: observed.clone(),
            })
        } else {
            Err(StepFailure::UnexpectedEvent {
                expected: expected_event.to_string(),
                observed: observed.clone(),
            })
        };
    }

    if !payloads_match(step.expected_payload(), &observed.payload) {
        return Err(StepFailure::PayloadMismatch {
            expected: step.expected_payload().clone(),
            observed: observed.payload.clone(),
        });
    }

    Ok(())
}

/// Structural JSON equality where numbers compare by value, so `2.0` matches `2`
pub fn payloads_match(expected: &Value, observed: &Value) -> bool {
    match (expected, observed) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return a == b;
            }
            if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
                return a == b;
            }
            matches!((a.as_f64(), b.as_f64()), (Some(a), Some(b)) if a == b)
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| payloads_match(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(key, a)| b.get(key).map_or(false, |b| payloads_match(a, b)))
        }
        _ => expected == observed,
    }
}

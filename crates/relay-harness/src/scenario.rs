//! Declarative relay scenarios
//!
//! A [`Scenario`] is an ordered list of [`TestStep`]s. Each step publishes one
//! event from one role and names the delivery the other role must observe.
//! Scenarios are either built in or loaded from TOML:
//!
//! ```toml
//! name = "smoke"
//!
//! [[steps]]
//! id = "hello"
//! description = "Sender -> Receiver"
//! direction = "sender_to_receiver"
//! event = "test_message"
//! payload = "Hello from sender"
//! timeout_ms = 5000
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ConfigError;
use crate::routing::{relay_direction, RECEIVER_TO_SENDER_EVENTS};
use crate::session::Direction;

/// Names accepted by [`Scenario::builtin`]
pub const BUILTIN_SCENARIOS: &[&str] = &["pinpoint", "routing-matrix"];

// ----------------------------------------------------------------------------
// Test Step
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub direction: Direction,
    pub event: String,
    pub payload: Value,
    /// Defaults to `event`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_event: Option<String>,
    /// Defaults to `payload`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_payload: Option<Value>,
    /// Defaults to the harness step timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl TestStep {
    /// Step expecting the published event to arrive unchanged
    pub fn relay(
        id: impl Into<String>,
        description: impl Into<String>,
        direction: Direction,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            direction,
            event: event.into(),
            payload,
            expected_event: None,
            expected_payload: None,
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn expecting(mut self, event: impl Into<String>, payload: Value) -> Self {
        self.expected_event = Some(event.into());
        self.expected_payload = Some(payload);
        self
    }

    pub fn expected_event(&self) -> &str {
        self.expected_event.as_deref().unwrap_or(&self.event)
    }

    pub fn expected_payload(&self) -> &Value {
        self.expected_payload.as_ref().unwrap_or(&self.payload)
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

// ----------------------------------------------------------------------------
// Scenario
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<TestStep>,
}

impl Scenario {
    /// The four-step bidirectional check run against the Pinpoint relay
    pub fn pinpoint() -> Self {
        let budget = Duration::from_secs(5);
        Self {
            name: "pinpoint".to_string(),
            description: "Bidirectional string and JSON delivery through the relay".to_string(),
            steps: vec![
                TestStep::relay(
                    "test-1",
                    "Sender -> Receiver",
                    Direction::SenderToReceiver,
                    "test_message",
                    json!("Hello from sender"),
                )
                .with_timeout(budget),
                TestStep::relay(
                    "test-2",
                    "Sender -> Receiver (JSON)",
                    Direction::SenderToReceiver,
                    "test_json",
                    json!({"key": "value", "nested": {"data": [1, 2, 3]}}),
                )
                .with_timeout(budget),
                TestStep::relay(
                    "test-3",
                    "Receiver -> Sender",
                    Direction::ReceiverToSender,
                    "log",
                    json!("Log message from receiver"),
                )
                .with_timeout(budget),
                TestStep::relay(
                    "test-4",
                    "Receiver -> Sender (NeuronCallback)",
                    Direction::ReceiverToSender,
                    "NeuronCallback",
                    json!({"neuron_id": 123, "status": "active"}),
                )
                .with_timeout(budget),
            ],
        }
    }

    /// One step per reserved receiver -> sender event plus a sender broadcast
    pub fn routing_matrix() -> Self {
        let mut steps: Vec<TestStep> = RECEIVER_TO_SENDER_EVENTS
            .iter()
            .enumerate()
            .map(|(seq, event)| {
                TestStep::relay(
                    format!("matrix-{}", event),
                    format!("Receiver -> Sender ({})", event),
                    Direction::ReceiverToSender,
                    *event,
                    json!({"event": event, "seq": seq}),
                )
            })
            .collect();

        steps.push(TestStep::relay(
            "matrix-broadcast",
            "Sender -> Receiver (broadcast)",
            Direction::SenderToReceiver,
            "matrix_broadcast",
            json!({"values": [1.5, -2, null, true], "label": "broadcast"}),
        ));

        Self {
            name: "routing-matrix".to_string(),
            description: "Every relay route in the direction the relay forwards it".to_string(),
            steps,
        }
    }

    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "pinpoint" => Some(Self::pinpoint()),
            "routing-matrix" => Some(Self::routing_matrix()),
            _ => None,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let scenario: Scenario = toml::from_str(text)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Every event name a delivery could legitimately carry in this scenario
    pub fn expected_events(&self) -> HashSet<&str> {
        self.steps.iter().map(TestStep::expected_event).collect()
    }

    /// Reject scenarios that could never pass against the relay
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Scenario '{}' has no steps",
                self.name
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(ConfigError::Validation(format!("Duplicate step id '{}'", step.id)));
            }

            match relay_direction(&step.event) {
                None => {
                    return Err(ConfigError::Validation(format!(
                        "Step '{}' publishes control event '{}'",
                        step.id, step.event
                    )))
                }
                Some(direction) if direction != step.direction => {
                    return Err(ConfigError::Validation(format!(
                        "Step '{}' publishes '{}' {}, but the relay only routes it {}",
                        step.id, step.event, step.direction, direction
                    )))
                }
                Some(_) => {}
            }

            if step.timeout_ms == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "Step '{}' has a zero timeout",
                    step.id
                )));
            }
        }

        Ok(())
    }
}

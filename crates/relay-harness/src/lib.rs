//! End-to-end correctness harness for a Socket.IO message relay
//!
//! The harness opens two connections to the relay, registers one as the sender
//! and one as the receiver of a fresh session, publishes a sequence of events in
//! both directions and checks that each arrives at the other side with its name
//! and payload intact. The outcome is a [`RunVerdict`] that maps to a process
//! exit status.
//!
//! ```no_run
//! use relay_harness::{Harness, HarnessConfig, Scenario};
//!
//! # async fn demo() -> relay_harness::Result<()> {
//! let harness = Harness::new(HarnessConfig::for_server("http://localhost:5000"))?;
//! let verdict = harness.run(&Scenario::pinpoint()).await?;
//! println!("{}", verdict);
//! std::process::exit(verdict.exit_code());
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod connection;
pub mod error;
pub mod harness;
pub mod protocol;
pub mod routing;
pub mod runner;
pub mod scenario;
pub mod session;
pub mod subscription;
pub mod transport;
pub mod verdict;

pub use capture::{CaptureQueue, CaptureSink, CapturedEvent};
pub use config::{HarnessConfig, RegistrationSettle, DEFAULT_SERVER_URL};
pub use connection::{RoleConnection, REGISTRATION_EVENT};
pub use error::{CaptureError, ConfigError, ConnectionError, HarnessError, ProtocolError, Result};
pub use harness::Harness;
pub use routing::{relay_direction, CONTROL_EVENTS, RECEIVER_TO_SENDER_EVENTS};
pub use runner::{evaluate, payloads_match, ScenarioRunner};
pub use scenario::{Scenario, TestStep, BUILTIN_SCENARIOS};
pub use session::{Direction, Role, SessionToken};
pub use subscription::{DeliveryRouter, Subscription};
pub use transport::{RelayTransport, SocketIoTransport, TransportOptions};
pub use verdict::{
    RunAbort, RunVerdict, StepFailure, StepOutcome, VerdictAggregator, VerdictHandle,
    EXIT_FAILURE, EXIT_INTERRUPTED, EXIT_SUCCESS,
};

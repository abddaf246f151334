//! Run orchestration
//!
//! [`Harness`] owns one run end to end: connect and register both roles under a
//! fresh session token, let registrations settle, execute the scenario, then
//! tear both connections down and seal the verdict. Teardown happens on every
//! path, including connection failures and operator interrupts.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::capture::CapturedEvent;
use crate::config::{HarnessConfig, RegistrationSettle};
use crate::connection::RoleConnection;
use crate::error::{ConnectionError, HarnessError, Result};
use crate::runner::ScenarioRunner;
use crate::scenario::Scenario;
use crate::session::{Role, SessionToken};
use crate::verdict::{RunAbort, RunVerdict, VerdictAggregator, VerdictHandle};

#[derive(Debug, Clone)]
pub struct Harness {
    config: HarnessConfig,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run `scenario` under a fresh session token
    pub async fn run(&self, scenario: &Scenario) -> Result<RunVerdict> {
        self.run_until(scenario, std::future::pending()).await
    }

    /// Run `scenario`, stopping early once `interrupt` resolves
    pub async fn run_until<I>(&self, scenario: &Scenario, interrupt: I) -> Result<RunVerdict>
    where
        I: Future<Output = ()>,
    {
        self.run_with_session(SessionToken::generate(), scenario, interrupt)
            .await
    }

    pub async fn run_with_session<I>(
        &self,
        session: SessionToken,
        scenario: &Scenario,
        interrupt: I,
    ) -> Result<RunVerdict>
    where
        I: Future<Output = ()>,
    {
        check_scenario(scenario)?;
        let verdict = VerdictAggregator::new(session, &scenario.name);
        Ok(self.execute(scenario, interrupt, verdict).await)
    }

    /// Run in the background; the returned handle resolves to the verdict
    pub fn spawn<I>(self, scenario: Scenario, interrupt: I) -> Result<VerdictHandle>
    where
        I: Future<Output = ()> + Send + 'static,
    {
        check_scenario(&scenario)?;
        let verdict = VerdictAggregator::new(SessionToken::generate(), &scenario.name);
        let handle = verdict.completion();

        tokio::spawn(async move {
            self.execute(&scenario, interrupt, verdict).await;
        });

        Ok(handle)
    }

    async fn execute<I>(&self, scenario: &Scenario, interrupt: I, mut verdict: VerdictAggregator) -> RunVerdict
    where
        I: Future<Output = ()>,
    {
        let session = verdict.session().clone();
        info!("Starting run '{}' against {} (session {})", scenario.name, self.config.server_url, session);

        let mut sender = None;
        let mut receiver = None;

        let result = tokio::select! {
            biased;
            _ = interrupt => Err(RunAbort::UserInterrupt),
            driven = self.drive(&session, scenario, &mut sender, &mut receiver, &mut verdict) => {
                driven.map_err(|e| RunAbort::Connection(e.to_string()))
            }
        };

        if let Err(reason) = result {
            verdict.abort(reason, scenario);
        }

        let unclaimed = teardown(&mut sender, &mut receiver).await;
        verdict.finalize(unclaimed)
    }

    async fn drive(
        &self,
        session: &SessionToken,
        scenario: &Scenario,
        sender_slot: &mut Option<RoleConnection>,
        receiver_slot: &mut Option<RoleConnection>,
        verdict: &mut VerdictAggregator,
    ) -> std::result::Result<(), ConnectionError> {
        let settle = &self.config.registration;

        info!("Connecting sender");
        let sender = sender_slot.insert(RoleConnection::connect(&self.config, Role::Sender).await?);
        sender.register(session, settle).await?;

        info!("Connecting receiver");
        let receiver = receiver_slot.insert(RoleConnection::connect(&self.config, Role::Receiver).await?);
        receiver.register(session, settle).await?;

        match settle {
            RegistrationSettle::Delay { settle_ms } => {
                warn!(
                    "Relay does not confirm registration; waiting a fixed {}ms before the first step",
                    settle_ms
                );
                sleep(Duration::from_millis(*settle_ms)).await;
            }
            RegistrationSettle::Acknowledged { .. } => {
                debug!("Both registrations acknowledged by the relay");
            }
        }

        ScenarioRunner::new(sender, receiver, self.config.step_timeout())
            .run(scenario, verdict)
            .await;

        Ok(())
    }
}

fn check_scenario(scenario: &Scenario) -> Result<()> {
    scenario
        .validate()
        .map_err(|e| HarnessError::Scenario(format!("'{}': {}", scenario.name, e)))
}

/// Close whatever connections were opened and collect deliveries nobody consumed
async fn teardown(
    sender: &mut Option<RoleConnection>,
    receiver: &mut Option<RoleConnection>,
) -> Vec<(Role, CapturedEvent)> {
    info!("Tearing down connections");
    let mut unclaimed = Vec::new();

    for connection in [sender.as_mut(), receiver.as_mut()].into_iter().flatten() {
        connection.disconnect().await;
        let role = connection.role();
        unclaimed.extend(connection.drain_unclaimed().into_iter().map(|event| (role, event)));
    }

    unclaimed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::verdict::{StepFailure, EXIT_FAILURE};

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = HarnessConfig {
            step_timeout_ms: 0,
            ..HarnessConfig::default()
        };
        assert!(matches!(
            Harness::new(config),
            Err(HarnessError::Config(ConfigError::Validation(_)))
        ));
    }

    #[test]
    fn test_new_keeps_validated_config() {
        let config = HarnessConfig {
            step_timeout_ms: 750,
            ..HarnessConfig::for_server("http://127.0.0.1:5000")
        };
        let harness = Harness::new(config.clone()).unwrap();
        assert_eq!(harness.config(), &config);
    }

    #[tokio::test]
    async fn test_invalid_scenario_is_rejected_before_connecting() {
        let harness = Harness::new(HarnessConfig::for_server("http://127.0.0.1:9")).unwrap();
        let mut scenario = Scenario::pinpoint();
        scenario.steps.clear();

        assert!(matches!(harness.run(&scenario).await, Err(HarnessError::Scenario(_))));
    }

    #[tokio::test]
    async fn test_unreachable_relay_aborts_every_step() {
        let config = HarnessConfig {
            connect_timeout_ms: 500,
            ..HarnessConfig::for_server("http://127.0.0.1:9")
        };
        let harness = Harness::new(config).unwrap();

        let verdict = harness.run(&Scenario::pinpoint()).await.unwrap();
        assert!(matches!(verdict.abort, Some(RunAbort::Connection(_))));
        assert_eq!(verdict.outcomes.len(), 4);
        assert!(verdict
            .outcomes
            .iter()
            .all(|o| matches!(o.failure, Some(StepFailure::NotAttempted { .. }))));
        assert_eq!(verdict.exit_code(), EXIT_FAILURE);
    }
}

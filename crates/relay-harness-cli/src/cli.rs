//! Command-line interface definitions and parsing

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use relay_harness::{HarnessConfig, RegistrationSettle, Scenario, BUILTIN_SCENARIOS};

#[derive(Parser, Debug)]
#[command(author, version, about = "Check that a Socket.IO relay delivers events between paired clients", long_about = None)]
pub struct Cli {
    /// Relay address (http, https, ws or wss)
    #[arg(short, long, env = "RELAY_HARNESS_SERVER")]
    pub server: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Built-in scenario name or path to a scenario TOML file
    #[arg(long, default_value = "pinpoint")]
    pub scenario: String,

    /// Fixed wait after registration before the first step
    #[arg(long, conflicts_with = "ack_registration")]
    pub settle_ms: Option<u64>,

    /// Require the relay to acknowledge registration within this many milliseconds
    #[arg(long, value_name = "TIMEOUT_MS")]
    pub ack_registration: Option<u64>,

    /// Delivery budget for steps without their own timeout
    #[arg(long)]
    pub step_timeout_ms: Option<u64>,

    /// List built-in scenarios and exit
    #[arg(long)]
    pub list: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Layer command-line flags over the file/default configuration
    pub fn apply_overrides(&self, config: &mut HarnessConfig) {
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        if let Some(timeout_ms) = self.ack_registration {
            config.registration = RegistrationSettle::Acknowledged { timeout_ms };
        }
        if let Some(settle_ms) = self.settle_ms {
            config.registration = RegistrationSettle::Delay { settle_ms };
        }
        if let Some(step_timeout_ms) = self.step_timeout_ms {
            config.step_timeout_ms = step_timeout_ms;
        }
    }

    pub fn load_configuration(&self) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::load_from_file(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => HarnessConfig::default(),
        };
        self.apply_overrides(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    pub fn load_scenario(&self) -> Result<Scenario> {
        if let Some(scenario) = Scenario::builtin(&self.scenario) {
            return Ok(scenario);
        }

        let path = Path::new(&self.scenario);
        if path.extension().map_or(false, |ext| ext == "toml") {
            return Scenario::load_from_file(path)
                .with_context(|| format!("loading scenario from {}", path.display()));
        }

        anyhow::bail!(
            "unknown scenario '{}' (built-in: {}, or a path to a .toml file)",
            self.scenario,
            BUILTIN_SCENARIOS.join(", ")
        )
    }
}

//! Relay harness entry point
//!
//! Exit status: 0 when every step passed, 1 on any failure or error, 2 when
//! interrupted with Ctrl-C.

use clap::Parser;
use tracing::{error, info, warn};

use relay_harness::{Harness, Scenario, BUILTIN_SCENARIOS, EXIT_FAILURE};

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    if cli.list {
        list_scenarios();
        return;
    }

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("Harness failed: {:#}", e);
            EXIT_FAILURE
        }
    };

    std::process::exit(code);
}

async fn run(cli: &Cli) -> anyhow::Result<i32> {
    let config = cli.load_configuration()?;
    let scenario = cli.load_scenario()?;

    let harness = Harness::new(config)?;
    info!("Relay: {}", harness.config().server_url);

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Interrupted, tearing down");
    };

    let handle = harness.spawn(scenario, interrupt)?;

    match handle.wait().await {
        Some(verdict) => {
            println!("{}", verdict);
            Ok(verdict.exit_code())
        }
        None => anyhow::bail!("run ended without a verdict"),
    }
}

/// Setup logging based on verbosity level; `RUST_LOG` wins when set
fn setup_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn list_scenarios() {
    for name in BUILTIN_SCENARIOS {
        if let Some(scenario) = Scenario::builtin(name) {
            println!("{:<16} {} ({} steps)", name, scenario.description, scenario.steps.len());
        }
    }
}

//! `between` entry point

use anyhow::Context;
use between_agent::logging::init_logging;
use between_agent::{
    load_agent_config, Agent, Args, ShutdownSignals, EXIT_FAILURE, EXIT_INTERRUPTED,
};
use between_core::firewall::render_ruleset;
use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("between: {:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = load_agent_config(&args).context("Failed to load configuration")?;

    if config.print_rules {
        print!("{}", render_ruleset(&config.redirect));
        return Ok(ExitCode::SUCCESS);
    }

    init_logging(&config.logging)?;

    let signals = ShutdownSignals::register().context("Failed to install signal handlers")?;
    let running = Agent::new(config).start().await?;
    running.serve(signals.recv()).await?;

    Ok(ExitCode::from(EXIT_INTERRUPTED))
}

mod cli;
mod config;
mod error;
mod fleet;
mod job;
mod logging;
mod orchestrator;
mod queue;
mod remote;
mod status_log;
#[cfg(test)]
mod testing;
mod utils;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            tool_config,
            input,
            output,
            adopt_id,
            name,
        } => {
            cli::handle_run(
                &config,
                tool_config.as_deref(),
                &input,
                &output,
                adopt_id.as_deref(),
                &name,
            )?;
        }
        Commands::Status {
            log_dir,
            follow,
            names,
        } => {
            logging::init_logging(None)?;
            cli::handle_status(&log_dir, follow, names)?;
        }
        Commands::Cancel {
            config,
            log_dir,
            name,
        } => {
            logging::init_logging(None)?;
            cli::handle_cancel(&config, log_dir.as_deref(), &name)?;
        }
    }

    Ok(())
}

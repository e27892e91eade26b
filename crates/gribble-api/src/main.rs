//! Gribble storage command-line entry point.
//!
//! Binary name: `gribblesv`
//!
//! Parses CLI arguments, loads configuration, opens and migrates the
//! database, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands, RunnerCommand};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = gribble_infra::config::load_config(&cli.config).await?;
    cli.storage.apply(&mut config);

    match cli.verbose {
        0 => {}
        1 => config.log.level = "info,gribble_infra=debug".to_string(),
        _ => config.log.level = "trace".to_string(),
    }
    gribble_observe::tracing_setup::init_tracing(&config.log)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    let state = AppState::init(&config).await?;
    let result = run(&state, cli.command, cli.json).await;
    state.shutdown().await;
    result
}

async fn run(state: &AppState, command: Commands, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Migrate => cli::migrate::migrate(state, json).await,

        Commands::Runner { action } => match action {
            RunnerCommand::Create {
                token,
                description,
                tags,
                run_untagged,
                locked,
                active,
                max_timeout,
            } => {
                let args = cli::runner::CreateRunnerArgs {
                    token,
                    description,
                    tags,
                    run_untagged,
                    locked,
                    active,
                    max_timeout,
                };
                cli::runner::create_runner(state, args, json).await
            }
            RunnerCommand::Show { token, deleted } => {
                cli::runner::show_runner(state, &token, deleted, json).await
            }
            RunnerCommand::Tag { token, tags } => {
                cli::runner::tag_runner(state, &token, tags, json).await
            }
            RunnerCommand::Touch { token } => cli::runner::touch_runner(state, &token, json).await,
            RunnerCommand::Retire { token } => {
                cli::runner::retire_runner(state, &token, json).await
            }
        },
    }
}

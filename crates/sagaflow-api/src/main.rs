//! Sagaflow command-line entry point.
//!
//! Binary name: `sagaflow`
//!
//! Parses CLI arguments, sets up tracing, loads the engine configuration and
//! dispatches to the flow subcommands.

mod cli;
mod handlers;

use clap::Parser;
use clap_complete::generate;

use sagaflow_infra::config::{default_config_path, load_engine_config};
use sagaflow_infra::resolve_data_dir;
use sagaflow_observe::tracing_setup::{init_tracing, shutdown_tracing, verbosity_directive};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "sagaflow", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing(verbosity_directive(cli.verbose, cli.quiet), cli.otel)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Validate { file } => cli::flow::validate(&file, cli.json),

        Commands::Plan { file } => cli::flow::plan(&file, cli.json),

        Commands::Run {
            file,
            includes,
            data,
            snapshot_dir,
        } => {
            let config_path = cli
                .config
                .unwrap_or_else(|| default_config_path(&resolve_data_dir()));
            let config = load_engine_config(&config_path).await;
            cli::flow::run(
                &file,
                &includes,
                data.as_deref(),
                snapshot_dir.as_deref(),
                config,
                cli.json,
            )
            .await
        }

        Commands::Inspect { file } => cli::flow::inspect(&file, cli.json).await,

        Commands::Completions { .. } => unreachable!("handled in main"),
    }
}

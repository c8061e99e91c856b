use anyhow::Result;
use clap::Parser;
use meetbot::{
    app,
    cli::{handle_agent_command, handle_jobs_command, handle_schedule_command, Cli, CliCommand},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let code = match cli.command {
        Some(CliCommand::Version) => {
            println!("meetbot {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(CliCommand::Schedule(args)) => handle_schedule_command(args),
        Some(CliCommand::Agent(args)) => handle_agent_command(args).await,
        Some(CliCommand::Jobs(args)) => {
            handle_jobs_command(args)?;
            return Ok(());
        }
        Some(CliCommand::Run) | None => {
            app::run_service().await?;
            return Ok(());
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

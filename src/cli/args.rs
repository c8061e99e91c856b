use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "meetbot")]
#[command(about = "Joins scheduled online meetings and records their audio", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Schedule a meeting to be joined after a delay
    Schedule(ScheduleCliArgs),
    /// Run the scheduler daemon (default)
    Run,
    /// Record one claimed job (started by the scheduler)
    #[command(hide = true)]
    Agent(AgentCliArgs),
    /// List scheduled and past jobs
    Jobs(JobsCliArgs),
    /// Print version information
    Version,
}

#[derive(ClapArgs, Debug)]
pub struct ScheduleCliArgs {
    /// Meeting link, e.g. https://meet.google.com/abc-defg-hij
    pub url: String,
    /// Minutes from now until the bot joins (positive integer)
    // Taken as a string so a bad value is reported like any other
    // validation error.
    #[arg(allow_hyphen_values = true)]
    pub delay_minutes: String,
}

#[derive(ClapArgs, Debug)]
pub struct AgentCliArgs {
    /// Job id in the store
    pub job_id: i64,
    /// Meeting link of the job
    pub url: String,
}

#[derive(ClapArgs, Debug)]
pub struct JobsCliArgs {
    /// Maximum number of jobs to show
    #[arg(short, long, default_value = "20")]
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schedule() {
        let cli = Cli::try_parse_from(["meetbot", "schedule", "https://meet.google.com/a-b-c", "5"])
            .unwrap();
        match cli.command {
            Some(CliCommand::Schedule(args)) => {
                assert_eq!(args.url, "https://meet.google.com/a-b-c");
                assert_eq!(args.delay_minutes, "5");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_agent() {
        let cli = Cli::try_parse_from(["meetbot", "-v", "agent", "12", "https://meet.google.com/a-b-c"])
            .unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Some(CliCommand::Agent(AgentCliArgs { job_id: 12, .. }))
        ));
    }

    #[test]
    fn test_default_is_daemon() {
        let cli = Cli::try_parse_from(["meetbot"]).unwrap();
        assert!(cli.command.is_none());
    }
}

mod args;
pub mod agent;
pub mod jobs;
pub mod schedule;

pub use agent::handle_agent_command;
pub use args::{AgentCliArgs, Cli, CliCommand, JobsCliArgs, ScheduleCliArgs};
pub use jobs::handle_jobs_command;
pub use schedule::{handle_schedule_command, ValidationError};

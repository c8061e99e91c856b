use anyhow::Result;
use chrono::{Local, TimeZone};

use crate::db::{JobStore, MeetingJob};

use super::args::JobsCliArgs;

pub fn handle_jobs_command(args: JobsCliArgs) -> Result<()> {
    let store = JobStore::open_default()?;
    let jobs = store.list(args.limit)?;

    if jobs.is_empty() {
        println!("No meetings scheduled.");
        return Ok(());
    }

    println!("Found {} job(s):\n", jobs.len());
    for job in jobs {
        print_job(&job);
    }

    println!("\nTo schedule a meeting, use: meetbot schedule <URL> <DELAY_MINUTES>");
    Ok(())
}

fn print_job(job: &MeetingJob) {
    println!("ID: {}", job.id);
    println!("URL: {}", job.meeting_url);
    println!("Status: {} (attempts: {})", job.status, job.attempts);
    println!("Join at: {}", format_ms(job.join_at));
    if let Some(beat) = job.last_heartbeat {
        println!("Last heartbeat: {}", format_ms(beat));
    }
    if let Some(path) = &job.recording_path {
        println!("Recording: {}", path);
    }
    if let Some(url) = &job.recording_url {
        println!("Uploaded: {}", url);
    }
    println!("---");
}

fn format_ms(ms: i64) -> String {
    Local
        .timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

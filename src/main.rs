mod accesslog;
mod cli;
mod config;
mod daemon;
mod http;
mod reconcile;
mod roster;
mod scheduler;

use anyhow::Result;
use clap::Parser;
use console::Style;

use crate::accesslog::ScanEvent;
use crate::cli::{Cli, Command};
use crate::config::RollcallConfig;
use crate::reconcile::WindowCloseOutcome;
use crate::roster::Member;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = RollcallConfig::load(cli.config.as_deref())?;
    if cli.dry_run {
        config.dry_run = true;
    }

    match cli.command {
        Command::Run { now } => {
            let run_now = now || config.run_immediately;
            daemon::run(config, run_now).await
        }
        Command::Mark => {
            let outcome = daemon::mark_once(config).await?;
            print_outcome(&outcome);
            Ok(())
        }
        Command::Roster => {
            let roster = daemon::fetch_roster(config).await?;
            print_roster(&roster);
            Ok(())
        }
        Command::Scans => {
            let events = daemon::fetch_window_scans(config).await?;
            print_scans(&events);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "rollcall=debug" } else { "rollcall=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

fn print_outcome(outcome: &WindowCloseOutcome) {
    let green = Style::new().green().bold();
    let yellow = Style::new().yellow().bold();
    match outcome {
        WindowCloseOutcome::NotASchoolDay { present, threshold } => {
            println!(
                "{} only {present} present (threshold {threshold}); treated as a non-school day, nothing written",
                yellow.apply_to("skipped")
            );
        }
        WindowCloseOutcome::SweepArmed { absent, marked } => {
            println!(
                "{} {absent} member(s) marked absent ({} written, {} failed)",
                green.apply_to("done"),
                marked.success_count,
                marked.failure_count
            );
        }
    }
}

fn print_roster(roster: &[Member]) {
    let bold = Style::new().bold();
    println!("{} members eligible today", bold.apply_to(roster.len()));
    for member in roster {
        println!("  {:<8} {:<28} {}", member.id, member.display_name, member.status);
    }
}

fn print_scans(events: &[ScanEvent]) {
    let bold = Style::new().bold();
    let mut seen = std::collections::HashSet::new();
    let distinct: Vec<&ScanEvent> = events
        .iter()
        .filter(|e| seen.insert(e.actor_id.clone()))
        .collect();
    println!(
        "{} scans from {} distinct badges in the attendance window",
        events.len(),
        bold.apply_to(distinct.len())
    );
    for event in distinct {
        println!(
            "  {:<10} {:<28} first seen {}",
            event.actor_id,
            event.actor_name,
            event
                .timestamp
                .with_timezone(&chrono::Local)
                .format("%H:%M:%S")
        );
    }
}

//! Wires the gateways, engine, and scheduler into the daily attendance
//! cycle: a daily mark job at window close that, on a school day, chains a
//! bounded recurring late-arrival sweep which cancels itself when everyone
//! is accounted for or dismissal passes.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use tracing::{info, warn};

use crate::accesslog::{AccessLogGateway, ScanEvent, ScanSource};
use crate::config::RollcallConfig;
use crate::reconcile::{AttendanceWindow, ReconcileEngine, SweepOutcome, WindowCloseOutcome};
use crate::roster::{
    ChangeCache, Member, ProfileCache, RosterApi, RosterAuth, RosterGateway, RosterOptions,
};
use crate::scheduler::{JobCallback, Schedule, Scheduler};

/// Registry name of the daily window-close job.
pub const MARK_JOB: &str = "attendance-mark";
/// Registry name of the recurring late-arrival sweep.
pub const SWEEP_JOB: &str = "late-arrival-sweep";

type Engine = ReconcileEngine<RosterGateway, AccessLogGateway>;

struct Daemon {
    roster: Arc<RosterGateway>,
    scans: Arc<AccessLogGateway>,
    engine: Arc<Engine>,
    config: RollcallConfig,
}

fn build(config: RollcallConfig) -> Result<Daemon> {
    let window = config.window()?;
    let auth = RosterAuth::new(
        config.roster.base_url.as_str(),
        config.roster.username.as_str(),
        config.roster.password.as_str(),
    );
    let roster = Arc::new(RosterGateway::new(
        config.roster.base_url.as_str(),
        auth,
        RosterOptions {
            location_pattern: config.location_pattern()?,
            fan_out_limit: config.fan_out_limit,
            restore_change_kinds: config.restore_change_kinds()?,
            dry_run: config.dry_run,
        },
        ProfileCache::new(),
        ChangeCache::new(),
    ));
    let scans = Arc::new(AccessLogGateway::new(
        config.access_log.base_url.as_str(),
        config.access_log.token.as_str(),
        config.access_log.page_size,
        config.fan_out_limit,
    ));
    let engine = Arc::new(ReconcileEngine::new(
        roster.clone(),
        scans.clone(),
        window,
        config.attendance.present_threshold,
        config.match_mode()?,
    ));
    Ok(Daemon {
        roster,
        scans,
        engine,
        config,
    })
}

/// Run the scheduler daemon until a termination signal arrives, then drain.
pub async fn run(config: RollcallConfig, run_now: bool) -> Result<()> {
    let daemon = build(config)?;
    let window = daemon.config.window()?;
    let scheduler = Scheduler::new();

    let mark = mark_callback(
        daemon.roster.clone(),
        daemon.engine.clone(),
        scheduler.clone(),
        window,
        daemon.config.sweep_interval(),
    );
    scheduler
        .schedule_job(MARK_JOB, Schedule::Daily { at: window.end }, mark, run_now)
        .context("the mark job could not be scheduled")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = tokio::spawn(scheduler.clone().run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the termination signal")?;
    info!("termination signal received, draining scheduler");
    let _ = shutdown_tx.send(true);
    runner.await.context("scheduler task panicked")?;
    Ok(())
}

/// One-shot window-close evaluation (the `mark` subcommand). The sweep is
/// the daemon's business; this only reports what the evaluation decided.
pub async fn mark_once(config: RollcallConfig) -> Result<WindowCloseOutcome> {
    let daemon = build(config)?;
    daemon.roster.authenticate().await?;
    daemon.engine.evaluate_window_close(Local::now()).await
}

/// Fetch today's eligible roster (the `roster` subcommand).
pub async fn fetch_roster(config: RollcallConfig) -> Result<Vec<Member>> {
    let daemon = build(config)?;
    daemon.roster.authenticate().await?;
    let roster = daemon
        .roster
        .eligible_roster(Local::now().date_naive())
        .await?;
    Ok(roster)
}

/// Fetch the scans inside today's attendance window (the `scans` subcommand).
pub async fn fetch_window_scans(config: RollcallConfig) -> Result<Vec<ScanEvent>> {
    let daemon = build(config)?;
    let day = daemon.config.window()?.on_date(Local::now().date_naive())?;
    let events = daemon
        .scans
        .scan_events(day.start.with_timezone(&Utc), day.end.with_timezone(&Utc))
        .await?;
    Ok(events)
}

/// The daily mark job: authenticate, evaluate the window, and on a school
/// day arm the sweep bounded by today's dismissal.
fn mark_callback<R, S>(
    roster: Arc<R>,
    engine: Arc<ReconcileEngine<R, S>>,
    scheduler: Arc<Scheduler>,
    window: AttendanceWindow,
    sweep_interval: chrono::Duration,
) -> JobCallback
where
    R: RosterApi + 'static,
    S: ScanSource + 'static,
{
    Arc::new(move || {
        let roster = roster.clone();
        let engine = engine.clone();
        let scheduler = scheduler.clone();
        Box::pin(async move {
            roster
                .authenticate()
                .await
                .context("roster authentication failed")?;
            match engine.evaluate_window_close(Local::now()).await? {
                WindowCloseOutcome::NotASchoolDay { .. } => Ok(()),
                WindowCloseOutcome::SweepArmed { absent, .. } => {
                    if absent == 0 {
                        info!("everyone accounted for at window close; no sweep needed");
                        return Ok(());
                    }
                    let day = window.on_date(Local::now().date_naive())?;
                    let sweep = sweep_callback(engine.clone(), scheduler.clone());
                    let installed = scheduler.schedule_job(
                        SWEEP_JOB,
                        Schedule::Every {
                            interval: sweep_interval,
                            until: Some(day.dismissal),
                        },
                        sweep,
                        false,
                    );
                    if installed.is_none() {
                        warn!("a sweep invocation is still pending; keeping the existing job");
                    }
                    Ok(())
                }
            }
        })
    })
}

/// One sweep tick; cancels its own job once the engine reports the sweep
/// finished.
fn sweep_callback<R, S>(engine: Arc<ReconcileEngine<R, S>>, scheduler: Arc<Scheduler>) -> JobCallback
where
    R: RosterApi + 'static,
    S: ScanSource + 'static,
{
    Arc::new(move || {
        let engine = engine.clone();
        let scheduler = scheduler.clone();
        Box::pin(async move {
            match engine.sweep_tick(Local::now()).await? {
                SweepOutcome::Continue { promoted, remaining } => {
                    info!(promoted, remaining, "sweep tick complete");
                    Ok(())
                }
                SweepOutcome::Finished { reason, remaining } => {
                    info!(?reason, remaining, "sweep finished");
                    scheduler.cancel(SWEEP_JOB);
                    Ok(())
                }
            }
        })
    })
}

//! Named-job scheduler.
//!
//! Jobs live in an owned map keyed by name. The invariant enforced here is
//! mutual exclusion per name: at most one invocation of a named job is in
//! flight at any time, guarded by a per-job flag rather than by locking the
//! data the callbacks touch. Cross-job concurrency is unconstrained.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use futures_util::future::BoxFuture;
use tokio::sync::{Notify, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::schedule::{Schedule, next_run};

/// A job body. Invoked once per firing; each call builds a fresh future.
pub type JobCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Snapshot returned by [`Scheduler::schedule_job`].
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub name: String,
    pub next_run: Option<DateTime<Local>>,
}

struct JobEntry {
    schedule: Schedule,
    callback: JobCallback,
    next_run: Option<DateTime<Local>>,
    running: Arc<AtomicBool>,
}

/// Shared in-flight bookkeeping, cloned into every spawned invocation so
/// the drain can await the last one.
struct Inflight {
    count: AtomicUsize,
    idle: Notify,
}

pub struct Scheduler {
    jobs: Mutex<HashMap<String, JobEntry>>,
    inflight: Arc<Inflight>,
    draining: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            inflight: Arc::new(Inflight {
                count: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            draining: AtomicBool::new(false),
        })
    }

    /// Install the named job, replacing any idle job of the same name.
    ///
    /// Returns `None` (logged, not an error) when the name still has an
    /// invocation in flight; the running invocation is left untouched.
    /// With `run_immediately` the callback is additionally invoked once
    /// right away, outside the normal schedule.
    pub fn schedule_job(
        &self,
        name: &str,
        schedule: Schedule,
        callback: JobCallback,
        run_immediately: bool,
    ) -> Option<JobHandle> {
        let next = next_run(&schedule, Local::now());
        let running = Arc::new(AtomicBool::new(false));
        {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(existing) = jobs.get(name) {
                if existing.running.load(Ordering::SeqCst) {
                    warn!(job = name, "job still has a pending invocation; scheduling request ignored");
                    return None;
                }
                info!(job = name, "replacing existing job");
                jobs.remove(name);
            }
            jobs.insert(
                name.to_string(),
                JobEntry {
                    schedule,
                    callback: callback.clone(),
                    next_run: next,
                    running: running.clone(),
                },
            );
        }
        info!(job = name, next_run = ?next, "job scheduled");

        if run_immediately {
            self.spawn_invocation(name.to_string(), callback, running);
        }
        Some(JobHandle {
            name: name.to_string(),
            next_run: next,
        })
    }

    /// Remove the named job from the active set. An in-flight invocation
    /// finishes undisturbed; only future ticks are suppressed.
    pub fn cancel(&self, name: &str) -> bool {
        let removed = self.jobs.lock().unwrap().remove(name).is_some();
        if removed {
            info!(job = name, "job cancelled");
        }
        removed
    }

    /// Whether a job of this name is currently installed.
    pub fn contains(&self, name: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(name)
    }

    /// Drive the registry until `shutdown` flips to true, then drain:
    /// no new invocations start and in-flight ones are awaited.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler started");
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(Local::now()),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.draining.store(true, Ordering::SeqCst);
        info!("scheduler draining in-flight invocations");
        self.drain().await;
        info!("scheduler stopped");
    }

    /// Fire every due job. A job whose schedule is exhausted fires its final
    /// invocation and is then dropped from the registry.
    fn tick(&self, now: DateTime<Local>) {
        if self.draining.load(Ordering::SeqCst) {
            return;
        }
        let mut due = Vec::new();
        let mut exhausted = Vec::new();
        {
            let mut jobs = self.jobs.lock().unwrap();
            for (name, entry) in jobs.iter_mut() {
                let Some(at) = entry.next_run else {
                    exhausted.push(name.clone());
                    continue;
                };
                if at <= now {
                    entry.next_run = next_run(&entry.schedule, now);
                    due.push((name.clone(), entry.callback.clone(), entry.running.clone()));
                    if entry.next_run.is_none() {
                        exhausted.push(name.clone());
                    }
                }
            }
            for name in exhausted {
                jobs.remove(&name);
                info!(job = %name, "schedule exhausted, job removed");
            }
        }
        for (name, callback, running) in due {
            self.spawn_invocation(name, callback, running);
        }
    }

    fn spawn_invocation(&self, name: String, callback: JobCallback, running: Arc<AtomicBool>) {
        if self.draining.load(Ordering::SeqCst) {
            warn!(job = %name, "scheduler is draining; invocation refused");
            return;
        }
        if running.swap(true, Ordering::SeqCst) {
            warn!(job = %name, "previous invocation still running; this firing is skipped");
            return;
        }
        let inflight = self.inflight.clone();
        inflight.count.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let run_id = Uuid::new_v4();
            info!(job = %name, %run_id, "invocation started");
            match callback().await {
                Ok(()) => info!(job = %name, %run_id, "invocation succeeded"),
                Err(e) => error!(job = %name, %run_id, "invocation failed: {e:#}"),
            }
            running.store(false, Ordering::SeqCst);
            if inflight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
                inflight.idle.notify_one();
            }
        });
    }

    async fn drain(&self) {
        loop {
            if self.inflight.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            self.inflight.idle.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::Duration;

    use super::*;

    fn noop() -> JobCallback {
        Arc::new(|| Box::pin(async { Ok::<_, anyhow::Error>(()) }))
    }

    fn counting(counter: Arc<AtomicUsize>) -> JobCallback {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    /// A daily schedule that will not fire during the test.
    fn far_daily() -> Schedule {
        Schedule::Daily {
            at: (Local::now() + Duration::hours(12)).time(),
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        panic!("condition not reached within one second");
    }

    #[tokio::test]
    async fn second_schedule_while_invocation_pending_returns_none() {
        let scheduler = Scheduler::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let rx = Arc::new(tokio::sync::Mutex::new(Some(rx)));
        let gated: JobCallback = Arc::new(move || {
            let rx = rx.clone();
            Box::pin(async move {
                if let Some(rx) = rx.lock().await.take() {
                    let _ = rx.await;
                }
                Ok(())
            })
        });

        let first = scheduler.schedule_job("mark", far_daily(), gated, true);
        assert!(first.is_some());

        // The invocation is in flight (its running flag is set before spawn
        // returns), so the same name is refused without cancelling it.
        let second = scheduler.schedule_job("mark", far_daily(), noop(), false);
        assert!(second.is_none());
        assert!(scheduler.contains("mark"));

        tx.send(()).unwrap();
        wait_for(|| scheduler.schedule_job("mark", far_daily(), noop(), false).is_some()).await;
    }

    #[tokio::test]
    async fn idle_job_of_same_name_is_replaced() {
        let scheduler = Scheduler::new();
        let first = scheduler.schedule_job("mark", far_daily(), noop(), false).unwrap();
        assert_eq!(first.name, "mark");
        assert!(first.next_run.is_some());
        assert!(scheduler.schedule_job("mark", far_daily(), noop(), false).is_some());
        assert!(scheduler.contains("mark"));
    }

    #[tokio::test]
    async fn cancel_removes_the_job() {
        let scheduler = Scheduler::new();
        scheduler.schedule_job("sweep", far_daily(), noop(), false);
        assert!(scheduler.cancel("sweep"));
        assert!(!scheduler.contains("sweep"));
        assert!(!scheduler.cancel("sweep"));
    }

    #[tokio::test]
    async fn run_immediately_invokes_outside_the_schedule() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_job("mark", far_daily(), counting(counter.clone()), true);
        wait_for(|| counter.load(Ordering::SeqCst) == 1).await;
        // The schedule itself stays armed for its daily time.
        assert!(scheduler.contains("mark"));
    }

    #[tokio::test]
    async fn due_jobs_fire_on_tick() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_job(
            "sweep",
            Schedule::Every {
                interval: Duration::milliseconds(10),
                until: None,
            },
            counting(counter.clone()),
            false,
        );

        // Tick repeatedly: a firing is skipped while the previous invocation
        // still holds the running flag, so one tick is not guaranteed to be
        // one firing.
        let mut offset = 20;
        for _ in 0..200 {
            scheduler.tick(Local::now() + Duration::milliseconds(offset));
            offset += 20;
            if counter.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        assert!(counter.load(Ordering::SeqCst) >= 2);
        assert!(scheduler.contains("sweep"));
    }

    #[tokio::test]
    async fn failed_invocations_do_not_cancel_future_ticks() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let failing: JobCallback = {
            let counter = counter.clone();
            Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("upstream offline")
                })
            })
        };
        scheduler.schedule_job(
            "mark",
            Schedule::Every {
                interval: Duration::milliseconds(10),
                until: None,
            },
            failing,
            false,
        );

        let mut offset = 20;
        for _ in 0..200 {
            scheduler.tick(Local::now() + Duration::milliseconds(offset));
            offset += 20;
            if counter.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        assert!(counter.load(Ordering::SeqCst) >= 2, "the job stopped firing after a failure");
        assert!(scheduler.contains("mark"));
    }

    #[tokio::test]
    async fn bounded_schedule_fires_a_final_time_then_disappears() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_job(
            "sweep",
            Schedule::Every {
                interval: Duration::milliseconds(30),
                until: Some(Local::now() + Duration::milliseconds(45)),
            },
            counting(counter.clone()),
            false,
        );

        // First firing is inside the bound; re-arming would pass it, so the
        // job fires once more and is removed.
        scheduler.tick(Local::now() + Duration::milliseconds(35));
        wait_for(|| counter.load(Ordering::SeqCst) == 1).await;
        assert!(!scheduler.contains("sweep"));
    }

    #[tokio::test]
    async fn shutdown_drains_inflight_invocations() {
        let scheduler = Scheduler::new();
        let finished = Arc::new(AtomicBool::new(false));
        let slow: JobCallback = {
            let finished = finished.clone();
            Arc::new(move || {
                let finished = finished.clone();
                Box::pin(async move {
                    tokio::time::sleep(StdDuration::from_millis(80)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                })
            })
        };
        scheduler.schedule_job("slow", far_daily(), slow, true);

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(scheduler.clone().run(rx));
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        tx.send(true).unwrap();
        run.await.unwrap();
        assert!(
            finished.load(Ordering::SeqCst),
            "run() returned before the in-flight invocation finished"
        );
    }
}

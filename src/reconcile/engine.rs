//! The reconciliation engine: window-close evaluation and the late-arrival
//! sweep. Two states per school day; the sweep is terminal once exited.
//!
//! The engine is generic over its collaborators so tests can observe write
//! calls with doubles. `now` is always a parameter: the daemon passes the
//! wall clock, tests pass fixed instants.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::accesslog::ScanSource;
use crate::roster::{AttendanceStatus, MarkResult, Member, RosterApi};

use super::window::{AttendanceWindow, MatchMode};

/// Outcome of the window-close evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCloseOutcome {
    /// Present count fell below the school-day threshold: nothing was
    /// written and no sweep should be armed.
    NotASchoolDay { present: usize, threshold: usize },
    /// Absent marks were written; the late-arrival sweep should be armed.
    SweepArmed { absent: usize, marked: MarkResult },
}

/// Outcome of one late-arrival sweep tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Members may still arrive; keep the recurring job.
    Continue { promoted: usize, remaining: usize },
    /// The sweep is over; the recurring job should cancel itself.
    Finished { reason: SweepEnd, remaining: usize },
}

/// Why a sweep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepEnd {
    /// Every member was accounted for.
    AllAccounted,
    /// The school-dismissal deadline passed first.
    DismissalPassed,
}

pub struct ReconcileEngine<R, S> {
    roster: Arc<R>,
    scans: Arc<S>,
    window: AttendanceWindow,
    threshold: usize,
    match_mode: MatchMode,
    /// Members not yet confirmed present today. Shrinks monotonically.
    absent: Mutex<HashMap<String, Member>>,
}

impl<R: RosterApi, S: ScanSource> ReconcileEngine<R, S> {
    pub fn new(
        roster: Arc<R>,
        scans: Arc<S>,
        window: AttendanceWindow,
        threshold: usize,
        match_mode: MatchMode,
    ) -> Self {
        Self {
            roster,
            scans,
            window,
            threshold,
            match_mode,
            absent: Mutex::new(HashMap::new()),
        }
    }

    /// Members still unaccounted for.
    pub async fn absent_count(&self) -> usize {
        self.absent.lock().await.len()
    }

    /// Window-close evaluation: compute the absent set as the eligible
    /// roster minus the distinct actors scanned inside the attendance
    /// window, then either abstain (below the school-day threshold) or
    /// write Absent for the whole set and arm the sweep.
    pub async fn evaluate_window_close(&self, now: DateTime<Local>) -> Result<WindowCloseOutcome> {
        let day = self.window.on_date(now.date_naive())?;
        let roster = self
            .roster
            .eligible_roster(now.date_naive())
            .await
            .context("failed to fetch the eligible roster")?;
        let events = self
            .scans
            .scan_events(to_utc(day.start), to_utc(day.end))
            .await
            .context("failed to fetch scan events for the attendance window")?;

        let seen: HashSet<String> = events.iter().map(|e| self.match_mode.actor_key(e)).collect();

        // Duplicate roster entries collapse by id, last seen wins. Scans
        // from badges matching no member fall out of the set difference.
        let mut by_id: HashMap<String, Member> = HashMap::new();
        for member in roster {
            by_id.insert(member.id.clone(), member);
        }
        let total = by_id.len();

        let absent: HashMap<String, Member> = by_id
            .into_values()
            .filter(|m| !seen.contains(&self.match_mode.member_key(m)))
            .map(|m| (m.id.clone(), m))
            .collect();
        let present = total - absent.len();

        if present < self.threshold {
            info!(
                present,
                threshold = self.threshold,
                "present count below threshold: not a school day, no writes"
            );
            return Ok(WindowCloseOutcome::NotASchoolDay {
                present,
                threshold: self.threshold,
            });
        }

        let to_mark: Vec<Member> = absent.values().cloned().collect();
        let marked = self.roster.mark_members(AttendanceStatus::Absent, &to_mark).await;
        if !marked.is_clean() {
            warn!(
                failed = marked.failure_count,
                "some absent marks failed; see the per-member log entries"
            );
        }
        info!(present, absent = absent.len(), "attendance window closed");

        let count = absent.len();
        *self.absent.lock().await = absent;
        Ok(WindowCloseOutcome::SweepArmed {
            absent: count,
            marked,
        })
    }

    /// One late-arrival sweep tick: fetch scans since window close, promote
    /// matching members to LateArrival, and report whether the sweep should
    /// keep running. A member removed from the set is never reconsidered.
    pub async fn sweep_tick(&self, now: DateTime<Local>) -> Result<SweepOutcome> {
        let day = self.window.on_date(now.date_naive())?;
        let mut absent = self.absent.lock().await;
        if absent.is_empty() {
            return Ok(SweepOutcome::Finished {
                reason: SweepEnd::AllAccounted,
                remaining: 0,
            });
        }

        let events = self
            .scans
            .scan_events(to_utc(day.end), to_utc(now))
            .await
            .context("failed to fetch scan events for the sweep")?;
        let seen: HashSet<String> = events.iter().map(|e| self.match_mode.actor_key(e)).collect();

        let arrivals: Vec<Member> = absent
            .values()
            .filter(|m| seen.contains(&self.match_mode.member_key(m)))
            .cloned()
            .collect();
        let promoted = arrivals.len();
        if promoted > 0 {
            let marked = self
                .roster
                .mark_members(AttendanceStatus::LateArrival, &arrivals)
                .await;
            if !marked.is_clean() {
                warn!(failed = marked.failure_count, "some late-arrival marks failed");
            }
            // Matched members leave the set whatever the write outcome; the
            // set only ever shrinks, and failures were logged with context.
            for member in &arrivals {
                absent.remove(&member.id);
            }
            info!(promoted, remaining = absent.len(), "late arrivals promoted");
        }

        if absent.is_empty() {
            Ok(SweepOutcome::Finished {
                reason: SweepEnd::AllAccounted,
                remaining: 0,
            })
        } else if now >= day.dismissal {
            info!(
                remaining = absent.len(),
                "dismissal passed with members still absent"
            );
            Ok(SweepOutcome::Finished {
                reason: SweepEnd::DismissalPassed,
                remaining: absent.len(),
            })
        } else {
            Ok(SweepOutcome::Continue {
                promoted,
                remaining: absent.len(),
            })
        }
    }
}

fn to_utc(t: DateTime<Local>) -> DateTime<Utc> {
    t.with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    use crate::accesslog::ScanEvent;
    use crate::http::ApiError;

    use super::*;

    struct MockRoster {
        members: Vec<Member>,
        marks: StdMutex<Vec<(AttendanceStatus, Vec<String>)>>,
    }

    impl MockRoster {
        fn new(members: Vec<Member>) -> Self {
            Self {
                members,
                marks: StdMutex::new(Vec::new()),
            }
        }

        fn marks(&self) -> Vec<(AttendanceStatus, Vec<String>)> {
            self.marks.lock().unwrap().clone()
        }
    }

    impl RosterApi for MockRoster {
        async fn authenticate(&self) -> Result<(), ApiError> {
            Ok(())
        }

        async fn eligible_roster(
            &self,
            _date: chrono::NaiveDate,
        ) -> Result<Vec<Member>, ApiError> {
            Ok(self.members.clone())
        }

        async fn mark_members(&self, status: AttendanceStatus, members: &[Member]) -> MarkResult {
            let mut ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
            ids.sort();
            self.marks.lock().unwrap().push((status, ids));
            MarkResult {
                success_count: members.len(),
                failure_count: 0,
            }
        }
    }

    struct MockScans {
        batches: StdMutex<VecDeque<Vec<ScanEvent>>>,
        calls: StdMutex<usize>,
    }

    impl MockScans {
        fn new(batches: Vec<Vec<&str>>) -> Self {
            let batches = batches
                .into_iter()
                .map(|ids| ids.into_iter().map(scan).collect())
                .collect();
            Self {
                batches: StdMutex::new(batches),
                calls: StdMutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl ScanSource for MockScans {
        async fn scan_events(
            &self,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<ScanEvent>, ApiError> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn scan(id: &str) -> ScanEvent {
        ScanEvent {
            actor_id: id.to_string(),
            actor_name: format!("badge-{id}"),
            timestamp: Utc::now(),
        }
    }

    fn member(id: &str, name: &str) -> Member {
        Member {
            id: id.into(),
            display_name: name.into(),
            status: AttendanceStatus::Present,
        }
    }

    fn window() -> AttendanceWindow {
        AttendanceWindow::parse("07:30", "08:15", "15:00").unwrap()
    }

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 9, hour, minute, 0).unwrap()
    }

    fn engine(
        roster: Vec<Member>,
        scans: Vec<Vec<&str>>,
        threshold: usize,
    ) -> (
        Arc<MockRoster>,
        Arc<MockScans>,
        ReconcileEngine<MockRoster, MockScans>,
    ) {
        let roster = Arc::new(MockRoster::new(roster));
        let scans = Arc::new(MockScans::new(scans));
        let engine = ReconcileEngine::new(
            roster.clone(),
            scans.clone(),
            window(),
            threshold,
            MatchMode::ExternalId,
        );
        (roster, scans, engine)
    }

    fn trio() -> Vec<Member> {
        vec![member("1", "Ada"), member("2", "Ben"), member("3", "Cal")]
    }

    #[tokio::test]
    async fn below_threshold_means_no_school_day_and_no_writes() {
        let (roster, _, engine) = engine(trio(), vec![vec!["1"]], 2);

        let outcome = engine.evaluate_window_close(at(8, 15)).await.unwrap();
        assert_eq!(
            outcome,
            WindowCloseOutcome::NotASchoolDay {
                present: 1,
                threshold: 2
            }
        );
        assert!(roster.marks().is_empty(), "no write may happen below threshold");
        assert_eq!(engine.absent_count().await, 0, "sweep must not be armed");
    }

    #[tokio::test]
    async fn marks_absent_set_and_arms_sweep() {
        let (roster, _, engine) = engine(trio(), vec![vec!["1"], vec!["2"]], 1);

        let outcome = engine.evaluate_window_close(at(8, 15)).await.unwrap();
        match outcome {
            WindowCloseOutcome::SweepArmed { absent, marked } => {
                assert_eq!(absent, 2);
                assert_eq!(marked.success_count, 2);
            }
            other => panic!("expected SweepArmed, got {other:?}"),
        }
        assert_eq!(
            roster.marks(),
            vec![(AttendanceStatus::Absent, vec!["2".to_string(), "3".to_string()])]
        );

        // A later tick sees member 2 scan in and promotes them.
        let outcome = engine.sweep_tick(at(9, 0)).await.unwrap();
        assert_eq!(
            outcome,
            SweepOutcome::Continue {
                promoted: 1,
                remaining: 1
            }
        );
        let marks = roster.marks();
        assert_eq!(
            marks.last().unwrap(),
            &(AttendanceStatus::LateArrival, vec!["2".to_string()])
        );
        assert_eq!(engine.absent_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_roster_entries_collapse_by_id() {
        let roster = vec![
            member("1", "Ada"),
            member("1", "Ada (homeroom B)"),
            member("2", "Ben"),
            member("3", "Cal"),
        ];
        let (_, _, engine) = engine(roster, vec![vec!["1", "3"]], 2);

        let outcome = engine.evaluate_window_close(at(8, 15)).await.unwrap();
        // |R| = 3 unique, |R ∩ A| = 2, so exactly one member is absent.
        match outcome {
            WindowCloseOutcome::SweepArmed { absent, .. } => assert_eq!(absent, 1),
            other => panic!("expected SweepArmed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_badges_are_ignored() {
        let (_, _, engine) = engine(trio(), vec![vec!["1", "visitor-99", "staff-7"]], 1);

        let outcome = engine.evaluate_window_close(at(8, 15)).await.unwrap();
        match outcome {
            WindowCloseOutcome::SweepArmed { absent, .. } => assert_eq!(absent, 2),
            other => panic!("expected SweepArmed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_finishes_when_everyone_is_accounted_for() {
        let (_, scans, engine) = engine(trio(), vec![vec!["1"], vec!["2", "3"]], 1);

        engine.evaluate_window_close(at(8, 15)).await.unwrap();
        let outcome = engine.sweep_tick(at(9, 0)).await.unwrap();
        assert_eq!(
            outcome,
            SweepOutcome::Finished {
                reason: SweepEnd::AllAccounted,
                remaining: 0
            }
        );

        // The next tick short-circuits without another fetch.
        let fetches = scans.calls();
        let outcome = engine.sweep_tick(at(9, 30)).await.unwrap();
        assert_eq!(
            outcome,
            SweepOutcome::Finished {
                reason: SweepEnd::AllAccounted,
                remaining: 0
            }
        );
        assert_eq!(scans.calls(), fetches);
    }

    #[tokio::test]
    async fn sweep_finishes_at_dismissal_with_members_still_absent() {
        let (_, _, engine) = engine(trio(), vec![vec!["1"], vec![]], 1);

        engine.evaluate_window_close(at(8, 15)).await.unwrap();
        let outcome = engine.sweep_tick(at(15, 30)).await.unwrap();
        assert_eq!(
            outcome,
            SweepOutcome::Finished {
                reason: SweepEnd::DismissalPassed,
                remaining: 2
            }
        );
    }

    #[tokio::test]
    async fn sweep_never_promotes_a_member_twice() {
        let ids = ["1", "2", "3", "4", "5", "6"];
        let mut rng = StdRng::seed_from_u64(17);

        for _ in 0..10 {
            // Random tick batches drawn from the full id set, repeats and all.
            let mut batches: Vec<Vec<&str>> = vec![vec!["1"]]; // window batch
            for _ in 0..6 {
                let mut pool: Vec<&str> = ids.to_vec();
                pool.shuffle(&mut rng);
                let take = rng.random_range(0..=ids.len());
                batches.push(pool.into_iter().take(take).collect());
            }

            let roster = ids.iter().map(|&id| member(id, id)).collect();
            let (roster_mock, _, engine) = engine_with(roster, batches);

            engine.evaluate_window_close(at(8, 15)).await.unwrap();
            let mut remaining_before = engine.absent_count().await;
            for minute in 0..6 {
                let outcome = engine.sweep_tick(at(9, minute)).await.unwrap();
                let remaining = engine.absent_count().await;
                assert!(remaining <= remaining_before, "absent set grew");
                remaining_before = remaining;
                if matches!(outcome, SweepOutcome::Finished { .. }) {
                    break;
                }
            }

            // No id may appear in more than one LateArrival batch.
            let mut promoted: Vec<String> = roster_mock
                .marks()
                .into_iter()
                .filter(|(status, _)| *status == AttendanceStatus::LateArrival)
                .flat_map(|(_, ids)| ids)
                .collect();
            let total = promoted.len();
            promoted.sort();
            promoted.dedup();
            assert_eq!(total, promoted.len(), "a member was promoted twice");
        }
    }

    fn engine_with(
        roster: Vec<Member>,
        batches: Vec<Vec<&str>>,
    ) -> (
        Arc<MockRoster>,
        Arc<MockScans>,
        ReconcileEngine<MockRoster, MockScans>,
    ) {
        engine(roster, batches, 1)
    }

    #[tokio::test]
    async fn display_name_mode_matches_case_insensitively() {
        let roster = vec![member("1", "Ada Lovelace"), member("2", "Ben Ortiz")];
        let roster_mock = Arc::new(MockRoster::new(roster));
        let scans = Arc::new(MockScans::new(vec![vec![]]));
        // The window batch scans by name, not id.
        scans.batches.lock().unwrap()[0] = vec![ScanEvent {
            actor_id: "badge-0417".into(),
            actor_name: "ADA LOVELACE".into(),
            timestamp: Utc::now(),
        }];
        let engine = ReconcileEngine::new(
            roster_mock.clone(),
            scans,
            window(),
            1,
            MatchMode::DisplayName,
        );

        let outcome = engine.evaluate_window_close(at(8, 15)).await.unwrap();
        match outcome {
            WindowCloseOutcome::SweepArmed { absent, .. } => assert_eq!(absent, 1),
            other => panic!("expected SweepArmed, got {other:?}"),
        }
        assert_eq!(
            roster_mock.marks(),
            vec![(AttendanceStatus::Absent, vec!["2".to_string()])]
        );
    }

    #[tokio::test]
    async fn roster_fetch_failure_aborts_the_evaluation() {
        struct FailingRoster;
        impl RosterApi for FailingRoster {
            async fn authenticate(&self) -> Result<(), ApiError> {
                Ok(())
            }

            async fn eligible_roster(
                &self,
                _date: chrono::NaiveDate,
            ) -> Result<Vec<Member>, ApiError> {
                Err(ApiError::Upstream {
                    status: 503,
                    body: "maintenance".into(),
                })
            }
            async fn mark_members(
                &self,
                _status: AttendanceStatus,
                _members: &[Member],
            ) -> MarkResult {
                unreachable!("no writes may happen when the roster fetch fails")
            }
        }

        let scans = Arc::new(MockScans::new(vec![vec!["1"]]));
        let engine = ReconcileEngine::new(
            Arc::new(FailingRoster),
            scans,
            window(),
            1,
            MatchMode::ExternalId,
        );
        assert!(engine.evaluate_window_close(at(8, 15)).await.is_err());
        assert_eq!(engine.absent_count().await, 0);
    }
}

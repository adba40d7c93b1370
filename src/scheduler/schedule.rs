use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone};

/// When a job should fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Every day at a fixed local wall-clock time.
    Daily { at: NaiveTime },
    /// At a fixed interval. When `until` is set, the job is not re-armed
    /// once that instant has been reached.
    Every {
        interval: Duration,
        until: Option<DateTime<Local>>,
    },
}

/// Compute the next execution time strictly after `from`.
///
/// Returns `None` when the schedule is exhausted (a bounded `Every` whose
/// next firing would land past its deadline).
pub fn next_run(schedule: &Schedule, from: DateTime<Local>) -> Option<DateTime<Local>> {
    match schedule {
        Schedule::Daily { at } => {
            let today = Local
                .from_local_datetime(&from.date_naive().and_time(*at))
                .earliest()?;
            if today > from {
                Some(today)
            } else {
                // Today's firing has passed; advance to tomorrow.
                let tomorrow = from.date_naive().succ_opt()?;
                Local.from_local_datetime(&tomorrow.and_time(*at)).earliest()
            }
        }
        Schedule::Every { interval, until } => {
            let next = from + *interval;
            match until {
                Some(deadline) if next > *deadline => None,
                _ => Some(next),
            }
        }
    }
}

use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone};

use crate::accesslog::ScanEvent;
use crate::roster::Member;

/// The three wall-clock boundaries of a school day. Time-of-day only; the
/// calendar date is attached at run time in the local timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttendanceWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub dismissal: NaiveTime,
}

impl AttendanceWindow {
    pub fn new(start: NaiveTime, end: NaiveTime, dismissal: NaiveTime) -> Result<Self> {
        if end <= start {
            bail!("attendance window end must come after its start");
        }
        if dismissal < end {
            bail!("school dismissal cannot precede the attendance window end");
        }
        Ok(Self {
            start,
            end,
            dismissal,
        })
    }

    /// Parse `HH:MM` boundaries.
    pub fn parse(start: &str, end: &str, dismissal: &str) -> Result<Self> {
        Self::new(parse_time(start)?, parse_time(end)?, parse_time(dismissal)?)
    }

    /// Attach a calendar date in the local timezone.
    pub fn on_date(&self, date: NaiveDate) -> Result<DayWindow> {
        Ok(DayWindow {
            start: local(date, self.start)?,
            end: local(date, self.end)?,
            dismissal: local(date, self.dismissal)?,
        })
    }
}

fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").with_context(|| format!("invalid time of day: {s}"))
}

fn local(date: NaiveDate, time: NaiveTime) -> Result<DateTime<Local>> {
    Local
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .with_context(|| format!("{date} {time} does not exist in the local timezone"))
}

/// An [`AttendanceWindow`] pinned to a calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    pub dismissal: DateTime<Local>,
}

/// How roster members are joined against scan actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Stable external identifier. The default.
    #[default]
    ExternalId,
    /// Lower-cased display name. Fragile under case, whitespace, and
    /// homonym collisions; retained only for deployments that predate
    /// stable ids and disabled unless configured explicitly.
    DisplayName,
}

impl MatchMode {
    pub fn member_key(&self, member: &Member) -> String {
        match self {
            MatchMode::ExternalId => member.id.clone(),
            MatchMode::DisplayName => member.display_name.trim().to_lowercase(),
        }
    }

    pub fn actor_key(&self, event: &ScanEvent) -> String {
        match self {
            MatchMode::ExternalId => event.actor_id.clone(),
            MatchMode::DisplayName => event.actor_name.trim().to_lowercase(),
        }
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external-id" => Ok(MatchMode::ExternalId),
            "display-name" => Ok(MatchMode::DisplayName),
            other => Err(format!("unknown match mode: {other}")),
        }
    }
}

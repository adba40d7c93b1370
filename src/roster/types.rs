//! Data types for the roster service: domain records used by the
//! reconciliation engine plus the serde wire shapes of the API.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Attendance status as understood by the roster service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
    LateArrival,
    Virtual,
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttendanceStatus::Present => write!(f, "Present"),
            AttendanceStatus::Absent => write!(f, "Absent"),
            AttendanceStatus::LateArrival => write!(f, "LateArrival"),
            AttendanceStatus::Virtual => write!(f, "Virtual"),
        }
    }
}

/// One roster member. Rebuilt fresh from the roster service on every
/// reconciliation run; identity is the stable external id, never the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub display_name: String,
    pub status: AttendanceStatus,
}

/// An attendance grouping with the location name the eligibility filter
/// matches against.
#[derive(Debug, Clone, Deserialize)]
pub struct Grouping {
    pub id: String,
    pub location: String,
}

/// One row of a grouping's attendance sheet.
#[derive(Debug, Clone, Deserialize)]
pub struct AttendanceRow {
    pub member_id: String,
    pub display_name: String,
    pub status: AttendanceStatus,
}

/// Read-only profile data, cached per member for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberProfile {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub default_route_id: Option<String>,
}

/// Kind of a dismissal-change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Default,
    Bus,
    Pickup,
    Walker,
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(ChangeKind::Default),
            "bus" => Ok(ChangeKind::Bus),
            "pickup" => Ok(ChangeKind::Pickup),
            "walker" => Ok(ChangeKind::Walker),
            other => Err(format!("unknown change kind: {other}")),
        }
    }
}

/// A dismissal-change record for a single date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DismissalChange {
    pub date: NaiveDate,
    pub change_kind: ChangeKind,
    #[serde(default)]
    pub series_id: Option<String>,
    #[serde(default)]
    pub route_id: Option<String>,
    #[serde(default)]
    pub stop_id: Option<String>,
}

impl DismissalChange {
    /// True when this record belongs to a named, non-default change series,
    /// the only kind worth stashing before an Absent write.
    pub fn is_series_override(&self) -> bool {
        self.series_id.is_some() && self.change_kind != ChangeKind::Default
    }
}

/// A named change series owned by a member.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeSeries {
    pub id: String,
    pub name: String,
    pub change_kind: ChangeKind,
    #[serde(default)]
    pub route_id: Option<String>,
    #[serde(default)]
    pub stop_id: Option<String>,
}

/// One stop on a bus route.
#[derive(Debug, Clone, Deserialize)]
pub struct BusStop {
    pub id: String,
    pub name: String,
}

/// Outcome of a batch status write. The total is derived, so
/// `success + failure == total` holds by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkResult {
    pub success_count: usize,
    pub failure_count: usize,
}

impl MarkResult {
    pub fn total(&self) -> usize {
        self.success_count + self.failure_count
    }

    pub fn record(&mut self, ok: bool) {
        if ok {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
    }

    /// True when every member in the batch was written (or skipped as
    /// already in the target state).
    pub fn is_clean(&self) -> bool {
        self.failure_count == 0
    }
}

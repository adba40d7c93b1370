//! Configuration loaded from `rollcall.toml`.
//!
//! [`RollcallConfig`] holds every tunable. Values missing from the file fall
//! back to sensible defaults. The `ROLLCALL_ROSTER_PASSWORD` and
//! `ROLLCALL_ACCESS_TOKEN` environment variables take precedence over the
//! file so secrets can stay out of it.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Deserialize;

use crate::reconcile::{AttendanceWindow, MatchMode};
use crate::roster::ChangeKind;

#[derive(Debug, Clone, Deserialize)]
pub struct RollcallConfig {
    #[serde(default)]
    pub roster: RosterConfig,

    #[serde(default)]
    pub access_log: AccessLogConfig,

    #[serde(default)]
    pub attendance: AttendanceConfig,

    /// Concurrency bound for fanned-out requests against either service.
    #[serde(default = "default_fan_out_limit")]
    pub fan_out_limit: usize,

    /// Substitute a log line for every write call.
    #[serde(default)]
    pub dry_run: bool,

    /// Trigger the mark job once at startup, outside its schedule.
    #[serde(default)]
    pub run_immediately: bool,
}

/// Roster service endpoint and credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RosterConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Access log endpoint, static token, and search page size.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessLogConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            page_size: default_page_size(),
        }
    }
}

/// The reconciliation tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct AttendanceConfig {
    /// Regex matched against grouping location names.
    #[serde(default = "default_location_pattern")]
    pub location_pattern: String,

    /// Minimum present count below which the day is not a school day.
    #[serde(default = "default_present_threshold")]
    pub present_threshold: usize,

    /// Attendance window boundaries and school dismissal, as `HH:MM`.
    #[serde(default = "default_window_start")]
    pub window_start: String,
    #[serde(default = "default_window_end")]
    pub window_end: String,
    #[serde(default = "default_dismissal")]
    pub dismissal: String,

    /// Minutes between late-arrival sweep ticks.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_minutes: u64,

    /// `external-id` (default) or the deprecated `display-name`.
    #[serde(default = "default_match_mode")]
    pub match_mode: String,

    /// Dismissal-change kinds re-created when a member leaves Absent.
    #[serde(default = "default_restore_kinds")]
    pub restore_change_kinds: Vec<String>,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            location_pattern: default_location_pattern(),
            present_threshold: default_present_threshold(),
            window_start: default_window_start(),
            window_end: default_window_end(),
            dismissal: default_dismissal(),
            sweep_interval_minutes: default_sweep_interval(),
            match_mode: default_match_mode(),
            restore_change_kinds: default_restore_kinds(),
        }
    }
}

fn default_fan_out_limit() -> usize {
    8
}

fn default_page_size() -> u64 {
    100
}

fn default_location_pattern() -> String {
    ".*".to_string()
}

fn default_present_threshold() -> usize {
    10
}

fn default_window_start() -> String {
    "07:30".to_string()
}

fn default_window_end() -> String {
    "08:15".to_string()
}

fn default_dismissal() -> String {
    "15:00".to_string()
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_match_mode() -> String {
    "external-id".to_string()
}

fn default_restore_kinds() -> Vec<String> {
    vec!["bus".to_string()]
}

impl Default for RollcallConfig {
    fn default() -> Self {
        Self {
            roster: RosterConfig::default(),
            access_log: AccessLogConfig::default(),
            attendance: AttendanceConfig::default(),
            fan_out_limit: default_fan_out_limit(),
            dry_run: false,
            run_immediately: false,
        }
    }
}

impl RollcallConfig {
    /// Load from the given path, or `rollcall.toml` in the working
    /// directory. A missing file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new("rollcall.toml"));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<RollcallConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Environment takes precedence over the file for secrets.
        if let Ok(password) = std::env::var("ROLLCALL_ROSTER_PASSWORD")
            && !password.is_empty()
        {
            config.roster.password = password;
        }
        if let Ok(token) = std::env::var("ROLLCALL_ACCESS_TOKEN")
            && !token.is_empty()
        {
            config.access_log.token = token;
        }

        Ok(config)
    }

    /// Parsed attendance window boundaries.
    pub fn window(&self) -> Result<AttendanceWindow> {
        AttendanceWindow::parse(
            &self.attendance.window_start,
            &self.attendance.window_end,
            &self.attendance.dismissal,
        )
    }

    pub fn match_mode(&self) -> Result<MatchMode> {
        self.attendance.match_mode.parse().map_err(|e: String| anyhow!(e))
    }

    pub fn restore_change_kinds(&self) -> Result<Vec<ChangeKind>> {
        self.attendance
            .restore_change_kinds
            .iter()
            .map(|s| s.parse().map_err(|e: String| anyhow!(e)))
            .collect()
    }

    pub fn location_pattern(&self) -> Result<Regex> {
        Regex::new(&self.attendance.location_pattern)
            .context("invalid dismissal-location pattern")
    }

    pub fn sweep_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.attendance.sweep_interval_minutes.max(1) as i64)
    }
}

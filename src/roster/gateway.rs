//! Gateway to the roster service: eligible-roster fetch, attendance writes,
//! and dismissal-change stash/restore around Absent transitions.

use std::collections::HashMap;
use std::future::Future;

use chrono::{Local, NaiveDate};
use futures_util::stream::{self, StreamExt};
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::http::{ApiError, ResilientClient, RetryPolicy};

use super::auth::RosterAuth;
use super::cache::{ChangeCache, ProfileCache};
use super::types::{
    AttendanceRow, AttendanceStatus, BusStop, ChangeKind, ChangeSeries, DismissalChange, Grouping,
    MarkResult, Member, MemberProfile,
};

/// Seam between the reconciliation engine and the live roster service.
/// Tests substitute a double to observe (or suppress) write calls.
pub trait RosterApi: Send + Sync {
    /// Run the credential handshake if no session exists yet.
    fn authenticate(&self) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// The day's eligible roster, deduplicated by member id.
    fn eligible_roster(
        &self,
        date: NaiveDate,
    ) -> impl Future<Output = Result<Vec<Member>, ApiError>> + Send;

    /// Write `status` for every member in the batch; per-member failures are
    /// isolated and reported in the aggregate.
    fn mark_members(
        &self,
        status: AttendanceStatus,
        members: &[Member],
    ) -> impl Future<Output = MarkResult> + Send;
}

/// Tunables for the gateway, all sourced from configuration.
pub struct RosterOptions {
    /// Groupings whose location matches keep their members eligible.
    pub location_pattern: Regex,
    /// Concurrency bound for per-grouping and per-member fan-out.
    pub fan_out_limit: usize,
    /// Change kinds that are re-created when a member leaves Absent.
    pub restore_change_kinds: Vec<ChangeKind>,
    /// Substitute a log line for every write.
    pub dry_run: bool,
}

pub struct RosterGateway {
    api: ResilientClient<RosterAuth>,
    base_url: String,
    location_pattern: Regex,
    fan_out: usize,
    restore_kinds: Vec<ChangeKind>,
    dry_run: bool,
    profiles: ProfileCache,
    changes: ChangeCache,
}

impl RosterGateway {
    pub fn new(
        base_url: impl Into<String>,
        auth: RosterAuth,
        options: RosterOptions,
        profiles: ProfileCache,
        changes: ChangeCache,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            api: ResilientClient::new(auth, RetryPolicy::default(), "roster"),
            base_url: base_url.trim_end_matches('/').to_string(),
            location_pattern: options.location_pattern,
            fan_out: options.fan_out_limit.max(1),
            restore_kinds: options.restore_change_kinds,
            dry_run: options.dry_run,
            profiles,
            changes,
        }
    }

    /// Run the credential handshake if no session exists yet. Must succeed
    /// before any other operation; later 401s are refreshed transparently.
    pub async fn authenticate(&self) -> Result<(), ApiError> {
        self.api.token_source().ensure_authenticated().await
    }

    /// Fetch the day's eligible roster: every grouping whose location matches
    /// the configured pattern, rows fetched concurrently, members
    /// deduplicated by id with the last-seen record winning.
    pub async fn eligible_roster(&self, date: NaiveDate) -> Result<Vec<Member>, ApiError> {
        let url = format!("{}/api/v1/attendance/groupings", self.base_url);
        let groupings: Vec<Grouping> = self.api.get(&url, &[("date", date.to_string())]).await?;
        let eligible: Vec<Grouping> = groupings
            .into_iter()
            .filter(|g| self.location_pattern.is_match(&g.location))
            .collect();
        debug!(groupings = eligible.len(), "groupings matched the location pattern");

        let fetched: Vec<Result<Vec<Member>, ApiError>> = stream::iter(eligible)
            .map(|g| async move { self.grouping_members(&g, date).await })
            .buffer_unordered(self.fan_out)
            .collect()
            .await;

        let mut order: Vec<String> = Vec::new();
        let mut by_id: HashMap<String, Member> = HashMap::new();
        for result in fetched {
            for member in result? {
                if !by_id.contains_key(&member.id) {
                    order.push(member.id.clone());
                }
                by_id.insert(member.id.clone(), member);
            }
        }
        let roster: Vec<Member> = order.into_iter().filter_map(|id| by_id.remove(&id)).collect();

        self.warm_profiles(&roster).await;
        info!(members = roster.len(), "eligible roster fetched");
        Ok(roster)
    }

    async fn grouping_members(
        &self,
        grouping: &Grouping,
        date: NaiveDate,
    ) -> Result<Vec<Member>, ApiError> {
        let url = format!(
            "{}/api/v1/attendance/groupings/{}/rows",
            self.base_url, grouping.id
        );
        let rows: Vec<AttendanceRow> = self.api.get(&url, &[("date", date.to_string())]).await?;
        Ok(rows
            .into_iter()
            .map(|r| Member {
                id: r.member_id,
                display_name: r.display_name,
                status: r.status,
            })
            .collect())
    }

    /// Fetch and cache profiles for members not seen before. Cached members
    /// are skipped; a failed fetch is logged and skipped, since profile data
    /// is reference-only.
    async fn warm_profiles(&self, roster: &[Member]) {
        let unseen: Vec<&Member> = roster
            .iter()
            .filter(|m| !self.profiles.contains(&m.id))
            .collect();
        if unseen.is_empty() {
            return;
        }
        debug!(count = unseen.len(), "fetching uncached member profiles");
        let results: Vec<(String, Result<MemberProfile, ApiError>)> =
            stream::iter(unseen.into_iter().cloned())
                .map(|m| async move { (m.id.clone(), self.member_profile(&m.id).await) })
                .buffer_unordered(self.fan_out)
            .collect()
            .await;
        for (id, result) in results {
            match result {
                Ok(profile) => {
                    debug!(
                        member = %profile.id,
                        name = %format!("{} {}", profile.first_name, profile.last_name),
                        "profile cached"
                    );
                    self.profiles.insert(profile.id.clone(), profile);
                }
                Err(e) => warn!(member = %id, "profile fetch failed: {e}"),
            }
        }
    }

    async fn member_profile(&self, id: &str) -> Result<MemberProfile, ApiError> {
        let url = format!("{}/api/v1/members/{id}/profile", self.base_url);
        self.api.get(&url, &[]).await
    }

    /// Write `status` for every member in the batch, concurrently.
    ///
    /// A member already in the target status counts as a success with zero
    /// remote calls. One member's failure never aborts the others.
    pub async fn mark_members(&self, status: AttendanceStatus, members: &[Member]) -> MarkResult {
        let date = Local::now().date_naive();
        let outcomes: Vec<bool> = stream::iter(members.iter().cloned())
            .map(|m| async move { self.mark_one(status, &m, date).await })
            .buffer_unordered(self.fan_out)
            .collect()
            .await;

        let mut result = MarkResult::default();
        for ok in outcomes {
            result.record(ok);
        }
        if result.is_clean() {
            info!(%status, total = result.total(), "batch mark finished");
        } else {
            warn!(
                %status,
                failed = result.failure_count,
                total = result.total(),
                "batch mark finished with failures"
            );
        }
        result
    }

    async fn mark_one(&self, status: AttendanceStatus, member: &Member, date: NaiveDate) -> bool {
        if member.status == status {
            debug!(member = %member.display_name, %status, "already in target status, no write");
            return true;
        }
        if status == AttendanceStatus::Absent {
            self.stash_dismissal_change(member, date).await;
        } else if matches!(
            status,
            AttendanceStatus::Present | AttendanceStatus::LateArrival
        ) {
            self.restore_dismissal_change(member, date).await;
        }
        match self.set_status(member, status, date).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    member = %member.display_name,
                    id = %member.id,
                    %status,
                    "status write failed: {e}"
                );
                false
            }
        }
    }

    /// Before an Absent write, remember any named dismissal-change override
    /// for the day so it can be restored if the member turns up late.
    async fn stash_dismissal_change(&self, member: &Member, date: NaiveDate) {
        match self.dismissal_changes(&member.id, date, date).await {
            Ok(changes) => {
                if let Some(change) = changes
                    .into_iter()
                    .find(|c| c.date == date && c.is_series_override())
                {
                    debug!(
                        member = %member.display_name,
                        kind = ?change.change_kind,
                        "stashing dismissal change"
                    );
                    self.changes.insert(member.id.clone(), change);
                }
            }
            Err(e) => warn!(member = %member.display_name, "dismissal-change lookup failed: {e}"),
        }
    }

    /// On a transition away from Absent, re-create the stashed change record
    /// for today when its kind is configured as restorable. Failure is
    /// logged and never fails the status write.
    async fn restore_dismissal_change(&self, member: &Member, date: NaiveDate) {
        let Some(change) = self.changes.get(&member.id) else {
            return;
        };
        if !self.restore_kinds.contains(&change.change_kind) {
            debug!(
                member = %member.display_name,
                kind = ?change.change_kind,
                "change kind not configured for restore"
            );
            self.changes.remove(&member.id);
            return;
        }
        match self.recreate_change(member, &change, date).await {
            Ok(()) => {
                info!(
                    member = %member.display_name,
                    kind = ?change.change_kind,
                    "dismissal change restored"
                );
                self.changes.remove(&member.id);
            }
            Err(e) => warn!(
                member = %member.display_name,
                id = %member.id,
                "dismissal-change restore failed: {e}"
            ),
        }
    }

    async fn recreate_change(
        &self,
        member: &Member,
        change: &DismissalChange,
        date: NaiveDate,
    ) -> Result<(), ApiError> {
        let mut route_id = change.route_id.clone();
        let mut stop_id = change.stop_id.clone();

        // A record that only references its series needs the series looked up
        // for the original routing.
        if route_id.is_none() {
            if let Some(series_id) = &change.series_id {
                let series = self.change_series(&member.id).await?;
                if let Some(series) = series.into_iter().find(|s| &s.id == series_id) {
                    debug!(member = %member.display_name, series = %series.name, "routing taken from change series");
                    route_id = series.route_id;
                    stop_id = stop_id.or(series.stop_id);
                }
            }
        }
        // Last resort: the member's regular route from the cached profile.
        if route_id.is_none() {
            if let Some(profile) = self.profiles.get(&member.id) {
                route_id = profile.default_route_id;
            }
        }
        if change.change_kind == ChangeKind::Bus && stop_id.is_none() {
            if let Some(route) = &route_id {
                if let Some(stop) = self.route_stops(route).await?.into_iter().next() {
                    debug!(member = %member.display_name, stop = %stop.name, "first stop on the route assumed");
                    stop_id = Some(stop.id);
                }
            }
        }

        if self.dry_run {
            info!(
                member = %member.display_name,
                kind = ?change.change_kind,
                "dry-run: would re-create dismissal change"
            );
            return Ok(());
        }
        let url = format!(
            "{}/api/v1/members/{}/dismissal-changes",
            self.base_url, member.id
        );
        let body = json!({
            "date": date,
            "change_kind": change.change_kind,
            "series_id": change.series_id,
            "route_id": route_id,
            "stop_id": stop_id,
        });
        let _: serde_json::Value = self.api.post(&url, &body).await?;
        Ok(())
    }

    async fn dismissal_changes(
        &self,
        id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DismissalChange>, ApiError> {
        let url = format!("{}/api/v1/members/{id}/dismissal-changes", self.base_url);
        self.api
            .get(&url, &[("start", start.to_string()), ("end", end.to_string())])
            .await
    }

    async fn change_series(&self, id: &str) -> Result<Vec<ChangeSeries>, ApiError> {
        let url = format!("{}/api/v1/members/{id}/change-series", self.base_url);
        self.api.get(&url, &[]).await
    }

    async fn route_stops(&self, route_id: &str) -> Result<Vec<BusStop>, ApiError> {
        let url = format!("{}/api/v1/routes/{route_id}/stops", self.base_url);
        self.api.get(&url, &[]).await
    }

    async fn set_status(
        &self,
        member: &Member,
        status: AttendanceStatus,
        date: NaiveDate,
    ) -> Result<(), ApiError> {
        if self.dry_run {
            info!(
                member = %member.display_name,
                id = %member.id,
                %status,
                "dry-run: would write status"
            );
            return Ok(());
        }
        let url = format!("{}/api/v1/members/{}/attendance", self.base_url, member.id);
        let body = json!({ "date": date, "status": status });
        let _: serde_json::Value = self.api.post(&url, &body).await?;
        Ok(())
    }
}

impl RosterApi for RosterGateway {
    async fn authenticate(&self) -> Result<(), ApiError> {
        RosterGateway::authenticate(self).await
    }

    async fn eligible_roster(&self, date: NaiveDate) -> Result<Vec<Member>, ApiError> {
        RosterGateway::eligible_roster(self, date).await
    }

    async fn mark_members(&self, status: AttendanceStatus, members: &[Member]) -> MarkResult {
        RosterGateway::mark_members(self, status, members).await
    }
}

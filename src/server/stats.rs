//! Stats endpoint: time range resolution and ledger summaries.

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::cache::CacheStats;
use crate::error::Error;
use crate::ledger::{GroupBy, GroupTotals, TimeWindow, UsageTotals};

/// Query parameters for GET /v1/stats.
#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub range: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub group_by: Option<String>,
}

/// Preset trailing windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePreset {
    Last1h,
    Last24h,
    Last7d,
    Last30d,
}

impl RangePreset {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "last_1h" => Some(Self::Last1h),
            "last_24h" => Some(Self::Last24h),
            "last_7d" => Some(Self::Last7d),
            "last_30d" => Some(Self::Last30d),
            _ => None,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Self::Last1h => Duration::hours(1),
            Self::Last24h => Duration::hours(24),
            Self::Last7d => Duration::days(7),
            Self::Last30d => Duration::days(30),
        }
    }
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::BadRequest(format!("Invalid '{}' timestamp: {}", field, e)))
}

/// Resolve the window relative to `now`.
///
/// An explicit `since` wins over `range`; without either the window is the
/// last 7 days. `until` defaults to `now`.
pub fn resolve_time_range(
    range: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TimeWindow, Error> {
    let since = match (since, range) {
        (Some(s), _) => parse_timestamp("since", s)?,
        (None, Some(r)) => {
            let preset = RangePreset::parse(r).ok_or_else(|| {
                Error::BadRequest(format!(
                    "Invalid range '{}'. Supported: last_1h, last_24h, last_7d, last_30d",
                    r
                ))
            })?;
            now - preset.duration()
        }
        (None, None) => now - RangePreset::Last7d.duration(),
    };

    let until = until
        .map(|u| parse_timestamp("until", u))
        .transpose()?
        .unwrap_or(now);

    if since > until {
        return Err(Error::BadRequest(
            "'since' must not be later than 'until'".to_string(),
        ));
    }

    Ok(TimeWindow::between(since, until))
}

/// Body of GET /v1/stats.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub since: String,
    pub until: String,
    pub totals: UsageTotals,
    pub cache_hit_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<GroupBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<GroupTotals>>,
    pub cache: CacheStats,
}

/// Handle GET /v1/stats
pub async fn stats_handler(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, Error> {
    let window = resolve_time_range(
        params.range.as_deref(),
        params.since.as_deref(),
        params.until.as_deref(),
        Utc::now(),
    )?;
    let group_by = params
        .group_by
        .as_deref()
        .map(str::parse::<GroupBy>)
        .transpose()
        .map_err(Error::BadRequest)?;

    let ledger = state.router.ledger();
    let totals = ledger.totals(&window);
    let groups = group_by.map(|g| ledger.aggregate(g, &window));

    // resolve_time_range always yields a closed window
    let since = window.since.unwrap_or_default();
    let until = window.until.unwrap_or_default();

    Ok(Json(StatsResponse {
        since: since.to_rfc3339(),
        until: until.to_rfc3339(),
        cache_hit_rate: totals.cache_hit_rate(),
        totals,
        group_by,
        groups,
        cache: state.router.cache_stats(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-10T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_default_range_is_last_7d() {
        let window = resolve_time_range(None, None, None, now()).unwrap();
        assert_eq!(window.since, Some(now() - Duration::days(7)));
        assert_eq!(window.until, Some(now()));
    }

    #[test]
    fn test_preset_range() {
        let window = resolve_time_range(Some("last_1h"), None, None, now()).unwrap();
        assert_eq!(window.since, Some(now() - Duration::hours(1)));
    }

    #[test]
    fn test_explicit_since_overrides_range() {
        let window = resolve_time_range(
            Some("last_30d"),
            Some("2025-03-10T00:00:00Z"),
            Some("2025-03-10T06:00:00Z"),
            now(),
        )
        .unwrap();
        assert_eq!(window.since.unwrap().to_rfc3339(), "2025-03-10T00:00:00+00:00");
        assert_eq!(window.until.unwrap().to_rfc3339(), "2025-03-10T06:00:00+00:00");
    }

    #[test]
    fn test_invalid_inputs_are_bad_requests() {
        assert!(matches!(
            resolve_time_range(Some("last_year"), None, None, now()),
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            resolve_time_range(None, Some("yesterday"), None, now()),
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            resolve_time_range(None, Some("2025-03-11T00:00:00Z"), None, now()),
            Err(Error::BadRequest(_))
        ));
    }
}

//! Aggregation over ledger records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::LedgerRecord;

/// Dimension used to group records in a summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    Provider,
    Model,
    /// UTC calendar day, keyed as `YYYY-MM-DD`.
    Day,
}

impl GroupBy {
    fn key(&self, record: &LedgerRecord) -> String {
        match self {
            GroupBy::Provider => record.provider.clone(),
            GroupBy::Model => record.model.clone(),
            GroupBy::Day => record.timestamp.format("%Y-%m-%d").to_string(),
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GroupBy::Provider => "provider",
            GroupBy::Model => "model",
            GroupBy::Day => "day",
        })
    }
}

impl FromStr for GroupBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provider" => Ok(GroupBy::Provider),
            "model" => Ok(GroupBy::Model),
            "day" => Ok(GroupBy::Day),
            other => Err(format!(
                "Invalid group_by '{}'. Supported: provider, model, day",
                other
            )),
        }
    }
}

/// Inclusive time bounds. Open ends match everything on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// Unbounded window.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            until: Some(until),
        }
    }

    /// From `since` onwards.
    pub fn starting(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            until: None,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.map_or(true, |s| at >= s) && self.until.map_or(true, |u| at <= u)
    }
}

/// Summed usage over a set of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub cache_hits: u64,
    pub fallback_count: u64,
    pub streaming: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    pub(crate) fn add(&mut self, record: &LedgerRecord) {
        self.requests += 1;
        self.cache_hits += u64::from(record.cache_hit);
        self.fallback_count += u64::from(record.fallback_used);
        self.streaming += u64::from(record.streaming);
        self.input_tokens += u64::from(record.input_tokens);
        self.output_tokens += u64::from(record.output_tokens);
        self.cost_usd += record.cost_usd;
    }

    /// Share of requests served from cache, 0.0 when empty.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.requests as f64
        }
    }
}

/// One row of an aggregated summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupTotals {
    pub key: String,
    #[serde(flatten)]
    pub totals: UsageTotals,
}

/// Sum records in `window`, grouped by `group_by`, ordered by key.
pub(crate) fn aggregate<'a>(
    records: impl IntoIterator<Item = &'a LedgerRecord>,
    group_by: GroupBy,
    window: &TimeWindow,
) -> Vec<GroupTotals> {
    let mut groups: BTreeMap<String, UsageTotals> = BTreeMap::new();
    for record in records.into_iter().filter(|r| window.contains(r.timestamp)) {
        groups.entry(group_by.key(record)).or_default().add(record);
    }
    groups
        .into_iter()
        .map(|(key, totals)| GroupTotals { key, totals })
        .collect()
}

/// Sum records in `window` into a single total.
pub(crate) fn totals<'a>(
    records: impl IntoIterator<Item = &'a LedgerRecord>,
    window: &TimeWindow,
) -> UsageTotals {
    let mut totals = UsageTotals::default();
    for record in records.into_iter().filter(|r| window.contains(r.timestamp)) {
        totals.add(record);
    }
    totals
}

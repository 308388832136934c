//! Budget policy types.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What happens when spend crosses the budget limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetMode {
    /// No budget evaluation.
    #[default]
    Off,
    /// Calls proceed; results are flagged `budget_exceeded`.
    SoftWarn,
    /// New non-cached calls are refused.
    HardBlock,
}

impl BudgetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetMode::Off => "off",
            BudgetMode::SoftWarn => "soft_warn",
            BudgetMode::HardBlock => "hard_block",
        }
    }
}

impl fmt::Display for BudgetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BudgetMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(BudgetMode::Off),
            "soft_warn" => Ok(BudgetMode::SoftWarn),
            "hard_block" => Ok(BudgetMode::HardBlock),
            other => Err(format!(
                "Invalid budget mode '{}'. Supported: off, soft_warn, hard_block",
                other
            )),
        }
    }
}

/// Span of spend the limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    /// Everything recorded since the ledger was created.
    #[default]
    Total,
    /// Current UTC calendar day.
    Daily,
    /// Current UTC calendar month.
    Monthly,
}

impl BudgetPeriod {
    /// Inclusive start of the period containing `now`; `None` for `Total`.
    pub fn start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            BudgetPeriod::Total => None,
            BudgetPeriod::Daily => Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
                .single(),
            BudgetPeriod::Monthly => Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single(),
        }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BudgetPeriod::Total => "total",
            BudgetPeriod::Daily => "daily",
            BudgetPeriod::Monthly => "monthly",
        })
    }
}

/// Spend summed as records arrive, so budget checks never rescan the ledger.
///
/// Daily and monthly buckets hold only the latest period seen; a record
/// stamped in an older period counts toward `Total` alone.
#[derive(Debug, Default)]
pub(crate) struct RunningSpend {
    total: f64,
    daily: PeriodBucket,
    monthly: PeriodBucket,
}

#[derive(Debug, Default)]
struct PeriodBucket {
    start: Option<DateTime<Utc>>,
    cost_usd: f64,
}

impl PeriodBucket {
    fn add(&mut self, start: Option<DateTime<Utc>>, cost_usd: f64) {
        let Some(start) = start else {
            return;
        };
        match self.start {
            Some(current) if current == start => self.cost_usd += cost_usd,
            Some(current) if current > start => {}
            _ => {
                self.start = Some(start);
                self.cost_usd = cost_usd;
            }
        }
    }

    fn spend_since(&self, start: Option<DateTime<Utc>>) -> f64 {
        match (self.start, start) {
            (Some(current), Some(start)) if current == start => self.cost_usd,
            _ => 0.0,
        }
    }
}

impl RunningSpend {
    pub(crate) fn add(&mut self, timestamp: DateTime<Utc>, cost_usd: f64) {
        self.total += cost_usd;
        self.daily.add(BudgetPeriod::Daily.start(timestamp), cost_usd);
        self.monthly.add(BudgetPeriod::Monthly.start(timestamp), cost_usd);
    }

    /// Spend for the period containing `now`.
    pub(crate) fn spend(&self, period: BudgetPeriod, now: DateTime<Utc>) -> f64 {
        match period {
            BudgetPeriod::Total => self.total,
            BudgetPeriod::Daily => self.daily.spend_since(period.start(now)),
            BudgetPeriod::Monthly => self.monthly.spend_since(period.start(now)),
        }
    }
}

/// Result of evaluating spend against a limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BudgetStatus {
    Ok,
    Exceeded {
        spent_usd: f64,
        limit_usd: f64,
        should_block: bool,
    },
}

impl BudgetStatus {
    pub fn is_exceeded(&self) -> bool {
        matches!(self, BudgetStatus::Exceeded { .. })
    }

    pub fn should_block(&self) -> bool {
        matches!(
            self,
            BudgetStatus::Exceeded {
                should_block: true,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!("soft_warn".parse::<BudgetMode>().unwrap(), BudgetMode::SoftWarn);
        assert_eq!("hard_block".parse::<BudgetMode>().unwrap(), BudgetMode::HardBlock);
        assert!("block".parse::<BudgetMode>().is_err());
    }

    #[test]
    fn test_period_start() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        assert_eq!(BudgetPeriod::Total.start(now), None);
        assert_eq!(
            BudgetPeriod::Daily.start(now),
            Some(Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap())
        );
        assert_eq!(
            BudgetPeriod::Monthly.start(now),
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_running_spend_rolls_over_periods() {
        let mut spend = RunningSpend::default();
        let march = Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).unwrap();
        let next_day = Utc.with_ymd_and_hms(2026, 3, 15, 9, 0, 0).unwrap();

        spend.add(march, 1.0);
        spend.add(march, 0.5);
        assert_eq!(spend.spend(BudgetPeriod::Daily, march), 1.5);

        spend.add(next_day, 0.25);
        assert_eq!(spend.spend(BudgetPeriod::Daily, next_day), 0.25);
        assert_eq!(spend.spend(BudgetPeriod::Monthly, next_day), 1.75);
        assert_eq!(spend.spend(BudgetPeriod::Total, next_day), 1.75);

        // A late record for an older day only reaches the wider buckets.
        spend.add(march, 2.0);
        assert_eq!(spend.spend(BudgetPeriod::Daily, next_day), 0.25);
        assert_eq!(spend.spend(BudgetPeriod::Monthly, next_day), 3.75);

        let april = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        assert_eq!(spend.spend(BudgetPeriod::Daily, april), 0.0);
        assert_eq!(spend.spend(BudgetPeriod::Monthly, april), 0.0);
        assert_eq!(spend.spend(BudgetPeriod::Total, april), 3.75);
    }

    #[test]
    fn test_status_helpers() {
        assert!(!BudgetStatus::Ok.is_exceeded());
        let warn = BudgetStatus::Exceeded {
            spent_usd: 1.05,
            limit_usd: 1.0,
            should_block: false,
        };
        assert!(warn.is_exceeded());
        assert!(!warn.should_block());
    }
}

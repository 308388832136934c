//! Append-only cost ledger, usage dashboard, and budget evaluation.
//!
//! Every completed invocation (provider call, cache hit, or partially
//! consumed stream) is recorded exactly once. Failed calls never reach the
//! ledger. Dashboard summaries fold the records themselves; budget checks
//! read running per-period totals kept in step with every append.

mod budget;
mod dashboard;
mod record;

use budget::RunningSpend;
pub use budget::{BudgetMode, BudgetPeriod, BudgetStatus};
pub use dashboard::{GroupBy, GroupTotals, TimeWindow, UsageTotals};
pub use record::LedgerRecord;

use chrono::Utc;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct State {
    records: Vec<LedgerRecord>,
    spend: RunningSpend,
}

#[derive(Debug, Default)]
pub struct Ledger {
    state: RwLock<State>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a record. Cache hits are forced to zero cost.
    pub fn record(&self, mut record: LedgerRecord) {
        if record.cache_hit && record.cost_usd != 0.0 {
            tracing::warn!(
                model = %record.model,
                cost_usd = record.cost_usd,
                "Cache hit recorded with non-zero cost, clamping to 0"
            );
            record.cost_usd = 0.0;
        }

        tracing::debug!(
            provider = %record.provider,
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            cost_usd = record.cost_usd,
            cache_hit = record.cache_hit,
            streaming = record.streaming,
            "Ledger record"
        );

        let mut state = self.write();
        state.spend.add(record.timestamp, record.cost_usd);
        state.records.push(record);
    }

    /// Snapshot of the records inside `window`, in insertion order.
    pub fn records(&self, window: &TimeWindow) -> Vec<LedgerRecord> {
        self.read()
            .records
            .iter()
            .filter(|r| window.contains(r.timestamp))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-group totals inside `window`, ordered by group key.
    pub fn aggregate(&self, group_by: GroupBy, window: &TimeWindow) -> Vec<GroupTotals> {
        dashboard::aggregate(self.read().records.iter(), group_by, window)
    }

    /// Overall totals inside `window`.
    pub fn totals(&self, window: &TimeWindow) -> UsageTotals {
        dashboard::totals(self.read().records.iter(), window)
    }

    /// Spend in USD for the period containing now. Reads running totals,
    /// not the records.
    pub fn spend(&self, period: BudgetPeriod) -> f64 {
        self.read().spend.spend(period, Utc::now())
    }

    /// Evaluate lifetime spend against `limit_usd`.
    pub fn check_budget(&self, limit_usd: f64, mode: BudgetMode) -> BudgetStatus {
        self.check_budget_in(limit_usd, mode, BudgetPeriod::Total)
    }

    /// Evaluate spend for `period` against `limit_usd`.
    ///
    /// The limit counts as exceeded once spend reaches it. `Off` never
    /// reports exceeded.
    pub fn check_budget_in(
        &self,
        limit_usd: f64,
        mode: BudgetMode,
        period: BudgetPeriod,
    ) -> BudgetStatus {
        if mode == BudgetMode::Off {
            return BudgetStatus::Ok;
        }
        let spent_usd = self.spend(period);
        if spent_usd >= limit_usd {
            BudgetStatus::Exceeded {
                spent_usd,
                limit_usd,
                should_block: mode == BudgetMode::HardBlock,
            }
        } else {
            BudgetStatus::Ok
        }
    }
}

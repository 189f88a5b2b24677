use cadence_core::{
    notify_or_log, CadenceError, CadenceResult, CostEntry, CostUnit, DomainEvent, EventKind,
    Notifier, Store,
};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Monthly spending policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Spend ceiling for the calendar month, in US dollars.
    pub monthly_limit_usd: f64,
    /// Percentage of the limit at which a threshold warning fires.
    pub alert_threshold_percent: f64,
    /// Refuse new work once the limit is reached; otherwise only warn.
    pub stop_on_exceeded: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_limit_usd: 100.0,
            alert_threshold_percent: 80.0,
            stop_on_exceeded: true,
        }
    }
}

impl BudgetConfig {
    /// Reject non-positive limits and thresholds outside (0, 100].
    pub fn validate(&self) -> CadenceResult<()> {
        if !(self.monthly_limit_usd.is_finite() && self.monthly_limit_usd > 0.0) {
            return Err(CadenceError::Config(
                "budget.monthly_limit_usd must be a positive number".into(),
            ));
        }
        if !(self.alert_threshold_percent > 0.0 && self.alert_threshold_percent <= 100.0) {
            return Err(CadenceError::Config(
                "budget.alert_threshold_percent must be in (0, 100]".into(),
            ));
        }
        Ok(())
    }
}

/// Kind of warning attached to a [`BudgetCheck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetWarning {
    /// Limit reached and spending is stopped.
    BudgetExceeded,
    /// Limit reached but spending continues.
    BudgetWarning,
    /// Usage crossed the alert threshold.
    ThresholdWarning,
}

impl BudgetWarning {
    /// Wire name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            BudgetWarning::BudgetExceeded => "budget_exceeded",
            BudgetWarning::BudgetWarning => "budget_warning",
            BudgetWarning::ThresholdWarning => "threshold_warning",
        }
    }

    fn event_kind(self) -> EventKind {
        match self {
            BudgetWarning::BudgetExceeded => EventKind::BudgetExceeded,
            BudgetWarning::BudgetWarning => EventKind::BudgetWarning,
            BudgetWarning::ThresholdWarning => EventKind::ThresholdWarning,
        }
    }
}

impl std::fmt::Display for BudgetWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a budget evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetCheck {
    /// Whether new work may start.
    pub allowed: bool,
    /// Warning that applies, if any.
    pub warning: Option<BudgetWarning>,
    /// Month-to-date spend.
    pub spent_usd: f64,
    /// Configured limit.
    pub limit_usd: f64,
    /// Spend as a percentage of the limit.
    pub usage_percent: f64,
}

impl BudgetCheck {
    /// Pure evaluation of `spent` against `config`.
    pub fn evaluate(spent: f64, config: &BudgetConfig) -> Self {
        let limit = config.monthly_limit_usd;
        let usage_percent = if limit > 0.0 { spent / limit * 100.0 } else { 100.0 };
        let (allowed, warning) = if spent >= limit {
            if config.stop_on_exceeded {
                (false, Some(BudgetWarning::BudgetExceeded))
            } else {
                (true, Some(BudgetWarning::BudgetWarning))
            }
        } else if usage_percent >= config.alert_threshold_percent {
            (true, Some(BudgetWarning::ThresholdWarning))
        } else {
            (true, None)
        };
        Self {
            allowed,
            warning,
            spent_usd: spent,
            limit_usd: limit,
            usage_percent,
        }
    }
}

/// Month-end spend extrapolated from the month-to-date daily average.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostProjection {
    /// Month-to-date spend.
    pub spent_usd: f64,
    /// Spend per elapsed day.
    pub daily_average_usd: f64,
    /// Daily average times days in the month.
    pub projected_total_usd: f64,
    /// Days of the month started so far.
    pub days_elapsed: u32,
    /// Length of the month.
    pub days_in_month: u32,
    /// Configured limit.
    pub limit_usd: f64,
    /// Whether the projection exceeds the limit.
    pub will_exceed: bool,
}

/// Price of one model. Token prices are per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Provider the row applies to.
    pub provider: String,
    /// Model name, or `*` for every model of the provider.
    #[serde(default = "wildcard")]
    pub model: String,
    /// Dollars per million prompt tokens.
    #[serde(default)]
    pub input_per_million: f64,
    /// Dollars per million completion tokens.
    #[serde(default)]
    pub output_per_million: f64,
    /// Dollars per image, clip or other generation.
    #[serde(default)]
    pub per_generation: f64,
}

fn wildcard() -> String {
    "*".into()
}

impl ModelPricing {
    /// Cost of `unit` at this row.
    pub fn cost_of(&self, unit: &CostUnit) -> f64 {
        match *unit {
            CostUnit::Tokens { input, output } => {
                (input as f64 * self.input_per_million + output as f64 * self.output_per_million)
                    / 1_000_000.0
            }
            CostUnit::Generations { count } => f64::from(count) * self.per_generation,
        }
    }
}

/// Lookup table from (provider, model) to [`ModelPricing`].
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    rows: Vec<ModelPricing>,
}

impl PricingTable {
    /// Table over `rows`, searched in order.
    pub fn new(rows: Vec<ModelPricing>) -> Self {
        Self { rows }
    }

    /// Exact model match first, then the provider's `*` row.
    pub fn lookup(&self, provider: &str, model: &str) -> Option<&ModelPricing> {
        self.rows
            .iter()
            .find(|r| r.provider == provider && r.model == model)
            .or_else(|| {
                self.rows
                    .iter()
                    .find(|r| r.provider == provider && r.model == "*")
            })
    }

    /// Cost of `unit`. Unpriced usage costs nothing and is logged.
    pub fn price(&self, provider: &str, model: &str, unit: &CostUnit) -> f64 {
        match self.lookup(provider, model) {
            Some(row) => row.cost_of(unit),
            None => {
                warn!(provider, model, "No pricing configured, recording zero cost");
                0.0
            }
        }
    }

    /// Whether no pricing is configured.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Start of the month containing `now`, start of the next month, and the
/// number of days in the month.
fn month_bounds(now: DateTime<Utc>) -> CadenceResult<(DateTime<Utc>, DateTime<Utc>, u32)> {
    let first = |year: i32, month: u32| {
        NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| CadenceError::Orchestrator(format!("invalid month {year}-{month}")))
    };
    let start = first(now.year(), now.month())?;
    let next = if now.month() == 12 {
        first(now.year() + 1, 1)?
    } else {
        first(now.year(), now.month() + 1)?
    };
    let days = u32::try_from((next - start).num_days()).unwrap_or(31);
    let midnight = |d: NaiveDate| {
        d.and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .ok_or_else(|| CadenceError::Orchestrator(format!("invalid date {d}")))
    };
    Ok((midnight(start)?, midnight(next)?, days))
}

/// Monthly spending limit enforcement and cost accounting.
///
/// Spend is summed from the append-only cost entries in the store for the
/// current calendar month (UTC). Warnings are published once when they
/// newly apply, not on every check.
pub struct BudgetGuard {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    config: RwLock<BudgetConfig>,
    pricing: PricingTable,
    last_warning: Mutex<Option<BudgetWarning>>,
}

impl BudgetGuard {
    /// Guard reading spend from `store`.
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        config: BudgetConfig,
        pricing: PricingTable,
    ) -> Self {
        Self {
            store,
            notifier,
            config: RwLock::new(config),
            pricing,
            last_warning: Mutex::new(None),
        }
    }

    /// Current policy.
    pub fn config(&self) -> BudgetConfig {
        self.config.read().clone()
    }

    /// Swap the policy after validating it.
    pub fn set_config(&self, config: BudgetConfig) -> CadenceResult<()> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    /// Configured prices.
    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Month-to-date spend as of `now`.
    pub async fn monthly_spend_at(&self, now: DateTime<Utc>) -> CadenceResult<f64> {
        let (from, to, _) = month_bounds(now)?;
        let entries = self.store.get_cost_entries_between(from, to).await?;
        Ok(entries.iter().map(|e| e.cost_usd).sum())
    }

    /// Evaluate month-to-date spend now.
    pub async fn check_budget(&self) -> CadenceResult<BudgetCheck> {
        self.check_budget_at(Utc::now()).await
    }

    /// Evaluate month-to-date spend as of `now`.
    pub async fn check_budget_at(&self, now: DateTime<Utc>) -> CadenceResult<BudgetCheck> {
        let spent = self.monthly_spend_at(now).await?;
        Ok(BudgetCheck::evaluate(spent, &self.config.read()))
    }

    /// Append `entry` and re-evaluate the budget.
    pub async fn record_cost(&self, entry: CostEntry) -> CadenceResult<BudgetCheck> {
        self.store.add_cost_entry(&entry).await?;
        let check = self.check_budget_at(entry.recorded_at).await?;
        self.publish_if_new(&check);
        Ok(check)
    }

    /// Price `unit` from the pricing table and record it.
    pub async fn record_usage(
        &self,
        project_id: Option<Uuid>,
        agent_id: Option<Uuid>,
        provider: &str,
        model: &str,
        unit: CostUnit,
    ) -> CadenceResult<(CostEntry, BudgetCheck)> {
        let entry = CostEntry {
            id: Uuid::new_v4(),
            project_id,
            agent_id,
            provider: provider.to_string(),
            model: model.to_string(),
            unit,
            cost_usd: self.pricing.price(provider, model, &unit),
            recorded_at: Utc::now(),
        };
        let check = self.record_cost(entry.clone()).await?;
        Ok((entry, check))
    }

    /// Project month-end spend from the current daily average.
    pub async fn projection(&self) -> CadenceResult<CostProjection> {
        self.projection_at(Utc::now()).await
    }

    /// Linear month-end projection: month-to-date spend divided by the
    /// current day of month, times the days in the month.
    pub async fn projection_at(&self, now: DateTime<Utc>) -> CadenceResult<CostProjection> {
        let (_, _, days_in_month) = month_bounds(now)?;
        let spent = self.monthly_spend_at(now).await?;
        let days_elapsed = now.day();
        let daily_average = spent / f64::from(days_elapsed);
        let projected = daily_average * f64::from(days_in_month);
        let limit = self.config.read().monthly_limit_usd;
        Ok(CostProjection {
            spent_usd: spent,
            daily_average_usd: daily_average,
            projected_total_usd: projected,
            days_elapsed,
            days_in_month,
            limit_usd: limit,
            will_exceed: projected >= limit,
        })
    }

    fn publish_if_new(&self, check: &BudgetCheck) {
        let mut last = self.last_warning.lock();
        if check.warning == *last {
            return;
        }
        *last = check.warning;
        let Some(warning) = check.warning else {
            return;
        };
        match warning {
            BudgetWarning::BudgetExceeded => warn!(
                spent = check.spent_usd,
                limit = check.limit_usd,
                "Monthly budget exceeded, new work is stopped"
            ),
            _ => info!(
                warning = %warning,
                percent = check.usage_percent,
                "Budget warning"
            ),
        }
        notify_or_log(
            self.notifier.as_ref(),
            DomainEvent::new(
                warning.event_kind(),
                serde_json::json!({
                    "spent_usd": check.spent_usd,
                    "limit_usd": check.limit_usd,
                    "usage_percent": check.usage_percent,
                    "allowed": check.allowed,
                }),
            ),
        );
    }
}

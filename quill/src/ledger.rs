// quill/src/ledger.rs
//!
//! Usage ledger: token and cost metering with configurable spend limits.
//!
//! The ledger is one JSON document (`{daily, monthly, total}`) read and
//! written back whole on every change, so a day entry, its month entry and
//! the lifetime total always move together. Limits live in a second
//! document. Both degrade to no-ops when the store is absent or failing.

use crate::pricing::PriceTable;
use crate::store::KeyValueStore;
use chrono::{Local, NaiveDate};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;

/// Store key of the ledger document.
pub const LEDGER_KEY: &str = "usage_ledger";
/// Store key of the limit configuration.
pub const LIMITS_KEY: &str = "usage_limits";

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageEntry {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub request_count: u64,
    #[serde(alias = "cumulativeCost")]
    pub cost: f64,
}

impl UsageEntry {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    fn add(&mut self, input_tokens: u64, output_tokens: u64, cost: f64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.request_count += 1;
        self.cost += cost;
    }
}

/// The persisted ledger document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerDocument {
    /// Keyed by `YYYY-MM-DD`.
    pub daily: BTreeMap<String, UsageEntry>,
    /// Keyed by `YYYY-MM`.
    pub monthly: BTreeMap<String, UsageEntry>,
    pub total: UsageEntry,
}

/// Usage thresholds, checked only when `enabled` is set.
///
/// Each threshold is checked on its own and is reached when usage is greater
/// than or equal to it. A threshold of zero switches that one check off, so
/// a cost-only or token-only budget can be expressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitConfig {
    pub daily_tokens: u64,
    pub monthly_tokens: u64,
    pub daily_cost: f64,
    pub monthly_cost: f64,
    pub enabled: bool,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            daily_tokens: 1_000_000,
            monthly_tokens: 20_000_000,
            daily_cost: 1.0,
            monthly_cost: 20.0,
            enabled: false,
        }
    }
}

/// Result of [`UsageLedger::check_limits`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitCheck {
    pub allowed: bool,
    /// One entry per threshold reached.
    pub violations: Vec<String>,
    pub daily: UsageEntry,
    pub monthly: UsageEntry,
}

/// One day of the usage trend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub usage: UsageEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub today: UsageEntry,
    pub month: UsageEntry,
    pub total: UsageEntry,
}

pub fn day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn month_key(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub struct UsageLedger {
    store: Option<Arc<dyn KeyValueStore>>,
    prices: PriceTable,
}

impl UsageLedger {
    pub fn new(store: Option<Arc<dyn KeyValueStore>>, prices: PriceTable) -> Self {
        Self { store, prices }
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Meter one request against today's date. Returns its cost.
    pub fn record_usage(&self, input_tokens: u64, output_tokens: u64, model_id: &str) -> f64 {
        self.record_usage_on(today(), input_tokens, output_tokens, model_id)
    }

    pub fn record_usage_on(
        &self,
        date: NaiveDate,
        input_tokens: u64,
        output_tokens: u64,
        model_id: &str,
    ) -> f64 {
        let cost = self.prices.cost(model_id, input_tokens, output_tokens);

        // Never write after a failed read.
        let Some(mut ledger) = self.try_read::<LedgerDocument>(LEDGER_KEY) else {
            if self.store.is_some() {
                tracing::warn!(model = model_id, input_tokens, output_tokens, "ledger unreadable, usage not recorded");
            }
            return cost;
        };
        ledger
            .daily
            .entry(day_key(date))
            .or_default()
            .add(input_tokens, output_tokens, cost);
        ledger
            .monthly
            .entry(month_key(date))
            .or_default()
            .add(input_tokens, output_tokens, cost);
        ledger.total.add(input_tokens, output_tokens, cost);

        self.write(LEDGER_KEY, &ledger);
        tracing::info!(
            model = model_id,
            input_tokens,
            output_tokens,
            cost,
            "recorded usage"
        );
        cost
    }

    /// Compare today's and this month's usage with the configured limits.
    ///
    /// Advisory only: callers decide whether to refuse a request.
    pub fn check_limits(&self) -> LimitCheck {
        self.check_limits_on(today())
    }

    pub fn check_limits_on(&self, date: NaiveDate) -> LimitCheck {
        let limits = self.limits();
        let ledger = self.document();
        let daily = ledger.daily.get(&day_key(date)).copied().unwrap_or_default();
        let monthly = ledger.monthly.get(&month_key(date)).copied().unwrap_or_default();

        let mut violations = Vec::new();
        if limits.enabled {
            if limits.daily_tokens > 0 && daily.total_tokens() >= limits.daily_tokens {
                violations.push(format!(
                    "Daily token limit reached: {} / {} tokens",
                    daily.total_tokens(),
                    limits.daily_tokens
                ));
            }
            if limits.monthly_tokens > 0 && monthly.total_tokens() >= limits.monthly_tokens {
                violations.push(format!(
                    "Monthly token limit reached: {} / {} tokens",
                    monthly.total_tokens(),
                    limits.monthly_tokens
                ));
            }
            if limits.daily_cost > 0.0 && daily.cost >= limits.daily_cost {
                violations.push(format!(
                    "Daily cost limit reached: ${:.4} / ${:.2}",
                    daily.cost, limits.daily_cost
                ));
            }
            if limits.monthly_cost > 0.0 && monthly.cost >= limits.monthly_cost {
                violations.push(format!(
                    "Monthly cost limit reached: ${:.4} / ${:.2}",
                    monthly.cost, limits.monthly_cost
                ));
            }
        }

        LimitCheck {
            allowed: violations.is_empty(),
            violations,
            daily,
            monthly,
        }
    }

    /// One entry per day for the trailing `days` ending today, oldest first,
    /// zero-filled for days without activity.
    pub fn usage_trend(&self, days: u32) -> Vec<DailyUsage> {
        self.usage_trend_on(today(), days)
    }

    pub fn usage_trend_on(&self, today: NaiveDate, days: u32) -> Vec<DailyUsage> {
        let ledger = self.document();
        (0..days)
            .rev()
            .filter_map(|offset| today.checked_sub_days(chrono::Days::new(u64::from(offset))))
            .map(|date| DailyUsage {
                date,
                usage: ledger.daily.get(&day_key(date)).copied().unwrap_or_default(),
            })
            .collect()
    }

    pub fn summary(&self) -> UsageSummary {
        self.summary_on(today())
    }

    pub fn summary_on(&self, date: NaiveDate) -> UsageSummary {
        let ledger = self.document();
        UsageSummary {
            today: ledger.daily.get(&day_key(date)).copied().unwrap_or_default(),
            month: ledger.monthly.get(&month_key(date)).copied().unwrap_or_default(),
            total: ledger.total,
        }
    }

    /// Erase the ledger. Limit configuration is untouched.
    pub fn clear_usage_data(&self) {
        if let Some(store) = &self.store {
            if let Err(err) = store.remove(LEDGER_KEY) {
                tracing::warn!(error = %err, "failed to clear usage ledger");
            } else {
                tracing::info!("usage ledger cleared");
            }
        }
    }

    pub fn limits(&self) -> LimitConfig {
        self.read(LIMITS_KEY)
    }

    pub fn set_limits(&self, limits: &LimitConfig) {
        self.write(LIMITS_KEY, limits);
    }

    /// The whole ledger document as currently stored.
    pub fn document(&self) -> LedgerDocument {
        self.read(LEDGER_KEY)
    }

    fn read<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.try_read(key).unwrap_or_default()
    }

    /// `None` when there is no store or the store failed. A missing or
    /// undecodable document reads as the default.
    fn try_read<T: DeserializeOwned + Default>(&self, key: &str) -> Option<T> {
        let store = self.store.as_ref()?;
        match store.get(key) {
            Ok(Some(value)) => Some(serde_json::from_value(value).unwrap_or_else(|err| {
                tracing::warn!(key, error = %err, "discarding unreadable document");
                T::default()
            })),
            Ok(None) => Some(T::default()),
            Err(err) => {
                tracing::warn!(key, error = %err, "store unavailable");
                None
            }
        }
    }

    fn write<T: Serialize>(&self, key: &str, document: &T) {
        let Some(store) = &self.store else {
            return;
        };
        let result = serde_json::to_value(document)
            .map_err(crate::Error::from)
            .and_then(|value| store.set(key, &value));
        if let Err(err) = result {
            tracing::warn!(key, error = %err, "failed to persist document");
        }
    }
}

static ENCODER: Lazy<Option<CoreBPE>> = Lazy::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(err) => {
        tracing::warn!(error = %err, "token encoder unavailable, estimating from length");
        None
    }
});

/// Estimate the token count of `text` for providers that report no usage.
pub fn estimate_tokens(text: &str) -> u64 {
    match ENCODER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        None => (text.chars().count() as u64).div_ceil(4),
    }
}

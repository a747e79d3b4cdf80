use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use quill::ledger::{day_key, month_key, LIMITS_KEY};
use quill::store::SqliteStore;
use quill::{KeyValueStore, LimitConfig, PriceTable, UsageLedger};

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn sqlite_ledger() -> Result<(UsageLedger, Arc<dyn KeyValueStore>)> {
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::in_memory()?);
    let ledger = UsageLedger::new(Some(store.clone()), PriceTable::built_in());
    Ok((ledger, store))
}

#[test]
fn repeated_calls_accumulate_requests_and_cost() -> Result<()> {
    let (ledger, _store) = sqlite_ledger()?;
    let day = date("2026-05-14");

    let single = ledger.record_usage_on(day, 1000, 500, "deepseek-chat");
    let second = ledger.record_usage_on(day, 1000, 500, "deepseek-chat");
    assert_eq!(single, second);

    let doc = ledger.document();
    let entry = doc.daily[&day_key(day)];
    assert_eq!(entry.request_count, 2);
    assert_eq!(entry.input_tokens, 2000);
    assert_eq!(entry.output_tokens, 1000);
    assert!((entry.cost - 2.0 * single).abs() < 1e-12);
    assert_eq!(doc.monthly[&month_key(day)], entry);
    Ok(())
}

#[test]
fn lifetime_total_matches_sum_of_days() -> Result<()> {
    let (ledger, _store) = sqlite_ledger()?;
    ledger.record_usage_on(date("2026-01-30"), 300, 100, "deepseek-chat");
    ledger.record_usage_on(date("2026-01-31"), 50, 25, "deepseek-reasoner");
    ledger.record_usage_on(date("2026-02-01"), 1200, 800, "unknown-model");

    let doc = ledger.document();
    let summed: u64 = doc.daily.values().map(|e| e.total_tokens()).sum();
    assert_eq!(doc.total.total_tokens(), summed);
    assert_eq!(doc.total.request_count, 3);
    assert_eq!(doc.monthly.len(), 2);
    assert_eq!(doc.monthly["2026-01"].request_count, 2);

    let prices = PriceTable::built_in();
    let expected = prices.cost("deepseek-chat", 1200, 800);
    assert!((doc.daily["2026-02-01"].cost - expected).abs() < 1e-12);
    Ok(())
}

#[test]
fn disabled_limits_always_allow() -> Result<()> {
    let (ledger, _store) = sqlite_ledger()?;
    let day = date("2026-05-14");
    ledger.set_limits(&LimitConfig {
        daily_tokens: 1,
        monthly_tokens: 1,
        daily_cost: 0.000001,
        monthly_cost: 0.000001,
        enabled: false,
    });
    ledger.record_usage_on(day, 5_000_000, 5_000_000, "deepseek-chat");

    let check = ledger.check_limits_on(day);
    assert!(check.allowed);
    assert!(check.violations.is_empty());
    assert_eq!(check.daily.total_tokens(), 10_000_000);
    Ok(())
}

#[test]
fn daily_token_limit_is_reported() -> Result<()> {
    let (ledger, _store) = sqlite_ledger()?;
    let day = date("2026-05-14");
    ledger.set_limits(&LimitConfig {
        daily_tokens: 100,
        enabled: true,
        ..LimitConfig::default()
    });
    ledger.record_usage_on(day, 100, 50, "deepseek-chat");

    let check = ledger.check_limits_on(day);
    assert!(!check.allowed);
    assert_eq!(check.violations.len(), 1);
    assert!(check.violations[0].starts_with("Daily token limit reached"));

    // A new day starts from zero, but the month still counts.
    let tomorrow = ledger.check_limits_on(date("2026-05-15"));
    assert!(tomorrow.allowed);
    assert_eq!(tomorrow.monthly.total_tokens(), 150);
    Ok(())
}

#[test]
fn several_thresholds_can_fail_together() -> Result<()> {
    let (ledger, _store) = sqlite_ledger()?;
    let day = date("2026-05-14");
    ledger.set_limits(&LimitConfig {
        daily_tokens: 10,
        monthly_tokens: 10,
        daily_cost: 0.0,
        monthly_cost: 0.0001,
        enabled: true,
    });
    ledger.record_usage_on(day, 1_000, 1_000, "deepseek-chat");

    let check = ledger.check_limits_on(day);
    assert!(!check.allowed);
    assert_eq!(check.violations.len(), 3, "{:?}", check.violations);
    assert!(check.violations.iter().any(|v| v.starts_with("Monthly token limit")));
    assert!(check.violations.iter().any(|v| v.starts_with("Monthly cost limit")));
    assert!(!check.violations.iter().any(|v| v.starts_with("Daily cost limit")));
    Ok(())
}

#[test]
fn trend_is_oldest_first_and_zero_filled() -> Result<()> {
    let (ledger, _store) = sqlite_ledger()?;
    ledger.record_usage_on(date("2026-02-27"), 10, 5, "deepseek-chat");
    ledger.record_usage_on(date("2026-03-01"), 20, 10, "deepseek-chat");

    let trend = ledger.usage_trend_on(date("2026-03-01"), 4);
    let dates: Vec<String> = trend.iter().map(|d| day_key(d.date)).collect();
    assert_eq!(dates, ["2026-02-26", "2026-02-27", "2026-02-28", "2026-03-01"]);
    let tokens: Vec<u64> = trend.iter().map(|d| d.usage.total_tokens()).collect();
    assert_eq!(tokens, [0, 15, 0, 30]);

    assert!(ledger.usage_trend_on(date("2026-03-01"), 0).is_empty());
    Ok(())
}

#[test]
fn clearing_usage_keeps_limits() -> Result<()> {
    let (ledger, store) = sqlite_ledger()?;
    let limits = LimitConfig {
        daily_tokens: 42,
        enabled: true,
        ..LimitConfig::default()
    };
    ledger.set_limits(&limits);
    ledger.record_usage_on(date("2026-05-14"), 10, 10, "deepseek-chat");

    ledger.clear_usage_data();
    assert_eq!(ledger.document(), Default::default());
    assert_eq!(ledger.limits(), limits);
    assert!(store.get(LIMITS_KEY)?.is_some());
    Ok(())
}

#[test]
fn persisted_documents_use_camel_case() -> Result<()> {
    let (ledger, store) = sqlite_ledger()?;
    ledger.record_usage_on(date("2026-05-14"), 7, 3, "deepseek-chat");
    ledger.set_limits(&LimitConfig::default());

    let raw = store.get("usage_ledger")?.unwrap();
    let day = &raw["daily"]["2026-05-14"];
    assert_eq!(day["inputTokens"], 7);
    assert_eq!(day["outputTokens"], 3);
    assert_eq!(day["requestCount"], 1);
    assert!(raw["total"]["cost"].is_number());

    let limits = store.get(LIMITS_KEY)?.unwrap();
    assert_eq!(limits["dailyTokens"], 1_000_000);
    assert_eq!(limits["enabled"], false);
    Ok(())
}

//! End-to-end refresh cycle tests driving the engine through a stub
//! fetcher, without a network.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use heliograph::config::{Config, SiteConfig};
use heliograph::coordinator::ForecastEngine;
use heliograph::error::{HeliographError, Result};
use heliograph::solcast::{ForecastFetcher, RawInterval};
use heliograph::store::EstimateField;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Per-site behaviour of the stub fetcher
#[derive(Clone)]
enum SiteMode {
    Ok,
    /// What the real client returns once its retry budget is spent
    FetchFailure,
    Auth,
    QuotaExhausted,
    /// Sleep this many seconds before answering
    Slow(u64),
}

struct StubFetcher {
    modes: HashMap<String, SiteMode>,
    data: Vec<RawInterval>,
    forecast_calls: AtomicU32,
    actuals_calls: AtomicU32,
}

impl StubFetcher {
    fn new(modes: HashMap<String, SiteMode>, data: Vec<RawInterval>) -> Self {
        Self {
            modes,
            data,
            forecast_calls: AtomicU32::new(0),
            actuals_calls: AtomicU32::new(0),
        }
    }

    fn uniform(mode: SiteMode, data: Vec<RawInterval>) -> Self {
        let mut modes = HashMap::new();
        modes.insert("*".to_string(), mode);
        Self::new(modes, data)
    }

    fn mode_for(&self, site: &SiteConfig) -> SiteMode {
        self.modes
            .get(&site.resource_id)
            .or_else(|| self.modes.get("*"))
            .cloned()
            .unwrap_or(SiteMode::Ok)
    }

    async fn respond(&self, site: &SiteConfig) -> Result<Vec<RawInterval>> {
        match self.mode_for(site) {
            SiteMode::Ok => Ok(self.data.clone()),
            SiteMode::FetchFailure => Err(HeliographError::api(format!(
                "All 10 fetch attempts failed for site {}",
                site.resource_id
            ))),
            SiteMode::Auth => Err(HeliographError::auth("API rejected credential")),
            SiteMode::QuotaExhausted => Err(HeliographError::quota_exhausted("******key")),
            SiteMode::Slow(secs) => {
                tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
                Ok(self.data.clone())
            }
        }
    }
}

#[async_trait]
impl ForecastFetcher for StubFetcher {
    async fn fetch_forecasts(&self, site: &SiteConfig, _hours: u32) -> Result<Vec<RawInterval>> {
        self.forecast_calls.fetch_add(1, Ordering::SeqCst);
        self.respond(site).await
    }

    async fn fetch_estimated_actuals(&self, site: &SiteConfig) -> Result<Vec<RawInterval>> {
        self.actuals_calls.fetch_add(1, Ordering::SeqCst);
        match self.mode_for(site) {
            SiteMode::Ok | SiteMode::Slow(_) => Ok(Vec::new()),
            _ => self.respond(site).await.map(|_| Vec::new()),
        }
    }
}

fn site(resource_id: &str, api_key: &str) -> SiteConfig {
    SiteConfig {
        resource_id: resource_id.to_string(),
        api_key: api_key.to_string(),
        name: None,
        exclude_from_totals: false,
        daily_limit: 10,
    }
}

fn test_config(dir: &tempfile::TempDir, sites: Vec<SiteConfig>) -> Config {
    let mut config = Config::default();
    config.sites = sites;
    config.storage.data_dir = dir.path().to_string_lossy().to_string();
    config.refresh.auto_update = false;
    config
}

/// Noon of the current UTC day; all test data hangs off this instant
fn pinned_noon() -> DateTime<Utc> {
    let today = Utc::now().date_naive();
    DateTime::from_naive_utc_and_offset(today.and_hms_opt(12, 0, 0).unwrap(), Utc)
}

fn day_start() -> DateTime<Utc> {
    pinned_noon() - Duration::hours(12)
}

/// Half-hour records across today's daylight, with 4.0 kW at 10:00
fn today_data() -> Vec<RawInterval> {
    let mut data = Vec::new();
    for slot in 14..44 {
        let at = day_start() + Duration::minutes(30 * slot);
        let kw = if slot == 20 { 4.0 } else { 1.0 };
        data.push(RawInterval {
            period_start: at,
            pv_estimate: kw,
            pv_estimate10: kw * 0.5,
            pv_estimate90: kw * 1.5,
        });
    }
    data
}

#[tokio::test]
async fn refresh_merges_persists_and_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config.clone(), fetcher).unwrap();

    let outcome = engine.run_cycle(false, pinned_noon()).await.unwrap();
    assert_eq!(outcome.succeeded, vec!["s1".to_string()]);
    assert!(outcome.failed.is_empty());
    assert_eq!(engine.last_updated().await, Some(pinned_noon()));

    let intervals = engine
        .query_forecast(day_start(), day_start() + Duration::days(1), None, false)
        .await
        .unwrap();
    assert_eq!(intervals.len(), 30);

    // A fresh engine on the same data directory serves the persisted cache
    drop(engine);
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::FetchFailure, Vec::new()));
    let restored = ForecastEngine::new(config, fetcher).unwrap();
    let intervals = restored
        .query_forecast(day_start(), day_start() + Duration::days(1), Some("s1"), false)
        .await
        .unwrap();
    assert_eq!(intervals.len(), 30);
    assert_eq!(restored.last_updated().await, Some(pinned_noon()));
}

#[tokio::test]
async fn scheduled_refresh_charges_usage_but_force_does_not() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config, fetcher.clone()).unwrap();

    engine.run_cycle(false, pinned_noon()).await.unwrap();
    // First run fetches estimated actuals too, so two calls are charged
    assert_eq!(engine.get_usage().await[0].1.used_count, 2);

    engine
        .run_cycle(true, pinned_noon() + Duration::minutes(20))
        .await
        .unwrap();
    assert_eq!(engine.get_usage().await[0].1.used_count, 2);
    assert!(fetcher.forecast_calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn quota_exhausted_skips_site_and_keeps_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);

    // Seed a cache and spend the whole quota
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config.clone(), fetcher).unwrap();
    engine.run_cycle(false, pinned_noon()).await.unwrap();
    drop(engine);

    let mut records: HashMap<String, heliograph::usage::UsageRecord> = HashMap::new();
    records.insert(
        "key-1".to_string(),
        heliograph::usage::UsageRecord {
            used_count: 10,
            daily_limit: 10,
            last_reset: Utc::now().date_naive(),
        },
    );
    std::fs::write(
        dir.path().join("solcast-usage.json"),
        serde_json::to_string(&records).unwrap(),
    )
    .unwrap();

    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config, fetcher.clone()).unwrap();
    let outcome = engine
        .run_cycle(false, pinned_noon() + Duration::minutes(30))
        .await
        .unwrap();

    assert_eq!(outcome.skipped_quota, vec!["s1".to_string()]);
    assert!(outcome.succeeded.is_empty());
    // No fetch happened, the counter is untouched and cache still serves
    assert_eq!(fetcher.forecast_calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.get_usage().await[0].1.used_count, 10);
    let intervals = engine
        .query_forecast(day_start(), day_start() + Duration::days(1), None, false)
        .await
        .unwrap();
    assert_eq!(intervals.len(), 30);
}

#[tokio::test]
async fn fetch_failure_retains_previous_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);

    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config.clone(), fetcher).unwrap();
    engine.run_cycle(false, pinned_noon()).await.unwrap();
    drop(engine);

    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::FetchFailure, Vec::new()));
    let engine = ForecastEngine::new(config, fetcher).unwrap();
    let outcome = engine
        .run_cycle(false, pinned_noon() + Duration::minutes(30))
        .await
        .unwrap();

    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, "s1");
    // The failed cycle neither wiped the cache nor charged the quota
    let intervals = engine
        .query_forecast(day_start(), day_start() + Duration::days(1), None, false)
        .await
        .unwrap();
    assert_eq!(intervals.len(), 30);
    assert_eq!(engine.get_usage().await[0].1.used_count, 0);
}

#[tokio::test]
async fn auth_failure_surfaces_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Auth, Vec::new()));
    let engine = ForecastEngine::new(config, fetcher).unwrap();

    let result = engine.run_cycle(false, pinned_noon()).await;
    assert!(matches!(result, Err(HeliographError::Auth { .. })));
}

#[tokio::test]
async fn first_run_failure_reports_cache_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::FetchFailure, Vec::new()));
    let engine = ForecastEngine::new(config, fetcher).unwrap();

    let result = engine.run_cycle(false, pinned_noon()).await;
    assert!(matches!(
        result,
        Err(HeliographError::CacheUnavailable { .. })
    ));
}

#[tokio::test]
async fn server_reported_quota_marks_credential_spent() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);

    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config.clone(), fetcher).unwrap();
    engine.run_cycle(false, pinned_noon()).await.unwrap();
    drop(engine);

    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::QuotaExhausted, Vec::new()));
    let engine = ForecastEngine::new(config, fetcher).unwrap();
    let outcome = engine
        .run_cycle(false, pinned_noon() + Duration::minutes(30))
        .await
        .unwrap();

    assert_eq!(outcome.skipped_quota, vec!["s1".to_string()]);
    let (_, record) = &engine.get_usage().await[0];
    assert_eq!(record.used_count, record.daily_limit);
}

#[tokio::test]
async fn dampening_applies_at_merge_and_shadows_raw() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config, fetcher).unwrap();

    engine.set_dampening(Some("s1"), &[0.5; 24]).await.unwrap();
    engine.run_cycle(false, pinned_noon()).await.unwrap();

    let ten = day_start() + Duration::hours(10);
    let dampened = engine
        .query_forecast(ten, ten + Duration::minutes(30), Some("s1"), false)
        .await
        .unwrap();
    assert!((dampened[0].pv_estimate - 2.0).abs() < 1e-9);

    let raw = engine
        .query_forecast(ten, ten + Duration::minutes(30), Some("s1"), true)
        .await
        .unwrap();
    assert!((raw[0].pv_estimate - 4.0).abs() < 1e-9);
}

#[tokio::test]
async fn all_scope_set_clears_granular_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config, fetcher).unwrap();

    engine.set_dampening(Some("s1"), &[0.5; 24]).await.unwrap();
    engine.set_dampening(None, &[1.0; 24]).await.unwrap();

    let view = engine.get_dampening(Some("s1")).await.unwrap();
    assert_eq!(view.scope, "all");
    assert_eq!(view.factors, vec![1.0; 24]);
}

#[tokio::test]
async fn invalid_dampening_rejected_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config, fetcher).unwrap();

    assert!(engine.set_dampening(Some("s1"), &[0.5; 12]).await.is_err());
    assert!(engine.set_dampening(Some("s1"), &[2.0; 24]).await.is_err());
    assert!(engine.set_dampening(Some("nope"), &[0.5; 24]).await.is_err());

    let view = engine.get_dampening(Some("s1")).await.unwrap();
    assert_eq!(view.factors, vec![1.0; 24]);
}

#[tokio::test]
async fn manual_refresh_refused_while_auto_updates_active() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, vec![site("s1", "key-1")]);
    config.refresh.auto_update = true;
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config, fetcher).unwrap();

    let refused = engine.refresh(false).await;
    assert!(matches!(refused, Err(HeliographError::Validation { .. })));

    // Forcing bypasses the refusal (and the guard)
    assert!(engine.refresh(true).await.is_ok());
}

#[tokio::test]
async fn guard_blocks_back_to_back_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config, fetcher).unwrap();

    engine.run_cycle(false, pinned_noon()).await.unwrap();

    let blocked = engine
        .run_cycle(false, pinned_noon() + Duration::minutes(5))
        .await;
    assert!(blocked.is_err());

    // Forced cycles ignore the guard; later cycles clear it
    assert!(engine
        .run_cycle(true, pinned_noon() + Duration::minutes(5))
        .await
        .is_ok());
    assert!(engine
        .run_cycle(false, pinned_noon() + Duration::minutes(40))
        .await
        .is_ok());
}

#[tokio::test]
async fn unknown_site_is_a_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config, fetcher).unwrap();

    let result = engine
        .query_forecast(day_start(), pinned_noon(), Some("nope"), false)
        .await;
    assert!(matches!(result, Err(HeliographError::Validation { .. })));
}

#[tokio::test]
async fn momentary_power_matches_merged_sample() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config, fetcher).unwrap();

    engine.run_cycle(false, pinned_noon()).await.unwrap();

    let ten = day_start() + Duration::hours(10);
    let watts = engine.power_at(ten, EstimateField::Estimate, None).await;
    assert!((watts - 4000.0).abs() < 1e-6, "watts was {}", watts);

    // The hard limit clips served power without touching the cache
    engine.set_hard_limit(2500.0).await.unwrap();
    let clipped = engine.power_at(ten, EstimateField::Estimate, None).await;
    assert!((clipped - 2500.0).abs() < 1e-9);
    engine.remove_hard_limit().await;
    let restored = engine.power_at(ten, EstimateField::Estimate, None).await;
    assert!((restored - 4000.0).abs() < 1e-6);
}

#[tokio::test]
async fn clear_all_data_wipes_caches() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, vec![site("s1", "key-1")]);
    let fetcher = Arc::new(StubFetcher::uniform(SiteMode::Ok, today_data()));
    let engine = ForecastEngine::new(config, fetcher).unwrap();

    engine.run_cycle(false, pinned_noon()).await.unwrap();
    assert!(dir.path().join("solcast.json").exists());

    engine.clear_all_data().await.unwrap();
    assert!(!dir.path().join("solcast.json").exists());
    assert_eq!(engine.last_updated().await, None);
    let intervals = engine
        .query_forecast(day_start(), day_start() + Duration::days(1), None, false)
        .await
        .unwrap();
    assert!(intervals.is_empty());

    // The next cycle rebuilds from the service
    let outcome = engine
        .run_cycle(false, pinned_noon() + Duration::minutes(40))
        .await
        .unwrap();
    assert!(outcome.any_success());
}

#[tokio::test(start_paused = true)]
async fn unresponsive_site_is_abandoned_for_the_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(
        &dir,
        vec![site("slow", "key-1"), site("fast", "key-2")],
    );
    config.refresh.fetch_timeout_secs = 1;

    let mut modes = HashMap::new();
    modes.insert("slow".to_string(), SiteMode::Slow(30));
    modes.insert("fast".to_string(), SiteMode::Ok);
    let fetcher = Arc::new(StubFetcher::new(modes, today_data()));
    let engine = ForecastEngine::new(config, fetcher).unwrap();

    let outcome = engine.run_cycle(false, pinned_noon()).await.unwrap();
    assert_eq!(outcome.succeeded, vec!["fast".to_string()]);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, "slow");
}

#[tokio::test]
async fn shutdown_aborts_in_flight_fetch_and_skips_remaining() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &dir,
        vec![site("first", "key-1"), site("stuck", "key-2"), site("never", "key-3")],
    );

    let mut modes = HashMap::new();
    modes.insert("first".to_string(), SiteMode::Ok);
    modes.insert("stuck".to_string(), SiteMode::Slow(600));
    modes.insert("never".to_string(), SiteMode::Ok);
    let fetcher = Arc::new(StubFetcher::new(modes, today_data()));
    let engine = Arc::new(ForecastEngine::new(config, fetcher.clone()).unwrap());

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_cycle(false, pinned_noon()).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    engine.shutdown();

    let outcome = runner.await.unwrap().unwrap();
    // The first site's merge survives; the stuck fetch is aborted and the
    // remaining site is never attempted
    assert_eq!(outcome.succeeded, vec!["first".to_string()]);
    assert_eq!(fetcher.forecast_calls.load(Ordering::SeqCst), 2);
    let intervals = engine
        .query_forecast(day_start(), day_start() + Duration::days(1), Some("first"), false)
        .await
        .unwrap();
    assert_eq!(intervals.len(), 30);
}

//! Refresh coordination and the engine's command/query surface
//!
//! `ForecastEngine` owns every engine component and orchestrates one fetch
//! cycle at a time: sites are fetched strictly sequentially, each merge is
//! persisted before the next site starts, and spline curves are rebuilt
//! once the cycle completes. Collaborators (sensor frameworks, service
//! handlers, the daemon timer) only ever talk to this type; the engine
//! itself holds no timers.

use crate::aggregate::{Aggregates, DayDetail};
use crate::config::{Config, SiteConfig};
use crate::dampening::{DampeningTable, DampeningView};
use crate::error::{HeliographError, Result};
use crate::logging::get_logger;
use crate::solcast::ForecastFetcher;
use crate::spline::SplineSet;
use crate::store::{EstimateField, ForecastInterval, ForecastStore};
use crate::usage::{UsageRecord, UsageTracker};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, watch};

/// Result of one refresh cycle
#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    /// Sites whose fetch and merge completed
    pub succeeded: Vec<String>,
    /// Sites skipped because their credential's quota is spent
    pub skipped_quota: Vec<String>,
    /// Sites that failed this cycle, with the failure text
    pub failed: Vec<(String, String)>,
}

impl RefreshOutcome {
    /// Whether at least one site produced fresh data
    pub fn any_success(&self) -> bool {
        !self.succeeded.is_empty()
    }
}

/// The forecast data engine
pub struct ForecastEngine {
    config: Config,
    tz: Tz,
    client: Arc<dyn ForecastFetcher>,
    usage: Mutex<UsageTracker>,
    dampening: Mutex<DampeningTable>,
    store: RwLock<ForecastStore>,
    splines: RwLock<SplineSet>,
    hard_limit_w: RwLock<Option<f64>>,
    last_cycle_start: Mutex<Option<DateTime<Utc>>>,
    shutdown_tx: watch::Sender<bool>,
    logger: crate::logging::StructuredLogger,
}

impl ForecastEngine {
    /// Build the engine from configuration, restoring all persisted caches.
    ///
    /// The fetcher is injected so tests can drive cycles without a network.
    pub fn new(config: Config, client: Arc<dyn ForecastFetcher>) -> Result<Self> {
        config.validate()?;
        let tz = config.tz()?;
        let logger = get_logger("coordinator");
        let now = Utc::now();

        let usage = UsageTracker::load(
            config.storage.usage_cache_path(),
            &config.credentials(),
            now,
        );

        let mut dampening = DampeningTable::load(config.storage.dampening_path());
        if let Some(factors) = &config.dampening {
            if !dampening.is_active() {
                dampening.set(None, factors)?;
                logger.info("Seeded dampening factors from configuration");
            }
        }

        let excluded: BTreeSet<String> = config
            .sites
            .iter()
            .filter(|s| s.exclude_from_totals)
            .map(|s| s.resource_id.clone())
            .collect();

        let store = match ForecastStore::load(
            config.storage.forecast_cache_path(),
            config.storage.shadow_cache_path(),
            excluded.clone(),
        ) {
            Ok(store) => store,
            Err(e) => {
                // A cache that fails closed is rebuilt from the service
                logger.warn(&format!("Starting with an empty forecast cache: {}", e));
                ForecastStore::empty(
                    config.storage.forecast_cache_path(),
                    config.storage.shadow_cache_path(),
                    excluded,
                )
            }
        };

        let day_start = local_day_start(now, tz, 0);
        let site_ids: Vec<String> = config.sites.iter().map(|s| s.resource_id.clone()).collect();
        let splines = SplineSet::build(&store, &site_ids, day_start);

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            tz,
            client,
            usage: Mutex::new(usage),
            dampening: Mutex::new(dampening),
            store: RwLock::new(store),
            splines: RwLock::new(splines),
            hard_limit_w: RwLock::new(None),
            last_cycle_start: Mutex::new(None),
            shutdown_tx,
            logger,
        })
    }

    /// Signal the engine to abandon any in-flight cycle.
    ///
    /// `send_replace` keeps the flag set even when no cycle is currently
    /// subscribed, so a shutdown between cycles is not lost.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// User-initiated refresh.
    ///
    /// With `force` the quota gate, the cycle guard and usage accounting
    /// are all bypassed, so manual diagnosis never costs quota. Without
    /// `force` the command is refused while automatic updates are active.
    pub async fn refresh(&self, force: bool) -> Result<RefreshOutcome> {
        if !force && self.config.refresh.auto_update {
            return Err(HeliographError::validation(
                "refresh",
                "automatic updates are enabled; use the force variant instead",
            ));
        }
        self.run_cycle(force, Utc::now()).await
    }

    /// Scheduler-initiated refresh, subject to quota and the cycle guard
    pub async fn scheduled_refresh(&self) -> Result<RefreshOutcome> {
        self.run_cycle(false, Utc::now()).await
    }

    /// Run one refresh cycle at a pinned instant (exposed for tests)
    pub async fn run_cycle(&self, force: bool, now: DateTime<Utc>) -> Result<RefreshOutcome> {
        {
            // The persisted update stamp also counts, so a restart that
            // coincides with a scheduled trigger cannot double-fetch
            let persisted = self.store.read().await.last_updated();
            let mut last = self.last_cycle_start.lock().await;
            let most_recent = match (*last, persisted) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            if let Some(started) = most_recent {
                let guard = Duration::minutes(self.config.refresh.guard_minutes as i64);
                if !force && now < started + guard {
                    return Err(HeliographError::generic(format!(
                        "Not refreshing: last cycle at {} is within the {}-minute guard",
                        started, self.config.refresh.guard_minutes
                    )));
                }
            }
            *last = Some(now);
        }

        self.usage.lock().await.maybe_reset(now)?;

        let first_run = !self.store.read().await.has_data();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut outcome = RefreshOutcome::default();

        for site in &self.config.sites {
            if *shutdown.borrow() {
                self.logger.info("Shutdown requested, skipping remaining sites");
                break;
            }

            if !force && !self.usage.lock().await.has_quota(&site.api_key) {
                self.logger.info(&format!(
                    "API polling limit exhausted, not fetching site {}",
                    site.resource_id
                ));
                outcome.skipped_quota.push(site.resource_id.clone());
                continue;
            }

            self.logger
                .info(&format!("Getting forecast update for site {}", site.resource_id));

            let fetch = self.fetch_site(site, first_run, force, now);
            let timeout = std::time::Duration::from_secs(self.config.refresh.fetch_timeout_secs);
            let fetched = tokio::select! {
                result = tokio::time::timeout(timeout, fetch) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(HeliographError::timeout(format!(
                        "Site {} fetch exceeded {}s, abandoned for this cycle",
                        site.resource_id, self.config.refresh.fetch_timeout_secs
                    ))),
                },
                _ = shutdown.changed() => {
                    self.logger.info("Shutdown requested, aborting in-flight fetch");
                    break;
                }
            };

            match fetched {
                Ok(intervals) => {
                    let dampening = self.dampening.lock().await;
                    let mut store = self.store.write().await;
                    store.merge(&site.resource_id, &intervals, now, &dampening, self.tz)?;
                    outcome.succeeded.push(site.resource_id.clone());
                }
                Err(HeliographError::Auth { message }) => {
                    // Bad credentials will not fix themselves mid-cycle
                    return Err(HeliographError::Auth { message });
                }
                Err(HeliographError::QuotaExhausted { credential }) => {
                    self.usage.lock().await.mark_exhausted(&site.api_key);
                    self.logger.warn(&format!(
                        "Quota exhausted for credential {}, cache retained",
                        credential
                    ));
                    outcome.skipped_quota.push(site.resource_id.clone());
                }
                Err(e) => {
                    self.logger.warn(&format!(
                        "Forecast update for site {} failed, keeping cached data: {}",
                        site.resource_id, e
                    ));
                    outcome.failed.push((site.resource_id.clone(), e.to_string()));
                }
            }
        }

        if outcome.any_success() {
            {
                let mut store = self.store.write().await;
                store.mark_updated(now)?;
                store.check_data_records(now);
            }
            self.rebuild_splines(now).await;
            self.logger.info("Forecast update completed successfully");
        } else if first_run {
            return Err(HeliographError::cache_unavailable(
                "first refresh produced no data for any site",
            ));
        }

        Ok(outcome)
    }

    /// Fetch one site's records, charging usage for each successful call
    /// unless the cycle is forced.
    async fn fetch_site(
        &self,
        site: &SiteConfig,
        first_run: bool,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<crate::solcast::RawInterval>> {
        let horizon = local_day_start(now, self.tz, 8);
        let hours = ((horizon - now).num_minutes() as f64 / 60.0).ceil().max(1.0) as u32;

        let mut intervals = Vec::new();
        if first_run {
            // A new install back-fills the past week from estimated actuals
            let actuals = self.client.fetch_estimated_actuals(site).await?;
            if !force {
                self.usage.lock().await.record_success(&site.api_key);
            }
            intervals.extend(actuals);
        }

        let forecasts = self.client.fetch_forecasts(site, hours).await?;
        if !force {
            self.usage.lock().await.record_success(&site.api_key);
        }
        intervals.extend(forecasts);
        Ok(intervals)
    }

    /// Rebuild today's spline curves.
    ///
    /// Called after every successful cycle, and by the daemon at local
    /// midnight so the new day is seeded before any fetch happens.
    pub async fn rebuild_splines(&self, now: DateTime<Utc>) {
        let day_start = local_day_start(now, self.tz, 0);
        let site_ids: Vec<String> = self
            .config
            .sites
            .iter()
            .map(|s| s.resource_id.clone())
            .collect();
        let store = self.store.read().await;
        let rebuilt = SplineSet::build(&store, &site_ids, day_start);
        drop(store);
        *self.splines.write().await = rebuilt;
        self.logger.debug("Recalculated forecast splines");
    }

    /// Query cached intervals, `start <= period_start < end`
    pub async fn query_forecast(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        site: Option<&str>,
        undampened: bool,
    ) -> Result<Vec<ForecastInterval>> {
        if let Some(site_id) = site {
            self.require_site(site_id)?;
        }
        Ok(self.store.read().await.query(site, start, end, undampened))
    }

    /// Current dampening factors, with the "all"-precedence display rule
    pub async fn get_dampening(&self, site: Option<&str>) -> Result<DampeningView> {
        if let Some(site_id) = site {
            self.require_site(site_id)?;
        }
        Ok(self.dampening.lock().await.get(site))
    }

    /// Install dampening factors for a site or for all sites
    pub async fn set_dampening(&self, site: Option<&str>, factors: &[f64]) -> Result<()> {
        if let Some(site_id) = site {
            self.require_site(site_id)?;
        }
        self.dampening.lock().await.set(site, factors)
    }

    /// Usage counters per credential, keys redacted
    pub async fn get_usage(&self) -> Vec<(String, UsageRecord)> {
        self.usage.lock().await.usage()
    }

    /// Clip every served value to `watts` from now on
    pub async fn set_hard_limit(&self, watts: f64) -> Result<()> {
        if !watts.is_finite() || watts < 0.0 {
            return Err(HeliographError::validation(
                "hard_limit",
                "hard limit must be a non-negative number of watts",
            ));
        }
        *self.hard_limit_w.write().await = Some(watts);
        self.logger.info(&format!("Hard limit set to {:.1} W", watts));
        Ok(())
    }

    /// Remove the serve-side clip
    pub async fn remove_hard_limit(&self) {
        *self.hard_limit_w.write().await = None;
        self.logger.info("Hard limit removed");
    }

    /// Currently applied hard limit, watts
    pub async fn hard_limit(&self) -> Option<f64> {
        *self.hard_limit_w.read().await
    }

    /// Delete all persisted caches; the next refresh rebuilds from the
    /// service. Dampening is configuration, not a cache, and is retained.
    pub async fn clear_all_data(&self) -> Result<()> {
        let now = Utc::now();
        self.store.write().await.clear()?;
        self.usage.lock().await.clear(now)?;
        *self.last_cycle_start.lock().await = None;
        self.rebuild_splines(now).await;
        Ok(())
    }

    /// Timestamp of the last completed refresh
    pub async fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.store.read().await.last_updated()
    }

    /// Whether served data should be annotated as stale
    pub async fn is_stale(&self) -> bool {
        self.store.read().await.is_stale(Utc::now())
    }

    /// Momentary combined power now, watts
    pub async fn power_now(&self, field: EstimateField, site: Option<&str>) -> f64 {
        self.power_at(Utc::now(), field, site).await
    }

    /// Momentary power `minutes` from now, watts
    pub async fn power_in(&self, minutes: i64, field: EstimateField, site: Option<&str>) -> f64 {
        self.power_at(Utc::now() + Duration::minutes(minutes), field, site)
            .await
    }

    /// Momentary power at a pinned instant, watts
    pub async fn power_at(
        &self,
        at: DateTime<Utc>,
        field: EstimateField,
        site: Option<&str>,
    ) -> f64 {
        let store = self.store.read().await;
        let splines = self.splines.read().await;
        let limit = *self.hard_limit_w.read().await;
        Aggregates::new(&store, &splines, limit, self.tz).power_at(at, field, site)
    }

    /// Forecast energy for a local day, kWh
    pub async fn daily_total(
        &self,
        day_offset: i64,
        field: EstimateField,
        site: Option<&str>,
    ) -> f64 {
        let store = self.store.read().await;
        let splines = self.splines.read().await;
        let limit = *self.hard_limit_w.read().await;
        Aggregates::new(&store, &splines, limit, self.tz)
            .daily_total(Utc::now(), day_offset, field, site)
    }

    /// Peak power and its period for a local day
    pub async fn peak_day(
        &self,
        day_offset: i64,
        field: EstimateField,
        site: Option<&str>,
    ) -> Option<(f64, DateTime<Utc>)> {
        let store = self.store.read().await;
        let splines = self.splines.read().await;
        let limit = *self.hard_limit_w.read().await;
        Aggregates::new(&store, &splines, limit, self.tz)
            .peak(Utc::now(), day_offset, field, site)
    }

    /// Energy in the current wall-clock hour, kWh
    pub async fn this_hour_energy(&self, field: EstimateField, site: Option<&str>) -> f64 {
        let store = self.store.read().await;
        let splines = self.splines.read().await;
        let limit = *self.hard_limit_w.read().await;
        Aggregates::new(&store, &splines, limit, self.tz)
            .this_hour_energy(Utc::now(), field, site)
    }

    /// Energy in the next wall-clock hour, kWh
    pub async fn next_hour_energy(&self, field: EstimateField, site: Option<&str>) -> f64 {
        let store = self.store.read().await;
        let splines = self.splines.read().await;
        let limit = *self.hard_limit_w.read().await;
        Aggregates::new(&store, &splines, limit, self.tz)
            .next_hour_energy(Utc::now(), field, site)
    }

    /// Energy over the next `hours` hours from this instant, kWh
    pub async fn next_x_hours_energy(
        &self,
        hours: f64,
        field: EstimateField,
        site: Option<&str>,
    ) -> f64 {
        let store = self.store.read().await;
        let splines = self.splines.read().await;
        let limit = *self.hard_limit_w.read().await;
        Aggregates::new(&store, &splines, limit, self.tz)
            .next_hours_energy(Utc::now(), hours, field, site)
    }

    /// Energy remaining until local midnight, kWh
    pub async fn remaining_today(&self, field: EstimateField, site: Option<&str>) -> f64 {
        let store = self.store.read().await;
        let splines = self.splines.read().await;
        let limit = *self.hard_limit_w.read().await;
        Aggregates::new(&store, &splines, limit, self.tz)
            .remaining_today(Utc::now(), field, site)
    }

    /// Half-hourly breakdown of a local day
    pub async fn day_detail(&self, day_offset: i64, site: Option<&str>) -> DayDetail {
        let store = self.store.read().await;
        let splines = self.splines.read().await;
        let limit = *self.hard_limit_w.read().await;
        Aggregates::new(&store, &splines, limit, self.tz)
            .day_detail(Utc::now(), day_offset, site)
    }

    /// Configured refresh interval for the daemon timer
    pub fn refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.refresh.interval_minutes * 60)
    }

    /// Whether automatic updates are configured
    pub fn auto_update(&self) -> bool {
        self.config.refresh.auto_update
    }

    /// The engine's timezone
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    fn require_site(&self, site_id: &str) -> Result<()> {
        if self.config.sites.iter().any(|s| s.resource_id == site_id) {
            Ok(())
        } else {
            Err(HeliographError::validation(
                "site",
                &format!("unknown site {}", site_id),
            ))
        }
    }
}

/// Start of the local day `offset` days from `now`, as a UTC instant
fn local_day_start(now: DateTime<Utc>, tz: Tz, offset: i64) -> DateTime<Utc> {
    use chrono::TimeZone as _;
    let local_date = now.with_timezone(&tz).date_naive() + Duration::days(offset);
    match local_date
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
    {
        Some(local_midnight) => local_midnight.with_timezone(&Utc),
        None => crate::store::utc_day_start(now) + Duration::days(offset),
    }
}

//! The authoritative forecast interval cache
//!
//! Holds up to two years of half-hourly forecast data per site, dampened at
//! merge time, plus a short undampened shadow answering "what would the
//! forecast have been without dampening". Merge is copy-on-write per site
//! and every successful merge is followed by pruning and an atomic persist,
//! so readers only ever observe a complete pre- or post-merge state.

use crate::dampening::DampeningTable;
use crate::error::{HeliographError, Result};
use crate::logging::get_logger;
use crate::persist;
use crate::solcast::RawInterval;
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Cache file format version; unknown versions fail closed on load
const CACHE_VERSION: u32 = 1;

/// Forecast history retention in days
const RETAIN_PAST_DAYS: i64 = 730;

/// Undampened shadow retention in days
const SHADOW_PAST_DAYS: i64 = 14;

/// The service never forecasts further ahead than this many days
const HORIZON_DAYS: i64 = 8;

/// Which percentile band a query reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateField {
    /// Central (50th percentile) estimate
    Estimate,
    /// Pessimistic (10th percentile, more cloud) estimate
    Estimate10,
    /// Optimistic (90th percentile, less cloud) estimate
    Estimate90,
}

/// One half-hour forecast sample, kW, stored post-dampening
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForecastInterval {
    /// UTC start of the half-hour period
    pub period_start: DateTime<Utc>,
    pub pv_estimate: f64,
    pub pv_estimate10: f64,
    pub pv_estimate90: f64,
}

impl ForecastInterval {
    /// Read one estimate band
    pub fn value(&self, field: EstimateField) -> f64 {
        match field {
            EstimateField::Estimate => self.pv_estimate,
            EstimateField::Estimate10 => self.pv_estimate10,
            EstimateField::Estimate90 => self.pv_estimate90,
        }
    }
}

/// On-disk shape of the forecast and shadow caches
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheFile {
    version: u32,
    last_updated: Option<DateTime<Utc>>,
    sites: BTreeMap<String, Vec<ForecastInterval>>,
}

/// Summary of one merge, for logging and spline-rebuild decisions
#[derive(Debug, Clone, Copy)]
pub struct MergeOutcome {
    /// Records inserted or replaced
    pub merged: usize,
    /// Records dropped by the 730-day prune
    pub pruned: usize,
}

type SiteSeries = BTreeMap<DateTime<Utc>, ForecastInterval>;

/// Time-indexed forecast cache for all sites
pub struct ForecastStore {
    cache_path: PathBuf,
    shadow_path: PathBuf,
    sites: BTreeMap<String, SiteSeries>,
    shadow: BTreeMap<String, SiteSeries>,
    excluded: BTreeSet<String>,
    last_updated: Option<DateTime<Utc>>,
    logger: crate::logging::StructuredLogger,
}

impl ForecastStore {
    /// Load both caches from disk; missing files start empty.
    ///
    /// `excluded` lists sites left out of cross-site totals. A cache file
    /// with an unknown version or malformed records is an error; callers
    /// decide whether to start over.
    pub fn load(
        cache_path: PathBuf,
        shadow_path: PathBuf,
        excluded: BTreeSet<String>,
    ) -> Result<Self> {
        let logger = get_logger("store");

        let (sites, last_updated) = match persist::load_json::<CacheFile, _>(&cache_path)? {
            Some(file) => {
                if file.version != CACHE_VERSION {
                    return Err(HeliographError::validation(
                        "cache",
                        &format!("unsupported forecast cache version {}", file.version),
                    ));
                }
                logger.info("Loaded forecast cache");
                (index_sites(file.sites), file.last_updated)
            }
            None => (BTreeMap::new(), None),
        };

        let shadow = match persist::load_json::<CacheFile, _>(&shadow_path)? {
            Some(file) if file.version == CACHE_VERSION => index_sites(file.sites),
            Some(_) => {
                return Err(HeliographError::validation(
                    "cache",
                    "unsupported shadow cache version",
                ));
            }
            None => BTreeMap::new(),
        };

        Ok(Self {
            cache_path,
            shadow_path,
            sites,
            shadow,
            excluded,
            last_updated,
            logger,
        })
    }

    /// An empty store rooted at the given paths, used when a persisted
    /// cache fails closed and data must be rebuilt from the service
    pub fn empty(cache_path: PathBuf, shadow_path: PathBuf, excluded: BTreeSet<String>) -> Self {
        Self {
            cache_path,
            shadow_path,
            sites: BTreeMap::new(),
            shadow: BTreeMap::new(),
            excluded,
            last_updated: None,
            logger: get_logger("store"),
        }
    }

    /// Whether any forecast data is cached at all
    pub fn has_data(&self) -> bool {
        self.sites.values().any(|s| !s.is_empty())
    }

    /// Timestamp of the last completed refresh cycle
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Whether cached data predates the start of the previous UTC day
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.last_updated {
            Some(updated) => {
                let day_start = now
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .map(|t| Utc.from_utc_datetime(&t))
                    .unwrap_or(now);
                updated < day_start - Duration::days(1)
            }
            None => true,
        }
    }

    /// Merge one site's fetched intervals into the cache.
    ///
    /// Dampening is applied here, once; when the applied multiplier is not
    /// 1.0 the raw values are recorded in the undampened shadow. Fetched
    /// records past the 8-day horizon are dropped. After the upsert both
    /// caches are pruned and persisted atomically.
    pub fn merge(
        &mut self,
        site_id: &str,
        fetched: &[RawInterval],
        as_of: DateTime<Utc>,
        table: &DampeningTable,
        tz: Tz,
    ) -> Result<MergeOutcome> {
        let horizon = utc_day_start(as_of) + Duration::days(HORIZON_DAYS);

        // Copy-on-write: build the new series aside, swap it in whole
        let mut series = self.sites.get(site_id).cloned().unwrap_or_default();
        let mut shadow_series = self.shadow.get(site_id).cloned().unwrap_or_default();

        let mut merged = 0usize;
        for raw in fetched {
            if raw.period_start >= horizon {
                continue;
            }
            let factor = table.lookup(site_id, raw.period_start, tz);
            series.insert(
                raw.period_start,
                ForecastInterval {
                    period_start: raw.period_start,
                    pv_estimate: round4(raw.pv_estimate * factor),
                    pv_estimate10: round4(raw.pv_estimate10 * factor),
                    pv_estimate90: round4(raw.pv_estimate90 * factor),
                },
            );
            if (factor - 1.0).abs() > f64::EPSILON {
                shadow_series.insert(
                    raw.period_start,
                    ForecastInterval {
                        period_start: raw.period_start,
                        pv_estimate: raw.pv_estimate,
                        pv_estimate10: raw.pv_estimate10,
                        pv_estimate90: raw.pv_estimate90,
                    },
                );
            }
            merged += 1;
        }

        let oldest = as_of - Duration::days(RETAIN_PAST_DAYS);
        let before = series.len();
        series.retain(|start, _| *start >= oldest);
        let pruned = before - series.len();

        let shadow_oldest = as_of - Duration::days(SHADOW_PAST_DAYS);
        shadow_series.retain(|start, _| *start >= shadow_oldest);

        self.sites.insert(site_id.to_string(), series);
        if shadow_series.is_empty() {
            self.shadow.remove(site_id);
        } else {
            self.shadow.insert(site_id.to_string(), shadow_series);
        }

        self.persist()?;

        self.logger.debug(&format!(
            "Merged {} records for site {} ({} pruned)",
            merged, site_id, pruned
        ));
        Ok(MergeOutcome { merged, pruned })
    }

    /// Stamp a completed refresh cycle and persist the stamp
    pub fn mark_updated(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.last_updated = Some(now);
        self.persist()
    }

    /// Query intervals with `start <= period_start < end`, ascending.
    ///
    /// `site` of `None` sums across all non-excluded sites per period.
    /// `undampened` overlays the shadow cache over the dampened values.
    /// An empty result is valid.
    pub fn query(
        &self,
        site: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        undampened: bool,
    ) -> Vec<ForecastInterval> {
        match site {
            Some(site_id) => {
                let Some(series) = self.sites.get(site_id) else {
                    return Vec::new();
                };
                series
                    .range(start..end)
                    .map(|(_, interval)| {
                        if undampened {
                            self.undampened_value(site_id, interval)
                        } else {
                            interval.clone()
                        }
                    })
                    .collect()
            }
            None => {
                let mut combined: BTreeMap<DateTime<Utc>, ForecastInterval> = BTreeMap::new();
                for (site_id, series) in &self.sites {
                    if self.excluded.contains(site_id) {
                        continue;
                    }
                    for (period_start, interval) in series.range(start..end) {
                        let value = if undampened {
                            self.undampened_value(site_id, interval)
                        } else {
                            interval.clone()
                        };
                        combined
                            .entry(*period_start)
                            .and_modify(|acc| {
                                acc.pv_estimate = round4(acc.pv_estimate + value.pv_estimate);
                                acc.pv_estimate10 = round4(acc.pv_estimate10 + value.pv_estimate10);
                                acc.pv_estimate90 = round4(acc.pv_estimate90 + value.pv_estimate90);
                            })
                            .or_insert(value);
                    }
                }
                combined.into_values().collect()
            }
        }
    }

    /// The 48 half-hour samples of one field for the day starting at
    /// `day_start` (UTC). Missing periods read as zero.
    pub fn day_samples(
        &self,
        site: Option<&str>,
        day_start: DateTime<Utc>,
        field: EstimateField,
    ) -> Vec<f64> {
        let intervals = self.query(site, day_start, day_start + Duration::days(1), false);
        let mut samples = vec![0.0; 48];
        for interval in intervals {
            let offset = (interval.period_start - day_start).num_minutes();
            if (0..1440).contains(&offset) {
                samples[(offset / 30) as usize] = interval.value(field);
            }
        }
        samples
    }

    /// Log, per future day, whether all 48 half-hour records are present
    pub fn check_data_records(&self, as_of: DateTime<Utc>) {
        let day_start = utc_day_start(as_of);
        for day in 0..HORIZON_DAYS {
            let start = day_start + Duration::days(day);
            let count = self.query(None, start, start + Duration::days(1), false).len();
            if count == 48 {
                self.logger.debug(&format!(
                    "Data for {} contains all 48 records",
                    start.format("%Y-%m-%d")
                ));
            } else {
                self.logger.debug(&format!(
                    "Data for {} contains only {} of 48 records",
                    start.format("%Y-%m-%d"),
                    count
                ));
            }
        }
    }

    /// Delete all cached data, in memory and on disk
    pub fn clear(&mut self) -> Result<()> {
        self.sites.clear();
        self.shadow.clear();
        self.last_updated = None;
        persist::remove_if_exists(&self.cache_path)?;
        persist::remove_if_exists(&self.shadow_path)?;
        self.logger.info("Forecast caches deleted");
        Ok(())
    }

    /// Total number of cached records across all sites
    pub fn record_count(&self) -> usize {
        self.sites.values().map(BTreeMap::len).sum()
    }

    fn undampened_value(&self, site_id: &str, interval: &ForecastInterval) -> ForecastInterval {
        self.shadow
            .get(site_id)
            .and_then(|s| s.get(&interval.period_start))
            .cloned()
            .unwrap_or_else(|| interval.clone())
    }

    fn persist(&self) -> Result<()> {
        let cache = CacheFile {
            version: CACHE_VERSION,
            last_updated: self.last_updated,
            sites: flatten_sites(&self.sites),
        };
        persist::save_json_atomic(&self.cache_path, &cache)?;

        let shadow = CacheFile {
            version: CACHE_VERSION,
            last_updated: self.last_updated,
            sites: flatten_sites(&self.shadow),
        };
        persist::save_json_atomic(&self.shadow_path, &shadow)
    }
}

/// Start of the UTC day containing `at`
pub fn utc_day_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| Utc.from_utc_datetime(&t))
        .unwrap_or(at)
}

fn index_sites(sites: BTreeMap<String, Vec<ForecastInterval>>) -> BTreeMap<String, SiteSeries> {
    sites
        .into_iter()
        .map(|(site_id, intervals)| {
            let series = intervals
                .into_iter()
                .map(|i| (i.period_start, i))
                .collect::<SiteSeries>();
            (site_id, series)
        })
        .collect()
}

fn flatten_sites(sites: &BTreeMap<String, SiteSeries>) -> BTreeMap<String, Vec<ForecastInterval>> {
    sites
        .iter()
        .map(|(site_id, series)| (site_id.clone(), series.values().cloned().collect()))
        .collect()
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

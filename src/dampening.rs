//! Per-period forecast dampening
//!
//! Dampening attenuates forecast values to compensate for local shading or
//! systematic overstatement. Factors are keyed by scope ("all" sites or one
//! site) and period of the local day, at hourly (24) or half-hourly (48)
//! resolution. The two resolutions are mutually exclusive across the whole
//! scope set. Factors are applied exactly once, when fetched data is merged;
//! cached history is never re-dampened.

use crate::error::{HeliographError, Result};
use crate::logging::get_logger;
use crate::persist;
use chrono::{DateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Scope key for the uniform, all-sites factor set
pub const ALL_SCOPE: &str = "all";

/// Result of a dampening retrieval, with the precedence note from the
/// service contract: an "all" scope overrides individual display.
#[derive(Debug, Clone, PartialEq)]
pub struct DampeningView {
    /// Scope the factors came from
    pub scope: String,
    /// 24 or 48 factors
    pub factors: Vec<f64>,
    /// True when "all" factors were returned for a specific-site request
    pub all_precedence: bool,
}

/// Scope → factor table, persisted as a JSON map
pub struct DampeningTable {
    file_path: PathBuf,
    factors: BTreeMap<String, Vec<f64>>,
    logger: crate::logging::StructuredLogger,
}

impl DampeningTable {
    /// Load the table from disk, or start empty
    pub fn load(file_path: PathBuf) -> Self {
        let logger = get_logger("dampening");
        let factors: BTreeMap<String, Vec<f64>> = match persist::load_json(&file_path) {
            Ok(Some(map)) => {
                logger.info("Site dampening loaded");
                map
            }
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                logger.warn(&format!("Discarding unreadable dampening file: {}", e));
                BTreeMap::new()
            }
        };
        Self {
            file_path,
            factors,
            logger,
        }
    }

    /// Whether any dampening is configured at all
    pub fn is_active(&self) -> bool {
        !self.factors.is_empty()
    }

    /// Multiplier for a site at a period, resolved against local time.
    ///
    /// A specific-site entry wins over "all"; absence means 1.0.
    pub fn lookup(&self, site_id: &str, period_start: DateTime<Utc>, tz: Tz) -> f64 {
        let entry = self
            .factors
            .get(site_id)
            .or_else(|| self.factors.get(ALL_SCOPE));
        match entry {
            Some(factors) => {
                let local = tz.from_utc_datetime(&period_start.naive_utc());
                let idx = period_index(local.hour(), local.minute(), factors.len());
                factors.get(idx).copied().unwrap_or(1.0)
            }
            None => 1.0,
        }
    }

    /// Install factors for a scope.
    ///
    /// `scope` of `None` targets "all". Shape and range are validated before
    /// anything changes. A 24-value "all" set removes any granular per-site
    /// configuration, reverting to uniform dampening.
    pub fn set(&mut self, scope: Option<&str>, factors: &[f64]) -> Result<()> {
        if factors.len() != 24 && factors.len() != 48 {
            return Err(HeliographError::validation(
                "damp_factors",
                &format!("expected 24 or 48 values, got {}", factors.len()),
            ));
        }
        if factors.iter().any(|f| !(0.0..=1.0).contains(f)) {
            return Err(HeliographError::validation(
                "damp_factors",
                "every factor must be between 0.0 and 1.0",
            ));
        }

        let scope_key = scope.unwrap_or(ALL_SCOPE);
        if scope_key == ALL_SCOPE && factors.len() == 24 {
            if self.factors.keys().any(|k| k != ALL_SCOPE) {
                self.logger.debug("Clearing granular dampening");
            }
            self.factors.clear();
        } else {
            // Hourly and half-hourly factor sets cannot coexist
            if let Some(existing_len) = self
                .factors
                .iter()
                .filter(|(k, _)| k.as_str() != scope_key)
                .map(|(_, v)| v.len())
                .next()
            {
                if existing_len != factors.len() {
                    return Err(HeliographError::validation(
                        "damp_factors",
                        "hourly and half-hourly dampening cannot be mixed",
                    ));
                }
            }
        }

        self.factors.insert(scope_key.to_string(), factors.to_vec());
        self.save()
    }

    /// Retrieve factors for display.
    ///
    /// Per the service contract this precedence is inverted from `lookup`:
    /// when an "all" scope exists alongside a requested specific site, the
    /// "all" factors are returned and the override is flagged.
    pub fn get(&self, site: Option<&str>) -> DampeningView {
        match site {
            Some(site_id) => {
                if let Some(all) = self.factors.get(ALL_SCOPE) {
                    DampeningView {
                        scope: ALL_SCOPE.to_string(),
                        factors: all.clone(),
                        all_precedence: true,
                    }
                } else if let Some(own) = self.factors.get(site_id) {
                    DampeningView {
                        scope: site_id.to_string(),
                        factors: own.clone(),
                        all_precedence: false,
                    }
                } else {
                    DampeningView {
                        scope: site_id.to_string(),
                        factors: vec![1.0; 24],
                        all_precedence: false,
                    }
                }
            }
            None => match self.factors.get(ALL_SCOPE) {
                Some(all) => DampeningView {
                    scope: ALL_SCOPE.to_string(),
                    factors: all.clone(),
                    all_precedence: false,
                },
                None => DampeningView {
                    scope: ALL_SCOPE.to_string(),
                    factors: vec![1.0; 24],
                    all_precedence: false,
                },
            },
        }
    }

    fn save(&self) -> Result<()> {
        persist::save_json_atomic(&self.file_path, &self.factors)
    }
}

/// Map a local wall-clock time to a factor index for the given resolution
fn period_index(hour: u32, minute: u32, len: usize) -> usize {
    if len == 48 {
        (hour * 2 + u32::from(minute >= 30)) as usize
    } else {
        hour as usize
    }
}

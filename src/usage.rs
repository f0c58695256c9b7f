//! Per-credential API usage tracking
//!
//! The remote service caps calls per credential per UTC day. This module
//! tracks consumption against that cap, persists it across restarts, and
//! resets it once per UTC day boundary.

use crate::error::Result;
use crate::logging::get_logger;
use crate::persist;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Usage state for one credential
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageRecord {
    /// Calls consumed since the last reset
    pub used_count: u32,

    /// Daily call allowance
    pub daily_limit: u32,

    /// UTC date of the last counter reset
    pub last_reset: NaiveDate,
}

/// Tracks daily API usage per credential, persisted to a JSON cache
pub struct UsageTracker {
    file_path: PathBuf,
    records: BTreeMap<String, UsageRecord>,
    logger: crate::logging::StructuredLogger,
}

impl UsageTracker {
    /// Create a tracker for the given credentials, restoring any persisted
    /// counters.
    ///
    /// `credentials` pairs each API key with its daily limit. Persisted
    /// counters for unknown credentials are dropped; limits always follow
    /// configuration, not the cache.
    pub fn load(file_path: PathBuf, credentials: &[(String, u32)], now: DateTime<Utc>) -> Self {
        let logger = get_logger("usage");
        let saved: BTreeMap<String, UsageRecord> = match persist::load_json(&file_path) {
            Ok(Some(records)) => {
                logger.info("Loaded API usage cache");
                records
            }
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                logger.warn(&format!("Discarding unreadable usage cache: {}", e));
                BTreeMap::new()
            }
        };

        let mut records = BTreeMap::new();
        for (api_key, daily_limit) in credentials {
            let record = saved
                .get(api_key)
                .cloned()
                .map(|mut r| {
                    r.daily_limit = *daily_limit;
                    r
                })
                .unwrap_or(UsageRecord {
                    used_count: 0,
                    daily_limit: *daily_limit,
                    last_reset: now.date_naive(),
                });
            records.insert(api_key.clone(), record);
        }

        let mut tracker = Self {
            file_path,
            records,
            logger,
        };
        if let Err(e) = tracker.maybe_reset(now) {
            tracker
                .logger
                .warn(&format!("Could not persist usage reset at load: {}", e));
        }
        tracker
    }

    /// Record one successful API call against a credential.
    ///
    /// An unknown credential is logged and ignored. The counter is persisted
    /// after every increment so a crash loses at most the in-flight credit.
    pub fn record_success(&mut self, api_key: &str) {
        match self.records.get_mut(api_key) {
            Some(record) => {
                record.used_count += 1;
                self.logger.debug(&format!(
                    "API counter for {} is {}/{}",
                    redact_api_key(api_key),
                    record.used_count,
                    record.daily_limit
                ));
                if let Err(e) = self.save() {
                    self.logger
                        .warn(&format!("Could not persist usage increment: {}", e));
                }
            }
            None => {
                self.logger.warn(&format!(
                    "Ignoring usage for unknown credential {}",
                    redact_api_key(api_key)
                ));
            }
        }
    }

    /// Whether a credential still has scheduled-fetch quota today
    pub fn has_quota(&self, api_key: &str) -> bool {
        self.records
            .get(api_key)
            .map(|r| r.used_count < r.daily_limit)
            .unwrap_or(false)
    }

    /// Mark a credential's quota as fully spent (the service said so)
    pub fn mark_exhausted(&mut self, api_key: &str) {
        if let Some(record) = self.records.get_mut(api_key) {
            record.used_count = record.daily_limit;
            if let Err(e) = self.save() {
                self.logger
                    .warn(&format!("Could not persist exhausted quota: {}", e));
            }
        }
    }

    /// Reset counters whose last reset predates `now`'s UTC date.
    ///
    /// Idempotent; called at load and at the start of every refresh cycle.
    pub fn maybe_reset(&mut self, now: DateTime<Utc>) -> Result<()> {
        let today = now.date_naive();
        let mut reset_any = false;
        for (api_key, record) in &mut self.records {
            if record.last_reset < today {
                self.logger.info(&format!(
                    "Resetting API usage counter for {}",
                    redact_api_key(api_key)
                ));
                record.used_count = 0;
                record.last_reset = today;
                reset_any = true;
            }
        }
        if reset_any {
            self.save()?;
        }
        Ok(())
    }

    /// Current usage per credential, keys redacted for display
    pub fn usage(&self) -> Vec<(String, UsageRecord)> {
        self.records
            .iter()
            .map(|(k, v)| (redact_api_key(k), v.clone()))
            .collect()
    }

    /// Zero all counters and delete the persisted cache
    pub fn clear(&mut self, now: DateTime<Utc>) -> Result<()> {
        for record in self.records.values_mut() {
            record.used_count = 0;
            record.last_reset = now.date_naive();
        }
        persist::remove_if_exists(&self.file_path)
    }

    fn save(&self) -> Result<()> {
        persist::save_json_atomic(&self.file_path, &self.records)
    }
}

/// Shorten a credential for log output, keeping only the last six characters
pub fn redact_api_key(api_key: &str) -> String {
    if api_key.len() > 6 {
        format!("******{}", &api_key[api_key.len() - 6..])
    } else {
        "******".to_string()
    }
}

//! Wire types for the Solcast rooftop API
//!
//! The service reports each half-hour record by its `period_end`; the engine
//! keys everything by `period_start`. Normalization happens here, at the
//! deserialization boundary, and rejects records that are not aligned to a
//! half-hour boundary.

use crate::error::{HeliographError, Result};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Deserialize;

/// Response body of `/rooftop_sites/{id}/forecasts`
#[derive(Debug, Clone, Deserialize)]
pub struct ForecastResponse {
    pub forecasts: Vec<WireRecord>,
}

/// Response body of `/rooftop_sites/{id}/estimated_actuals`
#[derive(Debug, Clone, Deserialize)]
pub struct EstimatedActualsResponse {
    pub estimated_actuals: Vec<WireActual>,
}

/// One forecast record as the service reports it
#[derive(Debug, Clone, Deserialize)]
pub struct WireRecord {
    pub period_end: DateTime<Utc>,
    pub pv_estimate: f64,
    #[serde(default)]
    pub pv_estimate10: f64,
    #[serde(default)]
    pub pv_estimate90: f64,
}

/// One estimated-actual record; only the central estimate is reported
#[derive(Debug, Clone, Deserialize)]
pub struct WireActual {
    pub period_end: DateTime<Utc>,
    pub pv_estimate: f64,
}

/// Error body the service attaches to some 429 responses
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub response_status: Option<ResponseStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseStatus {
    pub error_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A normalized half-hour forecast sample, keyed by period start, kW
#[derive(Debug, Clone, PartialEq)]
pub struct RawInterval {
    pub period_start: DateTime<Utc>,
    pub pv_estimate: f64,
    pub pv_estimate10: f64,
    pub pv_estimate90: f64,
}

/// Convert a reported `period_end` to the period's start.
///
/// Seconds and sub-seconds are dropped before shifting back half an hour;
/// a start that does not land on a 0- or 30-minute boundary is rejected.
pub fn normalize_period_end(period_end: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let trimmed = period_end
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(period_end);
    let start = trimmed - Duration::minutes(30);
    if start.minute() != 0 && start.minute() != 30 {
        return Err(HeliographError::validation(
            "period_start",
            &format!("minute is not 0 or 30: {}", start.minute()),
        ));
    }
    Ok(start)
}

impl WireRecord {
    /// Normalize to a period-start keyed sample
    pub fn into_interval(self) -> Result<RawInterval> {
        Ok(RawInterval {
            period_start: normalize_period_end(self.period_end)?,
            pv_estimate: self.pv_estimate,
            pv_estimate10: self.pv_estimate10,
            pv_estimate90: self.pv_estimate90,
        })
    }
}

impl WireActual {
    /// Normalize to a period-start keyed sample; 10/90 bands are not reported
    pub fn into_interval(self) -> Result<RawInterval> {
        Ok(RawInterval {
            period_start: normalize_period_end(self.period_end)?,
            pv_estimate: self.pv_estimate,
            pv_estimate10: 0.0,
            pv_estimate90: 0.0,
        })
    }
}

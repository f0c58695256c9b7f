//! Retrying HTTP client for the Solcast rooftop API
//!
//! One call fetches one site. Retries ensure the site is actually fetched:
//! the service is occasionally busy and answers 429 as a request to come
//! back later, which is honoured with a growing cooldown. A 429 can also
//! mean the daily quota is spent, which is detected from the response body
//! and surfaced immediately rather than retried.

use crate::config::{ApiConfig, RefreshConfig, SiteConfig};
use crate::error::{HeliographError, Result};
use crate::logging::get_logger;
use crate::solcast::types::{
    ErrorResponse, EstimatedActualsResponse, ForecastResponse, RawInterval,
};
use crate::usage::redact_api_key;
use async_trait::async_trait;
use std::time::Duration;

/// Classification of a single fetch attempt's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchClass {
    /// Success, parse the body
    Ok,
    /// Service is busy, cool down and retry
    Busy,
    /// Credential rejected, fatal
    Auth,
    /// Transient failure, back off and retry
    Transient,
    /// Unexpected client-side status, fatal for the call
    Fatal,
}

/// Classify an HTTP status for the retry loop
pub fn classify_status(status: u16) -> FetchClass {
    match status {
        200 => FetchClass::Ok,
        429 => FetchClass::Busy,
        401 | 403 => FetchClass::Auth,
        500..=599 => FetchClass::Transient,
        _ => FetchClass::Fatal,
    }
}

/// Seam for driving the refresh coordinator without a network
#[async_trait]
pub trait ForecastFetcher: Send + Sync {
    /// Fetch up to `hours` of half-hourly forecasts for one site
    async fn fetch_forecasts(&self, site: &SiteConfig, hours: u32) -> Result<Vec<RawInterval>>;

    /// Fetch the past week of estimated actuals for one site
    async fn fetch_estimated_actuals(&self, site: &SiteConfig) -> Result<Vec<RawInterval>>;
}

/// Solcast API client with per-attempt failure classification
pub struct SolcastClient {
    host: String,
    http: reqwest::Client,
    attempts: u32,
    busy_cooldown_secs: u64,
    transient_backoff_secs: u64,
    logger: crate::logging::StructuredLogger,
}

impl SolcastClient {
    /// Create a new client from configuration
    pub fn new(api: &ApiConfig, refresh: &RefreshConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(api.request_timeout_secs))
            .build()?;
        Ok(Self {
            host: api.host.trim_end_matches('/').to_string(),
            http,
            attempts: refresh.attempts,
            busy_cooldown_secs: refresh.busy_cooldown_secs,
            transient_backoff_secs: refresh.transient_backoff_secs,
            logger: get_logger("solcast"),
        })
    }

    /// Issue one GET with the retry/backoff policy applied.
    ///
    /// Returns the response body on eventual success. Never touches the
    /// usage counter; accounting happens in the coordinator on success.
    async fn get_with_retries(&self, url: &str, site: &SiteConfig, hours: u32) -> Result<String> {
        let mut last_failure = String::new();

        for attempt in 1..=self.attempts {
            self.logger.debug(&format!(
                "Fetching {} (attempt {}/{})",
                url, attempt, self.attempts
            ));

            match self.attempt_get(url, site, hours).await {
                Ok(body) => return Ok(body),
                Err(HeliographError::RateLimited { cooldown_secs }) => {
                    // The busy cooldown scales with the attempt count
                    let delay = cooldown_secs * u64::from(attempt);
                    last_failure = "status 429".to_string();
                    self.logger.warn(&format!(
                        "The API is busy, pausing {} seconds before retry",
                        delay
                    ));
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                Err(e) if e.is_retryable() => {
                    last_failure = e.to_string();
                    self.logger.warn(&format!("Fetch attempt failed: {}", e));
                    self.backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        self.logger.error(&format!(
            "API was tried {} times, but all attempts failed",
            self.attempts
        ));
        Err(HeliographError::api(format!(
            "All {} fetch attempts failed for site {} (last: {})",
            self.attempts, site.resource_id, last_failure
        )))
    }

    /// One classified fetch attempt
    async fn attempt_get(&self, url: &str, site: &SiteConfig, hours: u32) -> Result<String> {
        let hours_param = hours.to_string();
        let response = self
            .http
            .get(url)
            .query(&[
                ("format", "json"),
                ("api_key", site.api_key.as_str()),
                ("hours", hours_param.as_str()),
            ])
            .send()
            .await?;

        let status = response.status().as_u16();
        match classify_status(status) {
            FetchClass::Ok => Ok(response.text().await?),
            FetchClass::Busy => {
                let body = response.text().await.unwrap_or_default();
                if quota_spent(&body) {
                    self.logger.error(&format!(
                        "API allowed polling limit has been exceeded for {}",
                        redact_api_key(&site.api_key)
                    ));
                    return Err(HeliographError::quota_exhausted(redact_api_key(
                        &site.api_key,
                    )));
                }
                Err(HeliographError::rate_limited(self.busy_cooldown_secs))
            }
            FetchClass::Auth => Err(HeliographError::auth(format!(
                "API rejected credential {} with status {}",
                redact_api_key(&site.api_key),
                status
            ))),
            FetchClass::Transient => Err(HeliographError::network(format!(
                "API returned status {}",
                status
            ))),
            FetchClass::Fatal => Err(HeliographError::api(format!(
                "API returned status {} for site {}",
                status, site.resource_id
            ))),
        }
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.transient_backoff_secs * u64::from(attempt);
        tokio::time::sleep(Duration::from_secs(delay)).await;
    }

    fn parse_forecasts(&self, body: &str) -> Result<Vec<RawInterval>> {
        let parsed: ForecastResponse = serde_json::from_str(body)?;
        parsed
            .forecasts
            .into_iter()
            .map(|r| r.into_interval())
            .collect()
    }

    fn parse_actuals(&self, body: &str) -> Result<Vec<RawInterval>> {
        let parsed: EstimatedActualsResponse = serde_json::from_str(body)?;
        parsed
            .estimated_actuals
            .into_iter()
            .map(|r| r.into_interval())
            .collect()
    }
}

/// Whether a 429 body reports the daily quota as spent rather than mere load
fn quota_spent(body: &str) -> bool {
    serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|e| e.response_status)
        .and_then(|s| s.error_code)
        .map(|c| c == "TooManyRequests")
        .unwrap_or(false)
}

#[async_trait]
impl ForecastFetcher for SolcastClient {
    async fn fetch_forecasts(&self, site: &SiteConfig, hours: u32) -> Result<Vec<RawInterval>> {
        let url = format!("{}/rooftop_sites/{}/forecasts", self.host, site.resource_id);
        // A well-formed 200 with a garbled body is retried like any other
        // transient failure, within the shared attempt budget.
        let mut parse_failures = 0u32;
        loop {
            let body = self.get_with_retries(&url, site, hours).await?;
            match self.parse_forecasts(&body) {
                Ok(intervals) => {
                    self.logger
                        .debug(&format!("{} records returned", intervals.len()));
                    return Ok(intervals);
                }
                Err(e) => {
                    parse_failures += 1;
                    self.logger
                        .warn(&format!("Malformed forecast response: {}", e));
                    if parse_failures >= self.attempts {
                        return Err(HeliographError::api(format!(
                            "Repeatedly malformed forecast response for site {}",
                            site.resource_id
                        )));
                    }
                    self.backoff(parse_failures).await;
                }
            }
        }
    }

    async fn fetch_estimated_actuals(&self, site: &SiteConfig) -> Result<Vec<RawInterval>> {
        let url = format!(
            "{}/rooftop_sites/{}/estimated_actuals",
            self.host, site.resource_id
        );
        let body = self.get_with_retries(&url, site, 168).await?;
        self.parse_actuals(&body)
    }
}

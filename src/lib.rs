//! # Heliograph - Solcast Solar Forecast Data Engine
//!
//! A Rust implementation of a solar forecast data engine: it ingests
//! rooftop generation forecasts from the rate-limited Solcast API,
//! persists them as a durable local time series, and serves derived
//! values (totals, peaks, near-term power) to a presentation layer.
//!
//! ## Features
//!
//! - **Quota-aware fetching**: per-credential daily call allowances,
//!   tracked and reset on the UTC day boundary
//! - **Retrying client**: busy/transient/auth failure classification with
//!   backoff, never wiping cached data on failure
//! - **Durable cache**: up to two years of half-hourly data per site,
//!   merged copy-on-write and persisted atomically
//! - **Dampening**: per-period attenuation at hourly or half-hourly
//!   resolution, per site or for all sites, applied once at merge time
//! - **Monotone splines**: PCHIP interpolation turning half-hour samples
//!   into continuous "power right now" estimates
//! - **Aggregation**: daily totals, peaks, hour-aligned and continuous
//!   near-term energy, with an optional serve-side hard limit
//!
//! ## Architecture
//!
//! The engine follows a modular architecture with clear separation of
//! concerns:
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `error`: Error taxonomy shared across the engine
//! - `persist`: Atomic JSON cache files
//! - `usage`: Per-credential daily API quota tracking
//! - `solcast`: Solcast API client and wire types
//! - `dampening`: Per-period forecast attenuation
//! - `store`: The authoritative forecast interval cache
//! - `spline`: Monotone interpolation over half-hourly samples
//! - `aggregate`: Read-only derived views
//! - `coordinator`: Refresh orchestration and the engine surface

pub mod aggregate;
pub mod config;
pub mod coordinator;
pub mod dampening;
pub mod error;
pub mod logging;
pub mod persist;
pub mod solcast;
pub mod spline;
pub mod store;
pub mod usage;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{ForecastEngine, RefreshOutcome};
pub use error::{HeliographError, Result};
pub use store::{EstimateField, ForecastInterval};

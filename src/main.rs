use anyhow::Result;
use heliograph::coordinator::ForecastEngine;
use heliograph::solcast::SolcastClient;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The daemon is the engine's external scheduling collaborator: it owns
/// the timers (refresh interval, local-midnight spline reseed) and calls
/// into the engine, which itself holds none.
#[tokio::main]
async fn main() -> Result<()> {
    let config = heliograph::Config::load()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    heliograph::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Heliograph forecast engine starting up");

    let client = Arc::new(
        SolcastClient::new(&config.api, &config.refresh)
            .map_err(|e| anyhow::anyhow!("Failed to create API client: {}", e))?,
    );
    let engine = Arc::new(
        ForecastEngine::new(config, client)
            .map_err(|e| anyhow::anyhow!("Failed to create engine: {}", e))?,
    );

    if !engine.auto_update() {
        info!("Automatic updates disabled; waiting for external refresh commands");
    }

    let mut refresh_timer = tokio::time::interval(engine.refresh_interval());
    let mut midnight_timer = tokio::time::interval(seconds_until_next_midnight(&engine));

    loop {
        tokio::select! {
            _ = refresh_timer.tick() => {
                if !engine.auto_update() {
                    continue;
                }
                match engine.scheduled_refresh().await {
                    Ok(outcome) => {
                        if !outcome.failed.is_empty() {
                            warn!("Refresh cycle completed with failures: {:?}", outcome.failed);
                        }
                    }
                    Err(e) => warn!("Refresh cycle failed: {}", e),
                }
            }
            _ = midnight_timer.tick() => {
                // Seed the new day's curves before any fetch occurs
                engine.rebuild_splines(chrono::Utc::now()).await;
                midnight_timer = tokio::time::interval(seconds_until_next_midnight(&engine));
                midnight_timer.reset();
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
                engine.shutdown();
                break;
            }
        }
    }

    info!("Heliograph shutdown complete");
    Ok(())
}

/// Duration until the next local midnight, for the spline reseed timer
fn seconds_until_next_midnight(engine: &ForecastEngine) -> std::time::Duration {
    use chrono::{Duration as ChronoDuration, Utc};
    let tz = engine.timezone();
    let now_local = Utc::now().with_timezone(&tz);
    let next_midnight = (now_local.date_naive() + ChronoDuration::days(1))
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| chrono::TimeZone::from_local_datetime(&tz, &naive).earliest());
    match next_midnight {
        Some(at) => {
            let secs = (at.with_timezone(&Utc) - Utc::now()).num_seconds().max(1);
            std::time::Duration::from_secs(secs as u64)
        }
        None => std::time::Duration::from_secs(24 * 3600),
    }
}

use chrono::Local;
use listing_digest::{config::Config, info_time, process::run_digest, request::HttpExtractionService, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,listing_digest=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let start_time = Local::now();
    let config = Config::from_env()?;
    let service = HttpExtractionService::new(config.base_url, config.user_id, config.api_key);

    let report = run_digest(&service, &config.digest).await?;
    info_time!(
        start_time,
        "Full program time: {} of {} listings from {} exported to {}",
        report.rows.len(),
        report.matched,
        report.day,
        report.path.display()
    );

    Ok(())
}

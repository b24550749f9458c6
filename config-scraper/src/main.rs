use config_scraper::config::EngineConfig;
use config_scraper::database;
use config_scraper::logging::init_logging;
use config_scraper::metrics::PrometheusExporter;
use config_scraper::scheduler::Scheduler;
use config_scraper::scrapers::ScraperRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env()?;

    // Initialize logging
    let (logging, _log_guard) = init_logging(config.log_dir.as_deref())?;

    // Initialize database
    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let log_retention = config.log_retention;

    // Scrapers register themselves here by source type.
    let scrapers = ScraperRegistry::new();
    let scheduler = Scheduler::new(config, pool, scrapers);
    logging.start_retention_cleanup(log_retention, scheduler.cancellation_token());

    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    tracing::info!("config-scraper started");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Received shutdown signal");
        }
        result = runner => {
            result??;
        }
    }

    scheduler.shutdown().await;
    tracing::debug!(
        "Final metrics:\n{}",
        PrometheusExporter::new(scheduler.metrics()).export()
    );

    Ok(())
}

//! A command line front-end to the size info service.
//!
//! It consumes the service the way the garment widget does: one lookup per garment, printing
//! the normalized record either as JSON or as plain text tables.

use anyhow::{Context, Result};
use sizeinfo_service::caching::SizeInfoManager;
use sizeinfo_service::{logging, metrics};

use settings::{Action, Settings};

mod output;
mod settings;

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let settings = Settings::get()?;
    let config = &settings.config;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No other threads that could access the environment have been spawned yet.
    unsafe { logging::init_logging(&config.logging) };

    if let Some(statsd) = &config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    runtime.block_on(run(settings))
}

async fn run(settings: Settings) -> Result<()> {
    let manager = SizeInfoManager::from_config(&settings.config)
        .context("failed to create the HTTP client")?;
    let format = settings.output_format;

    match settings.action {
        Action::Lookup { garment, refresh } => {
            let (garment_id, brand) = (&garment.garment_id, &garment.brand);
            let record = if refresh {
                manager.force_refresh(garment_id, brand).await
            } else {
                manager.lookup(garment_id, brand).await
            }
            .with_context(|| format!("failed to fetch size info of {brand}/{garment_id}"))?;

            output::print_record(&record, format)?;
        }
        Action::Preload { garments, status } => {
            let records = manager
                .preload(garments.iter().map(|g| (&g.garment_id, &g.brand)))
                .await;

            let records: Vec<_> = garments.into_iter().zip(records).collect();
            output::print_records(&records, format)?;

            if status {
                output::print_status(&manager.status(), format)?;
            }
        }
    }

    Ok(())
}

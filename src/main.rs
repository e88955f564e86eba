use std::{process, time::Duration};

use canopy::{
    cache::{CacheServices, ManifestSource, WarmOutcome, WarmingStrategy},
    config,
    infra::{error::InfraError, telemetry},
};
use tokio::task::JoinHandle;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Warm(_) => run_warm(settings).await,
    }
}

fn build_services(settings: &config::Settings) -> Result<CacheServices, InfraError> {
    let services = CacheServices::new(&settings.cache)?;

    if let Some(path) = &settings.warm.manifest {
        services.warmer.register(WarmingStrategy::new(
            "manifest",
            settings.warm.manifest_priority,
            settings.warm.manifest_ttl_secs,
            ManifestSource::new(path),
        ));
        info!(path = %path.display(), "Manifest warming strategy registered");
    }

    Ok(services)
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let services = build_services(&settings)?;

    if settings.cache.warm_on_startup {
        report_warm_outcome(&services.warmer.warm_all().await);
    }

    let consume_handle = spawn_auto_consume(&services, settings.cache.auto_consume_interval());
    let warm_handle = spawn_periodic_warm(&services, settings.cache.warm_interval());
    let sweep_handle = spawn_expiry_sweep(&services, settings.cache.sweep_interval());

    info!(
        environment = settings.cache.environment.as_str(),
        "Canopy running; press Ctrl-C to stop"
    );
    let result = tokio::signal::ctrl_c().await.map_err(InfraError::from);

    for handle in [sweep_handle, warm_handle, consume_handle] {
        handle.abort();
        let _ = handle.await;
    }

    // apply invalidations accepted before shutdown
    while services.dispatcher.pending() > 0 {
        if let Err(err) = services.dispatcher.consume().await {
            warn!(error = %err, "Final invalidation consumption failed");
            break;
        }
    }
    services.store.flush_background().await;
    info!("Canopy stopped");

    result
}

async fn run_warm(settings: config::Settings) -> Result<(), InfraError> {
    let services = build_services(&settings)?;
    if services.warmer.strategy_names().is_empty() {
        warn!("No warming strategies registered; pass --manifest or set warm.manifest");
    }

    let outcome = services.warmer.warm_all().await;
    services.store.flush_background().await;
    report_warm_outcome(&outcome);

    let Some(stats) = outcome.stats() else {
        return Ok(());
    };
    println!("{}", serde_json::to_string_pretty(stats)?);

    if stats.is_partial_failure() {
        return Err(InfraError::WarmFailed(stats.failures.len()));
    }
    Ok(())
}

fn spawn_auto_consume(services: &CacheServices, interval: Duration) -> JoinHandle<()> {
    let dispatcher = services.dispatcher.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            if let Err(err) = dispatcher.consume().await {
                warn!(error = %err, "Invalidation consumption failed");
            }
        }
    })
}

fn spawn_periodic_warm(services: &CacheServices, period: Duration) -> JoinHandle<()> {
    let warmer = services.warmer.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            report_warm_outcome(&warmer.warm_all().await);
        }
    })
}

fn spawn_expiry_sweep(services: &CacheServices, period: Duration) -> JoinHandle<()> {
    let store = services.store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            let purged = store.sweep_expired().await;
            if purged > 0 {
                info!(purged, "Expired cache entries swept");
            }
        }
    })
}

fn report_warm_outcome(outcome: &WarmOutcome) {
    match outcome {
        WarmOutcome::AlreadyInProgress => info!("Warming cycle skipped; previous cycle still running"),
        WarmOutcome::Completed(stats) if stats.is_partial_failure() => {
            for failure in &stats.failures {
                warn!(strategy = %failure.strategy, error = %failure.error, "Warming strategy failed");
            }
        }
        WarmOutcome::Completed(_) => {}
    }
}

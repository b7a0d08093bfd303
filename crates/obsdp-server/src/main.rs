//! OBSDP Server - Main entry point

use anyhow::Result;
use mediator::AsyncMediator;
use obsdp_common::logging::{init_logging, LogConfig};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use obsdp_server::{
    config::Config,
    cqrs,
    features::{instances::InstanceStatusQuery, sources::SeedSourcesCommand, FeatureState},
    pipeline::{
        instance::SlotStateStore, pg::PgSlotStateStore, selection::SelectionLayout,
        selection::SourceSelection, Pipeline,
    },
    reports::FsReportStore,
    scheduler::{jobs::register_recurring_jobs, JobRunner, LocalSchedulerGateway, SchedulerGateway},
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("obsdp-server".to_string())
        .filter_directives("obsdp_server=debug,obsdp_common=info,sqlx=warn".to_string())
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    info!("Starting OBSDP Server");

    let config = Config::load()?;
    info!(
        upload_dir = %config.pipeline.upload_dir.display(),
        report_dir = %config.reports.dir.display(),
        sample_guard = ?config.reports.sample_guard,
        "Configuration loaded"
    );

    let mut builder = Pipeline::builder(&config.pipeline.upload_dir)
        .settle_delay(config.archive_settle_delay())
        .sample_guard(config.reports.sample_guard)
        .read_concurrency(config.pipeline.read_concurrency)
        .report_store(Arc::new(FsReportStore::open(&config.reports.dir).await?));

    if let Some(layout) = &config.pipeline.selection_layout {
        builder = builder.layout(SelectionLayout::parse(layout)?);
    }

    if let Some(db) = &config.database {
        let pool = PgPoolOptions::new()
            .max_connections(db.max_connections)
            .acquire_timeout(Duration::from_secs(db.connect_timeout_secs))
            .connect(&db.url)
            .await?;
        info!("Database connection pool established");

        let store = PgSlotStateStore::new(pool);
        store.migrate().await?;
        info!("Database migrations completed");

        let store: Arc<dyn SlotStateStore> = Arc::new(store);
        builder = builder.slot_state(store);
    }

    let pipeline = Arc::new(builder.build().await?);
    info!(
        active_slot = %pipeline.instances().active_slot(),
        sources = pipeline.registry().list_all().len(),
        "Pipeline ready"
    );

    let runner = Arc::new(JobRunner::new(pipeline.clone()));
    let scheduler = Arc::new(LocalSchedulerGateway::new(runner));

    let state = FeatureState {
        pipeline: pipeline.clone(),
        scheduler: scheduler.clone(),
    };
    let mut mediator = cqrs::build_mediator(state);
    info!("Command handlers ready");

    let seeded = mediator.send(SeedSourcesCommand::default()).await??;
    info!(
        inserted = seeded.summary.inserted,
        unchanged = seeded.summary.unchanged,
        registry_version = seeded.registry_version,
        "Sources seeded"
    );

    // Processed and verbatim data live in memory; only slot state survives a restart
    let status = mediator.send(InstanceStatusQuery::default()).await??;
    for slot in status.slots.iter().filter(|s| s.slot == status.active) {
        if slot.last_completed_at.is_some() && slot.records == 0 {
            warn!(
                slot = %slot.slot,
                last_completed_at = ?slot.last_completed_at,
                "Recovered active slot has no records in this process; run a harvest and a clean process run to repopulate it"
            );
        }
    }

    let snapshot = pipeline.registry().snapshot();
    let process_selection = match config.schedule.process_mask {
        Some(mask) => pipeline.decode_selection(mask)?,
        None => SourceSelection::all_active(&snapshot),
    };
    let schedules = config.recurring_schedules(process_selection);
    let registered = register_recurring_jobs(scheduler.as_ref(), &schedules).await?;
    let now = chrono::Utc::now();
    for job in scheduler.recurring().await {
        info!(name = %job.name, next_fire = ?job.next_fire(now), "Recurring job");
    }
    info!(registered, "Recurring jobs registered");

    shutdown_signal().await;

    info!("Waiting for running jobs");
    scheduler.shutdown().await;
    info!("Server shut down gracefully");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}

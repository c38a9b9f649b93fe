use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use maestro::cli::{format_settings, Args};
use maestro::cluster::{ClusterControl, KubectlApi};
use maestro::config::{ConfigBuilder, CredentialCipher};
use maestro::deployment::{DeploymentRepository, DeploymentService, MemoryRepository, PostgresRepository};
use maestro::events::{
    Activity, EventStream, MessageHandler, RedisStream, SinkActivityHandler, SinkLifecycleHandler, StatusProducer,
    StreamConsumer,
};
use maestro::metrics::ServiceMetrics;
use maestro::monitor::Monitor;
use maestro::registry::HttpSinkRegistry;
use maestro::server::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Values from the env file feed clap's env fallbacks, so parse again
    let args = match args.env_file {
        Some(ref env_file) => {
            dotenvy::from_path(env_file)
                .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
            Args::parse()
        }
        None => args,
    };

    let dry_run = args.dry_run;
    let encryption_key = args.encryption_key.clone();
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "maestro".to_string());
    let settings = args.into_settings(&host);

    if dry_run {
        println!("{}", format_settings(&settings));
        return Ok(());
    }

    let encryption_key = encryption_key
        .filter(|k| !k.is_empty())
        .context("An encryption key is required (--encryption-key or MAESTRO_ENCRYPTION_KEY)")?;

    // Storage
    let repo: Arc<dyn DeploymentRepository> = match settings.database_url {
        Some(ref url) => Arc::new(
            PostgresRepository::connect(url, settings.database_max_connections)
                .await
                .context("Failed to connect to Postgres")?,
        ),
        None => {
            warn!("No database URL configured, deployments are kept in memory only");
            Arc::new(MemoryRepository::new())
        }
    };

    let stream: Arc<dyn EventStream> = Arc::new(
        RedisStream::connect(&settings.redis_url, settings.redis_pool_size)
            .await
            .context("Failed to connect to Redis")?,
    );

    // Service
    let metrics = Arc::new(ServiceMetrics::new());
    let cluster = ClusterControl::with_config(
        Arc::new(KubectlApi::new(settings.kubectl.clone())),
        settings.collector.clone(),
        settings.cluster.clone(),
    );
    let service = DeploymentService::new(
        repo,
        cluster,
        StatusProducer::new(stream.clone(), settings.status_stream.clone()),
        ConfigBuilder::new(settings.builder.clone()),
        CredentialCipher::new(&encryption_key),
        metrics.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let mut tasks = Vec::new();

    // Consumers
    let lifecycle: Arc<dyn MessageHandler> = Arc::new(SinkLifecycleHandler::new(service.clone()));
    let active: Arc<dyn MessageHandler> = Arc::new(SinkActivityHandler::new(service.clone(), Activity::Active));
    let idle: Arc<dyn MessageHandler> = Arc::new(SinkActivityHandler::new(service.clone(), Activity::Idle));
    let consumers = [
        (lifecycle, settings.lifecycle.clone()),
        (active, settings.activity.clone()),
        (idle, settings.idle.clone()),
    ];
    for (handler, config) in consumers {
        let consumer = StreamConsumer::new(stream.clone(), handler, config);
        consumer
            .prepare()
            .await
            .with_context(|| format!("Failed to prepare consumer group on {}", consumer.config().stream))?;
        tasks.push(tokio::spawn(consumer.run(shutdown_rx.clone())));
    }

    // Monitor
    let registry = Arc::new(HttpSinkRegistry::new(
        settings.sinks_url.clone(),
        settings.sinks_token.clone(),
    ));
    let monitor = Monitor::new(service.clone(), registry, settings.monitor.clone(), metrics.clone());
    tasks.push(tokio::spawn(monitor.run(shutdown_rx.clone())));

    // Shutdown on Ctrl-C
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    // HTTP surface
    let app = create_router(AppState::new(metrics));
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.bind_addr))?;

    info!("Server listening on {}", settings.bind_addr);
    info!("Endpoints:");
    info!("  GET  /health  - Health check");
    info!("  GET  /metrics - Operation and monitor counters");

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await
        .context("Server error")?;

    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }
    info!("maestro stopped");
    Ok(())
}

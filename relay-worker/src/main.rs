//! Consume event records, gate them on live utilization, call the inference
//! API and persist responses.
use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use relay_common::metrics::{serve, setup_metrics_routes};
use relay_common::store::{PostgresResponseStore, ResponseStore};
use relay_worker::config::Config;
use relay_worker::error::WorkerError;
use relay_worker::inference::{HttpInferenceClient, InferenceClient};
use relay_worker::monitor::{MonitorClient, UtilizationMonitor};
use relay_worker::pipeline::IngestionPipeline;
use relay_worker::source::{EventSource, KafkaSource};

async fn index() -> &'static str {
    "relay-worker"
}

/// Run consume cycles until shutdown is signalled, sleeping between cycles.
/// The sleep doubles as the backoff before a deferred record is polled
/// again. Liveness is reported inside the cycle, per record.
async fn run<S, M, I, R>(
    pipeline: IngestionPipeline<S, M, I, R>,
    poll_interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    S: EventSource,
    M: UtilizationMonitor,
    I: InferenceClient,
    R: ResponseStore,
{
    loop {
        if *shutdown.borrow() {
            info!("shutdown signal received, stopping consumer loop");
            break;
        }

        let processed = pipeline.consume_cycle().await;
        info!("events processed in this cycle: {}", processed);

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {},
            _ = shutdown.changed() => {},
        }
    }

    pipeline.close();
}

async fn shutdown_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;

    // Collaborators are constructed here, before the first record is
    // consumed; missing configuration fails the process, never a record.
    let store = PostgresResponseStore::new(&config.database_url).await?;
    let monitor = MonitorClient::new(
        &config.metrics_endpoint,
        &config.metric_name,
        config.metric_window_secs,
        config.metric_timeout.0,
    )?;
    let inference = HttpInferenceClient::new(
        &config.inference_endpoint,
        &config.inference_deployment,
        &config.inference_api_key,
        &config.inference_api_version,
        config.inference_timeout.0,
    )?;
    let source = KafkaSource::new(&config)?;

    let pipeline = IngestionPipeline::new(
        source,
        monitor,
        inference,
        store,
        worker_liveness,
        config.metric_threshold,
        config.max_records_per_cycle,
        config.cycle_poll_timeout.0,
    );

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = Router::new()
            .route("/", get(index))
            .route(
                "/_liveness",
                get(move || std::future::ready(liveness.get_status())),
            );
        let router = setup_metrics_routes(router);

        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::task::spawn(async move {
        shutdown_signal().await;
        _ = shutdown_tx.send(true);
    });

    info!("consumer initialized, starting event consumption loop");

    run(pipeline, config.poll_interval.0, shutdown_rx).await;

    Ok(())
}

use envconfig::Envconfig;
use tokio::signal;

use relay_api::config::Config;
use relay_api::router;
use relay_api::sink::{KafkaSink, PrintSink};
use relay_common::store::PostgresResponseStore;

async fn shutdown() {
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
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = PostgresResponseStore::new(&config.database_url)
        .await
        .expect("failed to create response store");

    let app = if config.print_sink {
        router::router(PrintSink {}, store, config.export_prometheus)
    } else {
        let sink = KafkaSink::new(
            config.kafka_topic,
            config.kafka_hosts,
            config.kafka_tls,
        )
        .expect("failed to start Kafka sink");

        router::router(sink, store, config.export_prometheus)
    };

    let listener = tokio::net::TcpListener::bind(config.address)
        .await
        .expect("could not bind listener");

    tracing::info!("listening on {}", config.address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await
        .expect("failed to start relay-api http server");
}

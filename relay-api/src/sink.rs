use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use rdkafka::config::{ClientConfig, FromClientConfigAndContext};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::producer::future_producer::{FutureProducer, FutureRecord};
use rdkafka::producer::Producer;
use rdkafka::util::Timeout;
use tokio::task::JoinSet;
use tracing::info;

use relay_common::event::ProcessedEvent;

use crate::api::ApiError;

#[async_trait]
pub trait EventSink {
    async fn send(&self, event: ProcessedEvent) -> Result<(), ApiError>;
    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), ApiError>;
}

#[async_trait]
impl<T: EventSink + Send + Sync> EventSink for std::sync::Arc<T> {
    async fn send(&self, event: ProcessedEvent) -> Result<(), ApiError> {
        self.as_ref().send(event).await
    }

    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), ApiError> {
        self.as_ref().send_batch(events).await
    }
}

/// Sink that logs events instead of producing them, for local runs.
pub struct PrintSink {}

#[async_trait]
impl EventSink for PrintSink {
    async fn send(&self, event: ProcessedEvent) -> Result<(), ApiError> {
        info!("single event: {:?}", event);
        counter!("relay_events_produced_total").increment(1);

        Ok(())
    }

    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), ApiError> {
        counter!("relay_events_produced_total").increment(events.len() as u64);
        for event in events {
            info!("event: {:?}", event);
        }

        Ok(())
    }
}

/// Sink that accumulates events in memory, for tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ProcessedEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProcessedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn send(&self, event: ProcessedEvent) -> Result<(), ApiError> {
        self.events.lock().unwrap().push(event);

        Ok(())
    }

    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), ApiError> {
        self.events.lock().unwrap().extend(events);

        Ok(())
    }
}

struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("relay_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("relay_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("relay_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
    }
}

#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaSink {
    pub fn new(topic: String, brokers: String, tls: bool) -> anyhow::Result<KafkaSink> {
        info!("connecting to Kafka brokers at {}...", brokers);
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &brokers)
            .set("statistics.interval.ms", "10000");

        if tls {
            config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let producer = FutureProducer::from_config_and_context(&config, KafkaContext)?;

        // Ping the cluster to make sure we can reach brokers
        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers");

        Ok(KafkaSink { producer, topic })
    }

    async fn kafka_send(
        producer: FutureProducer<KafkaContext>,
        topic: String,
        event: ProcessedEvent,
    ) -> Result<(), ApiError> {
        let key = event.key();

        match producer.send_result(FutureRecord {
            topic: topic.as_str(),
            payload: Some(&event.data),
            partition: None,
            key: Some(&key),
            timestamp: None,
            headers: None,
        }) {
            Ok(_) => {
                counter!("relay_events_produced_total").increment(1);
                Ok(())
            }
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::InvalidMessageSize) => {
                    counter!("relay_events_dropped_too_big").increment(1);
                    Err(ApiError::EventTooBig)
                }
                _ => {
                    counter!("relay_events_production_failed").increment(1);
                    tracing::error!("failed to produce event: {}", e);
                    Err(ApiError::RetryableSinkError)
                }
            },
        }
    }
}

#[async_trait]
impl EventSink for KafkaSink {
    async fn send(&self, event: ProcessedEvent) -> Result<(), ApiError> {
        Self::kafka_send(self.producer.clone(), self.topic.clone(), event).await
    }

    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), ApiError> {
        let mut set = JoinSet::new();

        for event in events {
            let producer = self.producer.clone();
            let topic = self.topic.clone();

            set.spawn(Self::kafka_send(producer, topic, event));
        }

        // Await on all the produce promises, failing the batch on the first error
        while let Some(join) = set.join_next().await {
            match join {
                Ok(send) => send?,
                Err(e) => {
                    tracing::error!("failed to join produce task: {}", e);
                    return Err(ApiError::RetryableSinkError);
                }
            }
        }

        Ok(())
    }
}

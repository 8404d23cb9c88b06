use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::{ClientConfig, Message, Offset};
use tracing::info;

use crate::config::Config;
use crate::error::SourceError;

/// One delivered record, with enough position information to acknowledge it.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// A partitioned, checkpointed stream of records.
///
/// `recv` yields records in delivery order per partition. Nothing advances a
/// partition's checkpoint except an explicit `commit` for a delivered
/// record, so a crashed or failed unit of work is simply redelivered later.
/// `rewind` seeks a partition back to a record so the next poll delivers it
/// again without waiting for a restart.
#[async_trait]
pub trait EventSource {
    async fn recv(&self) -> Result<SourceRecord, SourceError>;
    fn commit(&self, record: &SourceRecord) -> Result<(), SourceError>;
    fn rewind(&self, record: &SourceRecord) -> Result<(), SourceError>;
    fn close(&self);
}

pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaSource {
    pub fn new(config: &Config) -> Result<Self, SourceError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("group.id", &config.kafka_consumer_group)
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &config.kafka_offset_reset);

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.kafka_topic.as_str()])?;

        info!(
            topic = config.kafka_topic,
            group_id = config.kafka_consumer_group,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            topic: config.kafka_topic.clone(),
        })
    }
}

#[async_trait]
impl EventSource for KafkaSource {
    async fn recv(&self) -> Result<SourceRecord, SourceError> {
        let message = self.consumer.recv().await?;

        Ok(SourceRecord {
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().unwrap_or_default().to_vec(),
        })
    }

    fn commit(&self, record: &SourceRecord) -> Result<(), SourceError> {
        // Committed offset is the next record to read, hence offset + 1
        let mut positions = TopicPartitionList::new();
        positions.add_partition_offset(
            &self.topic,
            record.partition,
            Offset::Offset(record.offset + 1),
        )?;
        self.consumer.commit(&positions, CommitMode::Async)?;

        Ok(())
    }

    fn rewind(&self, record: &SourceRecord) -> Result<(), SourceError> {
        self.consumer.seek(
            &self.topic,
            record.partition,
            Offset::Offset(record.offset),
            Duration::from_secs(5),
        )?;

        Ok(())
    }

    fn close(&self) {
        self.consumer.unsubscribe();
    }
}

use std::collections::HashMap;

use crate::checkpoint::{MirrorCheckpoint, TopicCheckpoint};
use crate::datastream::{ConnectionString, ConnectionStringError, Datastream};
use crate::message::{metadata, Envelope, ProducerRecord};
use crate::source::{Record, Subscription, TimestampKind};

/// Per-variant behaviour of a task: what to subscribe to and how a polled
/// record becomes a producer record.
pub trait Translator: Send {
    fn subscription(&self) -> Subscription;

    fn translate(&self, record: &Record, read_time_ms: i64)
        -> Result<ProducerRecord, TranslateError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("record for {topic}-{partition} violates the envelope contract: {message}")]
    Contract {
        topic: String,
        partition: i32,
        message: String,
    },
}

/// Mirror tasks subscribe to a topic regex and fan records out to the
/// destination topic named by each record's origin topic, via the `%s`
/// placeholder in the destination connection string.
pub struct MirrorTranslator {
    source: ConnectionString,
    destination: ConnectionString,
    identity_partitioning: bool,
}

impl MirrorTranslator {
    pub fn from_datastream(datastream: &Datastream) -> Result<Self, ConnectionStringError> {
        Ok(Self {
            source: datastream.source_connection()?,
            destination: datastream.destination_connection()?,
            identity_partitioning: datastream.identity_partitioning(),
        })
    }
}

impl Translator for MirrorTranslator {
    fn subscription(&self) -> Subscription {
        Subscription::Pattern(self.source.name().to_owned())
    }

    fn translate(
        &self,
        record: &Record,
        read_time_ms: i64,
    ) -> Result<ProducerRecord, TranslateError> {
        let envelope = build_envelope(record, read_time_ms, self.source.to_string());

        let mut builder = ProducerRecord::builder()
            .envelope(envelope)
            .destination(self.destination.for_topic(record.topic()))
            .checkpoint(
                MirrorCheckpoint::new(record.topic(), record.partition(), record.offset())
                    .to_string(),
            )
            .source_timestamp_ms(events_source_timestamp(record, read_time_ms));

        if self.identity_partitioning {
            builder = builder.partition(record.partition());
        }

        builder.build().map_err(|err| TranslateError::Contract {
            topic: record.topic().to_owned(),
            partition: record.partition(),
            message: err.to_string(),
        })
    }
}

/// Single-topic tasks replicate one topic to one destination topic, keeping
/// the source partitioning.
pub struct TopicTranslator {
    source: ConnectionString,
    destination: ConnectionString,
}

impl TopicTranslator {
    pub fn from_datastream(datastream: &Datastream) -> Result<Self, ConnectionStringError> {
        Ok(Self {
            source: datastream.source_connection()?,
            destination: datastream.destination_connection()?,
        })
    }
}

impl Translator for TopicTranslator {
    fn subscription(&self) -> Subscription {
        Subscription::Topics(vec![self.source.name().to_owned()])
    }

    fn translate(
        &self,
        record: &Record,
        read_time_ms: i64,
    ) -> Result<ProducerRecord, TranslateError> {
        let envelope = build_envelope(record, read_time_ms, self.source.to_string());

        ProducerRecord::builder()
            .envelope(envelope)
            .destination(self.destination.to_string())
            .checkpoint(TopicCheckpoint::new(record.partition(), record.offset()).to_string())
            .source_timestamp_ms(events_source_timestamp(record, read_time_ms))
            .partition(record.partition())
            .build()
            .map_err(|err| TranslateError::Contract {
                topic: record.topic().to_owned(),
                partition: record.partition(),
                message: err.to_string(),
            })
    }
}

fn build_envelope(record: &Record, read_time_ms: i64, origin_cluster: String) -> Envelope {
    let mut meta = HashMap::new();
    meta.insert(metadata::ORIGIN_CLUSTER.to_owned(), origin_cluster);
    meta.insert(metadata::ORIGIN_TOPIC.to_owned(), record.topic().to_owned());
    meta.insert(
        metadata::ORIGIN_PARTITION.to_owned(),
        record.partition().to_string(),
    );
    meta.insert(
        metadata::ORIGIN_OFFSET.to_owned(),
        record.offset().to_string(),
    );

    match (record.timestamp_kind(), record.timestamp_ms()) {
        (TimestampKind::Create, Some(timestamp)) => {
            meta.insert(metadata::EVENT_TIMESTAMP.to_owned(), timestamp.to_string());
        }
        (TimestampKind::LogAppend, Some(timestamp)) => {
            meta.insert(
                metadata::SOURCE_TIMESTAMP.to_owned(),
                timestamp.to_string(),
            );
            meta.insert(
                metadata::EVENT_TIMESTAMP.to_owned(),
                read_time_ms.to_string(),
            );
        }
        _ => {
            meta.insert(
                metadata::EVENT_TIMESTAMP.to_owned(),
                read_time_ms.to_string(),
            );
        }
    }

    Envelope::new(
        record.key().map(<[u8]>::to_vec),
        record.value().map(<[u8]>::to_vec),
        None,
        meta,
    )
}

fn events_source_timestamp(record: &Record, read_time_ms: i64) -> i64 {
    match (record.timestamp_kind(), record.timestamp_ms()) {
        (TimestampKind::LogAppend, Some(timestamp)) => timestamp,
        _ => read_time_ms,
    }
}

use std::collections::HashMap;

/// Metadata keys every translated envelope carries.
pub mod metadata {
    pub const ORIGIN_CLUSTER: &str = "origin-cluster";
    pub const ORIGIN_TOPIC: &str = "origin-topic";
    pub const ORIGIN_PARTITION: &str = "origin-partition";
    pub const ORIGIN_OFFSET: &str = "origin-offset";
    pub const EVENT_TIMESTAMP: &str = "event-timestamp";
    /// Set iff the source record carried a log-append timestamp.
    pub const SOURCE_TIMESTAMP: &str = "source-timestamp";
}

/// The internal representation of one replicated record: opaque key and
/// value bytes plus a string-keyed metadata map describing its origin.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
    headers: Option<Vec<(String, Vec<u8>)>>,
    metadata: HashMap<String, String>,
}

impl Envelope {
    pub fn new(
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        headers: Option<Vec<(String, Vec<u8>)>>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            key,
            value,
            headers,
            metadata,
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn headers(&self) -> Option<&[(String, Vec<u8>)]> {
        self.headers.as_deref()
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

/// One envelope addressed to a destination, ready for the producer handle.
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    envelope: Envelope,
    destination: String,
    checkpoint: String,
    partition: Option<i32>,
    source_timestamp_ms: i64,
}

impl ProducerRecord {
    pub fn builder() -> ProducerRecordBuilder {
        ProducerRecordBuilder::default()
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Full destination connection string, with any topic placeholder
    /// already substituted.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The source checkpoint token this record advances once acknowledged.
    pub fn checkpoint(&self) -> &str {
        &self.checkpoint
    }

    /// Destination partition; `None` lets the destination hash by key.
    pub fn partition(&self) -> Option<i32> {
        self.partition
    }

    pub fn source_timestamp_ms(&self) -> i64 {
        self.source_timestamp_ms
    }
}

#[derive(Debug, Default)]
pub struct ProducerRecordBuilder {
    envelope: Option<Envelope>,
    destination: Option<String>,
    checkpoint: Option<String>,
    partition: Option<i32>,
    source_timestamp_ms: Option<i64>,
}

impl ProducerRecordBuilder {
    pub fn envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = Some(envelope);
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn checkpoint(mut self, checkpoint: impl Into<String>) -> Self {
        self.checkpoint = Some(checkpoint.into());
        self
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn source_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.source_timestamp_ms = Some(timestamp_ms);
        self
    }

    pub fn build(self) -> Result<ProducerRecord, IncompleteRecordError> {
        Ok(ProducerRecord {
            envelope: self.envelope.ok_or(IncompleteRecordError::Envelope)?,
            destination: self.destination.ok_or(IncompleteRecordError::Destination)?,
            checkpoint: self.checkpoint.ok_or(IncompleteRecordError::Checkpoint)?,
            partition: self.partition,
            source_timestamp_ms: self
                .source_timestamp_ms
                .ok_or(IncompleteRecordError::SourceTimestamp)?,
        })
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum IncompleteRecordError {
    #[error("producer record has no envelope")]
    Envelope,
    #[error("producer record has no destination")]
    Destination,
    #[error("producer record has no source checkpoint")]
    Checkpoint,
    #[error("producer record has no source timestamp")]
    SourceTimestamp,
}

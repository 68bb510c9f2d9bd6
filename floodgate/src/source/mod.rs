use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use crate::partition::SourcePartition;

pub mod kafka;

/// A record as polled from the source, before translation.
#[derive(Debug, Clone)]
pub struct Record {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
    timestamp_ms: Option<i64>,
    timestamp_kind: TimestampKind,
}

impl Record {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        timestamp_ms: Option<i64>,
        timestamp_kind: TimestampKind,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key,
            value,
            timestamp_ms,
            timestamp_kind,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn source_partition(&self) -> SourcePartition {
        SourcePartition::new(self.topic.clone(), self.partition)
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn timestamp_ms(&self) -> Option<i64> {
        self.timestamp_ms
    }

    pub fn timestamp_kind(&self) -> TimestampKind {
        self.timestamp_kind
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}@{}", self.topic, self.partition, self.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampKind {
    Create,
    LogAppend,
    #[default]
    NotAvailable,
}

/// One poll's worth of records, grouped by partition with per-partition
/// offset order preserved.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    records: BTreeMap<SourcePartition, Vec<Record>>,
}

impl RecordBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Record) {
        self.records
            .entry(record.source_partition())
            .or_default()
            .push(record);
    }

    pub fn partitions(&self) -> impl Iterator<Item = &SourcePartition> {
        self.records.keys()
    }

    pub fn records(&self, partition: &SourcePartition) -> &[Record] {
        self.records
            .get(partition)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    /// Drop every record belonging to one of `partitions`.
    pub fn retain_without(&mut self, partitions: &[SourcePartition]) {
        self.records.retain(|tp, _| !partitions.contains(tp));
    }
}

#[derive(Debug, Clone)]
pub enum Subscription {
    /// Regex over topic names; the adapter tracks topics matching the
    /// pattern as they appear.
    Pattern(String),
    Topics(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    topic: String,
    partition: i32,
}

impl PartitionInfo {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("no committed offset for partitions {0:?}")]
    NoOffsetForPartition(Vec<SourcePartition>),
    #[error("consumed offsets out of range: {0:?}")]
    OffsetOutOfRange(HashMap<SourcePartition, i64>),
    #[error("poll woken for shutdown")]
    Wakeup,
    #[error("source adapter is closed")]
    Closed,
    #[error("transient source failure: {message}")]
    Transient { message: String },
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }
}

/// The narrow adapter view available inside assignment callbacks. Callbacks
/// run on the polling thread, from inside `poll`, so a revoke can commit
/// progress before ownership moves.
pub trait AssignmentContext {
    fn assignment(&self) -> Result<Vec<SourcePartition>, SourceError>;

    /// Committed offset for the partition, if any commit exists.
    fn committed(&self, partition: &SourcePartition) -> Result<Option<i64>, SourceError>;

    /// Synchronously commit the given offsets, or the current consumed
    /// positions when `offsets` is `None`.
    fn commit_sync(
        &self,
        offsets: Option<&HashMap<SourcePartition, i64>>,
    ) -> Result<(), SourceError>;

    fn pause(&self, partitions: &[SourcePartition]) -> Result<(), SourceError>;
}

pub trait AssignmentListener: Send {
    fn on_assigned(&self, adapter: &dyn AssignmentContext, partitions: &[SourcePartition]);

    fn on_revoked(&self, adapter: &dyn AssignmentContext, partitions: &[SourcePartition]);
}

/// Cross-thread handle that aborts an in-progress `poll` with
/// [`SourceError::Wakeup`].
pub trait SourceWaker: Send + Sync {
    fn wakeup(&self);
}

/// Contract for a partitioned source. Implementations include the Kafka
/// consumer adapter in [`kafka`] and the scripted adapter used by tests;
/// a binary-log tail reader fits the same seam.
///
/// One subscription per adapter instance. `poll` blocks up to the given
/// timeout and returns records grouped by partition in offset order.
pub trait SourceAdapter: AssignmentContext + Send {
    fn subscribe(
        &mut self,
        subscription: Subscription,
        listener: Box<dyn AssignmentListener>,
    ) -> Result<(), SourceError>;

    fn poll(&mut self, timeout: Duration) -> Result<RecordBatch, SourceError>;

    fn paused(&self) -> Result<Vec<SourcePartition>, SourceError>;

    fn resume(&self, partitions: &[SourcePartition]) -> Result<(), SourceError>;

    fn seek(&self, partition: &SourcePartition, offset: i64) -> Result<(), SourceError>;

    fn seek_to_beginning(&self, partitions: &[SourcePartition]) -> Result<(), SourceError>;

    fn seek_to_end(&self, partitions: &[SourcePartition]) -> Result<(), SourceError>;

    fn partitions_for(&self, topic: &str) -> Result<Vec<PartitionInfo>, SourceError>;

    /// Hook invoked by the task loop when a poll reports
    /// [`SourceError::OffsetOutOfRange`]. The base behaviour is a no-op.
    fn handle_offset_out_of_range(&mut self, _partitions: &HashMap<SourcePartition, i64>) {}

    fn waker(&self) -> Arc<dyn SourceWaker>;

    /// Idempotent; releases network and memory resources. Any later call on
    /// the adapter fails with [`SourceError::Closed`].
    fn close(&mut self);
}

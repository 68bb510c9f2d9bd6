//! Scripted source adapters and producers for driving the task runtime in
//! tests without a broker.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::datastream::Datastream;
use crate::message::ProducerRecord;
use crate::partition::SourcePartition;
use crate::producer::{AckCallback, ProducerHandle, SendError};
use crate::source::{
    AssignmentContext, AssignmentListener, PartitionInfo, Record, RecordBatch, SourceAdapter,
    SourceError, SourceWaker, Subscription, TimestampKind,
};

pub(crate) fn tp(topic: &str, partition: i32) -> SourcePartition {
    SourcePartition::new(topic, partition)
}

pub(crate) fn record(topic: &str, partition: i32, offset: i64) -> Record {
    Record::new(
        topic,
        partition,
        offset,
        Some(format!("key-{offset}").into_bytes()),
        Some(format!("value-{offset}").into_bytes()),
        None,
        TimestampKind::NotAvailable,
    )
}

pub(crate) fn batch(records: Vec<Record>) -> RecordBatch {
    let mut batch = RecordBatch::new();
    for record in records {
        batch.push(record);
    }
    batch
}

pub(crate) fn mirror_datastream(name: &str) -> Datastream {
    Datastream::new(
        name,
        "mirror",
        "kafka://source:9092/^.*$",
        "kafka://dest:9092/%s",
    )
}

/// Spin until `condition` holds, failing the test after `timeout`.
pub(crate) fn wait_until(description: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for: {description}");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SeekTarget {
    Offset(i64),
    Beginning,
    End,
}

pub(crate) enum PollEvent {
    Assign(Vec<SourcePartition>),
    Revoke(Vec<SourcePartition>),
    Batch(RecordBatch),
    Error(SourceError),
    /// A consumer stuck inside poll; ignores wakeups for the duration.
    Hang(Duration),
}

/// Shared state of a [`MockSourceAdapter`], kept by tests to feed events and
/// observe calls.
#[derive(Default)]
pub(crate) struct MockSourceState {
    script: Mutex<VecDeque<PollEvent>>,
    assignment: Mutex<Vec<SourcePartition>>,
    paused: Mutex<BTreeSet<SourcePartition>>,
    committed: Mutex<HashMap<SourcePartition, i64>>,
    commit_history: Mutex<Vec<HashMap<SourcePartition, i64>>>,
    positions: Mutex<HashMap<SourcePartition, i64>>,
    seeks: Mutex<Vec<(SourcePartition, SeekTarget)>>,
    partitions_by_topic: Mutex<HashMap<String, Vec<i32>>>,
    woken: AtomicBool,
    closed: AtomicBool,
    out_of_range_calls: AtomicUsize,
}

impl MockSourceState {
    pub(crate) fn push_assign(&self, partitions: Vec<SourcePartition>) {
        self.script.lock().push_back(PollEvent::Assign(partitions));
    }

    pub(crate) fn push_revoke(&self, partitions: Vec<SourcePartition>) {
        self.script.lock().push_back(PollEvent::Revoke(partitions));
    }

    pub(crate) fn push_batch(&self, records: Vec<Record>) {
        self.script.lock().push_back(PollEvent::Batch(batch(records)));
    }

    pub(crate) fn push_error(&self, error: SourceError) {
        self.script.lock().push_back(PollEvent::Error(error));
    }

    pub(crate) fn push_hang(&self, duration: Duration) {
        self.script.lock().push_back(PollEvent::Hang(duration));
    }

    pub(crate) fn paused_set(&self) -> BTreeSet<SourcePartition> {
        self.paused.lock().clone()
    }

    pub(crate) fn commits(&self) -> Vec<HashMap<SourcePartition, i64>> {
        self.commit_history.lock().clone()
    }

    pub(crate) fn committed_offset(&self, partition: &SourcePartition) -> Option<i64> {
        self.committed.lock().get(partition).copied()
    }

    pub(crate) fn set_committed(&self, partition: SourcePartition, offset: i64) {
        self.committed.lock().insert(partition, offset);
    }

    pub(crate) fn seeks(&self) -> Vec<(SourcePartition, SeekTarget)> {
        self.seeks.lock().clone()
    }

    pub(crate) fn set_partitions_for(&self, topic: &str, partitions: Vec<i32>) {
        self.partitions_by_topic
            .lock()
            .insert(topic.to_owned(), partitions);
    }

    pub(crate) fn out_of_range_calls(&self) -> usize {
        self.out_of_range_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl AssignmentContext for MockSourceState {
    fn assignment(&self) -> Result<Vec<SourcePartition>, SourceError> {
        Ok(self.assignment.lock().clone())
    }

    fn committed(&self, partition: &SourcePartition) -> Result<Option<i64>, SourceError> {
        Ok(self.committed.lock().get(partition).copied())
    }

    fn commit_sync(
        &self,
        offsets: Option<&HashMap<SourcePartition, i64>>,
    ) -> Result<(), SourceError> {
        let to_commit = match offsets {
            Some(offsets) => offsets.clone(),
            None => self.positions.lock().clone(),
        };

        if to_commit.is_empty() {
            return Ok(());
        }

        self.committed.lock().extend(to_commit.clone());
        self.commit_history.lock().push(to_commit);
        Ok(())
    }

    fn pause(&self, partitions: &[SourcePartition]) -> Result<(), SourceError> {
        self.paused.lock().extend(partitions.iter().cloned());
        Ok(())
    }
}

struct MockWaker {
    state: Arc<MockSourceState>,
}

impl SourceWaker for MockWaker {
    fn wakeup(&self) {
        self.state.woken.store(true, Ordering::SeqCst);
    }
}

/// Scripted [`SourceAdapter`]: poll consumes events in order, invoking
/// assignment callbacks inline the way the Kafka client does.
pub(crate) struct MockSourceAdapter {
    state: Arc<MockSourceState>,
    listener: Option<Box<dyn AssignmentListener>>,
    subscription: Option<Subscription>,
}

impl MockSourceAdapter {
    pub(crate) fn new(state: Arc<MockSourceState>) -> Self {
        Self {
            state,
            listener: None,
            subscription: None,
        }
    }
}

impl AssignmentContext for MockSourceAdapter {
    fn assignment(&self) -> Result<Vec<SourcePartition>, SourceError> {
        self.state.assignment()
    }

    fn committed(&self, partition: &SourcePartition) -> Result<Option<i64>, SourceError> {
        self.state.committed(partition)
    }

    fn commit_sync(
        &self,
        offsets: Option<&HashMap<SourcePartition, i64>>,
    ) -> Result<(), SourceError> {
        self.state.commit_sync(offsets)
    }

    fn pause(&self, partitions: &[SourcePartition]) -> Result<(), SourceError> {
        self.state.pause(partitions)
    }
}

impl SourceAdapter for MockSourceAdapter {
    fn subscribe(
        &mut self,
        subscription: Subscription,
        listener: Box<dyn AssignmentListener>,
    ) -> Result<(), SourceError> {
        if self.subscription.is_some() {
            return Err(SourceError::transient("already subscribed"));
        }
        self.subscription = Some(subscription);
        self.listener = Some(listener);
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<RecordBatch, SourceError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Closed);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.state.woken.swap(false, Ordering::SeqCst) {
                return Err(SourceError::Wakeup);
            }

            let event = self.state.script.lock().pop_front();
            match event {
                Some(PollEvent::Assign(partitions)) => {
                    *self.state.assignment.lock() = partitions.clone();
                    if let Some(listener) = &self.listener {
                        listener.on_assigned(&*self.state, &partitions);
                    }
                }
                Some(PollEvent::Revoke(partitions)) => {
                    if let Some(listener) = &self.listener {
                        listener.on_revoked(&*self.state, &partitions);
                    }
                    self.state
                        .assignment
                        .lock()
                        .retain(|tp| !partitions.contains(tp));
                    let mut paused = self.state.paused.lock();
                    for tp in &partitions {
                        paused.remove(tp);
                    }
                }
                Some(PollEvent::Batch(mut batch)) => {
                    let paused: Vec<SourcePartition> =
                        self.state.paused.lock().iter().cloned().collect();
                    batch.retain_without(&paused);
                    if batch.is_empty() {
                        continue;
                    }

                    let mut positions = self.state.positions.lock();
                    for tp in batch.partitions() {
                        if let Some(last) = batch.records(tp).last() {
                            positions.insert(tp.clone(), last.offset() + 1);
                        }
                    }
                    return Ok(batch);
                }
                Some(PollEvent::Error(error)) => return Err(error),
                Some(PollEvent::Hang(duration)) => std::thread::sleep(duration),
                None => {
                    if Instant::now() >= deadline {
                        return Ok(RecordBatch::new());
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }
    }

    fn paused(&self) -> Result<Vec<SourcePartition>, SourceError> {
        Ok(self.state.paused.lock().iter().cloned().collect())
    }

    fn resume(&self, partitions: &[SourcePartition]) -> Result<(), SourceError> {
        let mut paused = self.state.paused.lock();
        for tp in partitions {
            paused.remove(tp);
        }
        Ok(())
    }

    fn seek(&self, partition: &SourcePartition, offset: i64) -> Result<(), SourceError> {
        self.state
            .seeks
            .lock()
            .push((partition.clone(), SeekTarget::Offset(offset)));
        self.state.positions.lock().insert(partition.clone(), offset);
        Ok(())
    }

    fn seek_to_beginning(&self, partitions: &[SourcePartition]) -> Result<(), SourceError> {
        let mut seeks = self.state.seeks.lock();
        let mut positions = self.state.positions.lock();
        for tp in partitions {
            seeks.push((tp.clone(), SeekTarget::Beginning));
            positions.insert(tp.clone(), 0);
        }
        Ok(())
    }

    fn seek_to_end(&self, partitions: &[SourcePartition]) -> Result<(), SourceError> {
        let mut seeks = self.state.seeks.lock();
        for tp in partitions {
            seeks.push((tp.clone(), SeekTarget::End));
        }
        Ok(())
    }

    fn partitions_for(&self, topic: &str) -> Result<Vec<PartitionInfo>, SourceError> {
        Ok(self
            .state
            .partitions_by_topic
            .lock()
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .map(|partition| PartitionInfo::new(topic, *partition))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn handle_offset_out_of_range(&mut self, _partitions: &HashMap<SourcePartition, i64>) {
        self.state.out_of_range_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn waker(&self) -> Arc<dyn SourceWaker> {
        Arc::new(MockWaker {
            state: self.state.clone(),
        })
    }

    fn close(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SentRecord {
    pub destination: String,
    pub checkpoint: String,
    pub partition: Option<i32>,
    pub metadata: HashMap<String, String>,
}

struct PendingAck {
    checkpoint: String,
    destination: String,
    ack: AckCallback,
}

/// Scripted [`ProducerHandle`]: acks inline by default, can hold acks for
/// later release, and can fail specific checkpoints either synchronously on
/// `send` or terminally when their held ack resolves. Terminal failures are
/// counted until the next `flush`, which then reports them the way the
/// Kafka handle does.
#[derive(Default)]
pub(crate) struct MockProducer {
    sends: Mutex<Vec<SentRecord>>,
    pending: Mutex<Vec<PendingAck>>,
    hold_acks: AtomicBool,
    fail_sends: Mutex<HashSet<String>>,
    fail_acks: Mutex<HashSet<String>>,
    failed_since_flush: AtomicUsize,
    flush_count: AtomicUsize,
}

impl MockProducer {
    pub(crate) fn holding() -> Self {
        let producer = Self::default();
        producer.hold_acks.store(true, Ordering::SeqCst);
        producer
    }

    pub(crate) fn fail_send_for(&self, checkpoint: &str) {
        self.fail_sends.lock().insert(checkpoint.to_owned());
    }

    /// Mark a held checkpoint so its ack resolves as a terminal delivery
    /// failure when `flush` drains it.
    pub(crate) fn fail_ack_for(&self, checkpoint: &str) {
        self.fail_acks.lock().insert(checkpoint.to_owned());
    }

    pub(crate) fn release(&self, checkpoint: &str, result: Result<(), SendError>) {
        let mut pending = self.pending.lock();
        let position = pending
            .iter()
            .position(|held| held.checkpoint == checkpoint)
            .unwrap_or_else(|| panic!("no pending ack for checkpoint {checkpoint}"));
        let held = pending.remove(position);
        drop(pending);

        if result.is_err() {
            self.failed_since_flush.fetch_add(1, Ordering::SeqCst);
        }
        (held.ack)(result);
    }

    pub(crate) fn sends(&self) -> Vec<SentRecord> {
        self.sends.lock().clone()
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sends.lock().len()
    }

    pub(crate) fn checkpoints(&self) -> Vec<String> {
        self.sends
            .lock()
            .iter()
            .map(|send| send.checkpoint.clone())
            .collect()
    }

    pub(crate) fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::SeqCst)
    }
}

impl ProducerHandle for MockProducer {
    fn send(&self, record: ProducerRecord, ack: AckCallback) -> Result<(), SendError> {
        if self.fail_sends.lock().contains(record.checkpoint()) {
            return Err(SendError::Transient {
                destination: record.destination().to_owned(),
                message: "scripted send failure".to_owned(),
            });
        }

        self.sends.lock().push(SentRecord {
            destination: record.destination().to_owned(),
            checkpoint: record.checkpoint().to_owned(),
            partition: record.partition(),
            metadata: record.envelope().metadata().clone(),
        });

        if self.hold_acks.load(Ordering::SeqCst) {
            self.pending.lock().push(PendingAck {
                checkpoint: record.checkpoint().to_owned(),
                destination: record.destination().to_owned(),
                ack,
            });
        } else {
            ack(Ok(()));
        }

        Ok(())
    }

    fn flush(&self) -> Result<(), SendError> {
        self.flush_count.fetch_add(1, Ordering::SeqCst);

        let pending: Vec<PendingAck> = std::mem::take(&mut *self.pending.lock());
        for held in pending {
            if self.fail_acks.lock().contains(&held.checkpoint) {
                self.failed_since_flush.fetch_add(1, Ordering::SeqCst);
                (held.ack)(Err(SendError::Delivery {
                    destination: held.destination,
                    message: "scripted delivery failure".to_owned(),
                }));
            } else {
                (held.ack)(Ok(()));
            }
        }

        let failures = self.failed_since_flush.swap(0, Ordering::SeqCst);
        if failures > 0 {
            return Err(SendError::FlushFailures { failures });
        }
        Ok(())
    }
}

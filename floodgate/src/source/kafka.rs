/*
 * Copyright 2024 Thaddeus Treloar
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, ClientContext, Offset, Timestamp, TopicPartitionList};
use tracing::{debug, error, warn};

use crate::config::{OffsetReset, TaskConfig};
use crate::datastream::{ConnectionStringError, Datastream};
use crate::partition::SourcePartition;

use super::{
    AssignmentContext, AssignmentListener, PartitionInfo, Record, RecordBatch, SourceAdapter,
    SourceError, SourceWaker, Subscription, TimestampKind,
};

/// Granularity at which a blocking poll re-checks the wakeup flag.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Upper bound on records returned by a single poll.
const MAX_BATCH_SIZE: usize = 500;

/// Timeout for individual client operations (seek, commit, metadata).
const OPERATION_TIMEOUT: Duration = Duration::from_millis(2500);

#[derive(Debug, thiserror::Error)]
pub enum KafkaSourceError {
    #[error(transparent)]
    Connection(#[from] ConnectionStringError),
    #[error("failed to create consumer: {0}")]
    CreateConsumer(#[from] KafkaError),
}

/// [`SourceAdapter`] over a Kafka consumer.
///
/// Rebalance callbacks arrive on the polling thread, from inside `poll`, and
/// are forwarded to the registered [`AssignmentListener`] together with a
/// narrow consumer view so a revoke can commit inline.
pub struct KafkaSourceAdapter {
    consumer: Arc<BaseConsumer<CallbackContext>>,
    context: Arc<SharedContext>,
    waker: Arc<KafkaWaker>,
    subscribed: bool,
    closed: bool,
}

impl KafkaSourceAdapter {
    /// Build the consumer for a datastream task: brokers and security from
    /// the source connection string, the group derived from the datastream,
    /// auto-commit off (auto-commits are unsafe for at-least-once delivery)
    /// and the reset policy from the task config.
    pub fn from_datastream(
        datastream: &Datastream,
        config: &TaskConfig,
    ) -> Result<Self, KafkaSourceError> {
        let source = datastream.source_connection()?;

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", source.bootstrap_servers())
            .set("group.id", datastream.group_id())
            .set("enable.auto.commit", "false")
            .set(
                "auto.offset.reset",
                match config.auto_offset_reset {
                    OffsetReset::Earliest => "earliest",
                    OffsetReset::Latest => "latest",
                },
            )
            .set(
                "security.protocol",
                if source.is_secure() { "SSL" } else { "PLAINTEXT" },
            )
            .set_log_level(RDKafkaLogLevel::Warning);

        Self::from_client_config(&client_config)
    }

    pub fn from_client_config(client_config: &ClientConfig) -> Result<Self, KafkaSourceError> {
        let shared = Arc::new(SharedContext::default());
        let context = CallbackContext {
            shared: shared.clone(),
        };

        let consumer: BaseConsumer<CallbackContext> =
            client_config.create_with_context(context)?;
        let consumer = Arc::new(consumer);

        *shared.consumer.lock() = Arc::downgrade(&consumer);

        Ok(Self {
            consumer,
            context: shared,
            waker: Arc::new(KafkaWaker::default()),
            subscribed: false,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<(), SourceError> {
        if self.closed {
            Err(SourceError::Closed)
        } else {
            Ok(())
        }
    }

    fn map_poll_error(&self, err: KafkaError) -> SourceError {
        match err {
            KafkaError::MessageConsumption(RDKafkaErrorCode::NoOffset) => {
                SourceError::NoOffsetForPartition(self.partitions_without_commit())
            }
            KafkaError::MessageConsumption(RDKafkaErrorCode::OffsetOutOfRange) => {
                SourceError::OffsetOutOfRange(self.current_positions())
            }
            err => SourceError::transient(err.to_string()),
        }
    }

    /// Assigned partitions that have no committed offset, the set reported
    /// with [`SourceError::NoOffsetForPartition`].
    fn partitions_without_commit(&self) -> Vec<SourcePartition> {
        let Ok(assignment) = self.assignment() else {
            return Vec::new();
        };

        assignment
            .into_iter()
            .filter(|tp| matches!(self.committed(tp), Ok(None)))
            .collect()
    }

    fn current_positions(&self) -> HashMap<SourcePartition, i64> {
        let Ok(positions) = self.consumer.position() else {
            return HashMap::new();
        };
        if positions.count() == 0 {
            return HashMap::new();
        }

        positions
            .elements()
            .iter()
            .filter_map(|elem| {
                elem.offset().to_raw().map(|offset| {
                    (
                        SourcePartition::new(elem.topic(), elem.partition()),
                        offset,
                    )
                })
            })
            .collect()
    }
}

impl AssignmentContext for KafkaSourceAdapter {
    fn assignment(&self) -> Result<Vec<SourcePartition>, SourceError> {
        self.ensure_open()?;
        let assignment = self
            .consumer
            .assignment()
            .map_err(|err| SourceError::transient(err.to_string()))?;
        Ok(partitions_of(&assignment))
    }

    fn committed(&self, partition: &SourcePartition) -> Result<Option<i64>, SourceError> {
        self.ensure_open()?;
        committed_offset(&self.consumer, partition)
    }

    fn commit_sync(
        &self,
        offsets: Option<&HashMap<SourcePartition, i64>>,
    ) -> Result<(), SourceError> {
        self.ensure_open()?;
        commit_offsets(&self.consumer, offsets)
    }

    fn pause(&self, partitions: &[SourcePartition]) -> Result<(), SourceError> {
        self.ensure_open()?;
        pause_partitions(&self.consumer, &self.context.paused, partitions)
    }
}

impl SourceAdapter for KafkaSourceAdapter {
    fn subscribe(
        &mut self,
        subscription: Subscription,
        listener: Box<dyn AssignmentListener>,
    ) -> Result<(), SourceError> {
        self.ensure_open()?;
        if self.subscribed {
            return Err(SourceError::transient(
                "adapter already holds a subscription",
            ));
        }

        *self.context.listener.lock() = Some(listener);

        match subscription {
            Subscription::Pattern(pattern) => {
                // the client treats topics starting with '^' as regex
                let pattern = if pattern.starts_with('^') {
                    pattern
                } else {
                    format!("^{}", pattern)
                };
                self.consumer
                    .subscribe(&[pattern.as_str()])
                    .map_err(|err| SourceError::transient(err.to_string()))?;
            }
            Subscription::Topics(topics) => {
                let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
                self.consumer
                    .subscribe(&topics)
                    .map_err(|err| SourceError::transient(err.to_string()))?;
            }
        }

        self.subscribed = true;
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<RecordBatch, SourceError> {
        self.ensure_open()?;

        let deadline = Instant::now() + timeout;
        loop {
            if self.waker.take() {
                return Err(SourceError::Wakeup);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = remaining.min(POLL_SLICE);

            match self.consumer.poll(slice) {
                Some(Ok(message)) => {
                    let mut batch = RecordBatch::new();
                    batch.push(record_of(&message));

                    // drain whatever else is already buffered
                    while batch.count() < MAX_BATCH_SIZE {
                        match self.consumer.poll(Duration::ZERO) {
                            Some(Ok(message)) => batch.push(record_of(&message)),
                            Some(Err(err)) => {
                                warn!("Poll error while draining batch: {}", err);
                                break;
                            }
                            None => break,
                        }
                    }

                    return Ok(batch);
                }
                Some(Err(err)) => return Err(self.map_poll_error(err)),
                None => {
                    if Instant::now() >= deadline {
                        return Ok(RecordBatch::new());
                    }
                }
            }
        }
    }

    fn paused(&self) -> Result<Vec<SourcePartition>, SourceError> {
        self.ensure_open()?;
        Ok(self.context.paused.lock().iter().cloned().collect())
    }

    fn resume(&self, partitions: &[SourcePartition]) -> Result<(), SourceError> {
        self.ensure_open()?;
        self.consumer
            .resume(&partition_list(partitions))
            .map_err(|err| SourceError::transient(err.to_string()))?;

        let mut paused = self.context.paused.lock();
        for tp in partitions {
            paused.remove(tp);
        }
        Ok(())
    }

    fn seek(&self, partition: &SourcePartition, offset: i64) -> Result<(), SourceError> {
        self.ensure_open()?;
        self.consumer
            .seek(
                partition.topic(),
                partition.partition(),
                Offset::Offset(offset),
                OPERATION_TIMEOUT,
            )
            .map_err(|err| SourceError::transient(err.to_string()))
    }

    fn seek_to_beginning(&self, partitions: &[SourcePartition]) -> Result<(), SourceError> {
        self.ensure_open()?;
        for tp in partitions {
            self.consumer
                .seek(
                    tp.topic(),
                    tp.partition(),
                    Offset::Beginning,
                    OPERATION_TIMEOUT,
                )
                .map_err(|err| SourceError::transient(err.to_string()))?;
        }
        Ok(())
    }

    fn seek_to_end(&self, partitions: &[SourcePartition]) -> Result<(), SourceError> {
        self.ensure_open()?;
        for tp in partitions {
            self.consumer
                .seek(tp.topic(), tp.partition(), Offset::End, OPERATION_TIMEOUT)
                .map_err(|err| SourceError::transient(err.to_string()))?;
        }
        Ok(())
    }

    fn partitions_for(&self, topic: &str) -> Result<Vec<PartitionInfo>, SourceError> {
        self.ensure_open()?;
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), OPERATION_TIMEOUT)
            .map_err(|err| SourceError::transient(err.to_string()))?;

        let Some(topic_metadata) = metadata.topics().first() else {
            return Ok(Vec::new());
        };

        if let Some(err) = topic_metadata.error() {
            return Err(SourceError::transient(format!(
                "metadata error for topic {}: {:?}",
                topic, err
            )));
        }

        Ok(topic_metadata
            .partitions()
            .iter()
            .map(|partition| PartitionInfo::new(topic, partition.id()))
            .collect())
    }

    fn waker(&self) -> Arc<dyn SourceWaker> {
        self.waker.clone()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.consumer.unsubscribe();
        debug!("Kafka source adapter closed");
    }
}

#[derive(Default)]
pub struct KafkaWaker {
    woken: AtomicBool,
}

impl KafkaWaker {
    fn take(&self) -> bool {
        self.woken.swap(false, Ordering::SeqCst)
    }
}

impl SourceWaker for KafkaWaker {
    fn wakeup(&self) {
        self.woken.store(true, Ordering::SeqCst);
    }
}

/// State shared between the adapter and the consumer context so rebalance
/// callbacks can reach the listener and the paused-set tracking. The client
/// does not expose its paused set, so the adapter maintains it.
#[derive(Default)]
struct SharedContext {
    listener: Mutex<Option<Box<dyn AssignmentListener>>>,
    consumer: Mutex<Weak<BaseConsumer<CallbackContext>>>,
    paused: Mutex<BTreeSet<SourcePartition>>,
}

struct CallbackContext {
    shared: Arc<SharedContext>,
}

impl ClientContext for CallbackContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!("librdkafka {}: {}", fac, log_message),
            RDKafkaLogLevel::Warning => warn!("librdkafka {}: {}", fac, log_message),
            _ => debug!("librdkafka {}: {}", fac, log_message),
        }
    }
}

impl ConsumerContext for CallbackContext {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        if let Rebalance::Revoke(revoked) = rebalance {
            let revoked = partitions_of(revoked);
            self.with_listener_view(|listener, view| listener.on_revoked(view, &revoked));

            let mut paused = self.shared.paused.lock();
            for tp in &revoked {
                paused.remove(tp);
            }
        }

        if let Rebalance::Error(err) = rebalance {
            error!("Rebalance error: {}", err);
        }
    }

    fn post_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        if let Rebalance::Assign(assigned) = rebalance {
            let assigned = partitions_of(assigned);
            self.with_listener_view(|listener, view| listener.on_assigned(view, &assigned));
        }
    }
}

impl CallbackContext {
    fn with_listener_view(
        &self,
        call: impl FnOnce(&dyn AssignmentListener, &dyn AssignmentContext),
    ) {
        let listener = self.shared.listener.lock();
        let Some(listener) = listener.as_ref() else {
            return;
        };

        let Some(consumer) = self.shared.consumer.lock().upgrade() else {
            return;
        };

        let view = KafkaCallbackView {
            consumer: &consumer,
            paused: &self.shared.paused,
        };
        call(listener.as_ref(), &view);
    }
}

/// The consumer view handed to assignment callbacks: enough to checkpoint
/// and pause inline, nothing more.
struct KafkaCallbackView<'a> {
    consumer: &'a BaseConsumer<CallbackContext>,
    paused: &'a Mutex<BTreeSet<SourcePartition>>,
}

impl AssignmentContext for KafkaCallbackView<'_> {
    fn assignment(&self) -> Result<Vec<SourcePartition>, SourceError> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|err| SourceError::transient(err.to_string()))?;
        Ok(partitions_of(&assignment))
    }

    fn committed(&self, partition: &SourcePartition) -> Result<Option<i64>, SourceError> {
        committed_offset(self.consumer, partition)
    }

    fn commit_sync(
        &self,
        offsets: Option<&HashMap<SourcePartition, i64>>,
    ) -> Result<(), SourceError> {
        commit_offsets(self.consumer, offsets)
    }

    fn pause(&self, partitions: &[SourcePartition]) -> Result<(), SourceError> {
        pause_partitions(self.consumer, self.paused, partitions)
    }
}

fn committed_offset(
    consumer: &BaseConsumer<CallbackContext>,
    partition: &SourcePartition,
) -> Result<Option<i64>, SourceError> {
    let mut list = TopicPartitionList::new();
    list.add_partition(partition.topic(), partition.partition());

    let committed = consumer
        .committed_offsets(list, OPERATION_TIMEOUT)
        .map_err(|err| SourceError::transient(err.to_string()))?;

    let offset = committed
        .find_partition(partition.topic(), partition.partition())
        .map(|elem| elem.offset());

    Ok(offset.and_then(|offset| offset.to_raw()).filter(|raw| *raw >= 0))
}

fn commit_offsets(
    consumer: &BaseConsumer<CallbackContext>,
    offsets: Option<&HashMap<SourcePartition, i64>>,
) -> Result<(), SourceError> {
    let result = match offsets {
        Some(offsets) => {
            let mut list = TopicPartitionList::new();
            for (tp, offset) in offsets {
                list.add_partition_offset(tp.topic(), tp.partition(), Offset::Offset(*offset))
                    .map_err(|err| SourceError::transient(err.to_string()))?;
            }
            consumer.commit(&list, CommitMode::Sync)
        }
        None => consumer.commit_consumer_state(CommitMode::Sync),
    };

    match result {
        Ok(()) => Ok(()),
        // committing with nothing consumed yet is not a failure
        Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
        Err(err) => Err(SourceError::transient(err.to_string())),
    }
}

fn pause_partitions(
    consumer: &BaseConsumer<CallbackContext>,
    paused: &Mutex<BTreeSet<SourcePartition>>,
    partitions: &[SourcePartition],
) -> Result<(), SourceError> {
    consumer
        .pause(&partition_list(partitions))
        .map_err(|err| SourceError::transient(err.to_string()))?;

    paused.lock().extend(partitions.iter().cloned());
    Ok(())
}

fn partition_list(partitions: &[SourcePartition]) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    for tp in partitions {
        list.add_partition(tp.topic(), tp.partition());
    }
    list
}

fn partitions_of(list: &TopicPartitionList) -> Vec<SourcePartition> {
    // elements() on an empty list trips a null-pointer bug in the client
    if list.count() == 0 {
        return Vec::new();
    }

    list.elements()
        .iter()
        .map(|elem| SourcePartition::new(elem.topic(), elem.partition()))
        .collect()
}

fn record_of(message: &rdkafka::message::BorrowedMessage<'_>) -> Record {
    let (timestamp_ms, timestamp_kind) = match message.timestamp() {
        Timestamp::CreateTime(ms) => (Some(ms), TimestampKind::Create),
        Timestamp::LogAppendTime(ms) => (Some(ms), TimestampKind::LogAppend),
        Timestamp::NotAvailable => (None, TimestampKind::NotAvailable),
    };

    Record::new(
        message.topic(),
        message.partition(),
        message.offset(),
        message.key().map(<[u8]>::to_vec),
        message.payload().map(<[u8]>::to_vec),
        timestamp_ms,
        timestamp_kind,
    )
}

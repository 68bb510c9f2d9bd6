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
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::error;

use crate::message::ProducerRecord;
use crate::partition::SourcePartition;
use crate::producer::{ProducerHandle, SendError};

/// Delivery tracking that decouples sending from checkpointing, so the task
/// never flushes the producer in steady state.
///
/// Per partition the tracker keeps the window of in-flight offsets and the
/// highest acknowledged offset that is safe to commit: the checkpoint only
/// advances to a contiguous boundary, so an unacknowledged offset holds back
/// everything after it.
pub struct FlushlessTracker {
    producer: Arc<dyn ProducerHandle>,
    partitions: DashMap<SourcePartition, Arc<Mutex<PartitionWindow>>>,
    failed: Arc<Mutex<BTreeSet<SourcePartition>>>,
}

#[derive(Debug, Default)]
struct PartitionWindow {
    in_flight: BTreeSet<i64>,
    acked: BTreeSet<i64>,
    ack_checkpoint: Option<i64>,
}

impl PartitionWindow {
    fn ack(&mut self, offset: i64) {
        self.in_flight.remove(&offset);
        self.acked.insert(offset);

        // Drain the acked prefix below the lowest offset still in flight.
        while let Some(&lowest_acked) = self.acked.first() {
            let blocked = self
                .in_flight
                .first()
                .is_some_and(|&in_flight| in_flight < lowest_acked);

            if blocked {
                break;
            }

            self.acked.pop_first();
            self.ack_checkpoint = Some(lowest_acked);
        }
    }
}

impl FlushlessTracker {
    pub fn new(producer: Arc<dyn ProducerHandle>) -> Self {
        Self {
            producer,
            partitions: DashMap::new(),
            failed: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Forward `record` to the producer and start tracking `offset` for the
    /// source partition it came from. The offset joins the in-flight window
    /// before the send so a synchronous ack cannot race it.
    pub fn send(
        &self,
        record: ProducerRecord,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), SendError> {
        let tp = SourcePartition::new(topic, partition);
        let window = self
            .partitions
            .entry(tp.clone())
            .or_insert_with(|| Arc::new(Mutex::new(PartitionWindow::default())))
            .clone();

        window.lock().in_flight.insert(offset);

        let ack_window = window.clone();
        let failed = self.failed.clone();
        let result = self.producer.send(
            record,
            Box::new(move |result| match result {
                Ok(()) => ack_window.lock().ack(offset),
                Err(err) => {
                    error!(
                        "Terminal delivery failure for {}-{} offset {}: {}",
                        tp.topic(),
                        tp.partition(),
                        offset,
                        err
                    );
                    // the offset stays in flight so the checkpoint can never
                    // pass the failed record
                    failed.lock().insert(tp.clone());
                }
            }),
        );

        if result.is_err() {
            // never entered the transport, stop tracking it
            window.lock().in_flight.remove(&offset);
        }

        result
    }

    pub fn in_flight_count(&self, topic: &str, partition: i32) -> usize {
        self.partitions
            .get(&SourcePartition::new(topic, partition))
            .map(|window| window.lock().in_flight.len())
            .unwrap_or(0)
    }

    /// The safe offset for the partition: every offset up to and including
    /// it has been acknowledged. `None` until the first ack after creation
    /// or [`clear`](Self::clear).
    pub fn ack_checkpoint(&self, topic: &str, partition: i32) -> Option<i64> {
        self.partitions
            .get(&SourcePartition::new(topic, partition))
            .and_then(|window| window.lock().ack_checkpoint)
    }

    pub fn in_flight_message_counts(&self) -> HashMap<SourcePartition, usize> {
        self.partitions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().in_flight.len()))
            .collect()
    }

    /// Partitions whose deliveries failed terminally since the last drain.
    /// The task loop applies its send-error recovery to each.
    pub fn take_failed_partitions(&self) -> Vec<SourcePartition> {
        std::mem::take(&mut *self.failed.lock()).into_iter().collect()
    }

    pub fn has_failed(&self, partition: &SourcePartition) -> bool {
        self.failed.lock().contains(partition)
    }

    /// Reset all windows after a successful flush and commit.
    pub fn clear(&self) {
        self.partitions.clear();
        self.failed.lock().clear();
    }
}

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

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam::atomic::AtomicCell;
use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{commit_action, CommitAction};
use crate::config::{ConfigError, OffsetReset, TaskConfig};
use crate::datastream::{ConnectionStringError, Datastream, MetadataError};
use crate::diag::{DatastreamStateResponse, PositionEntry, PositionTracker};
use crate::partition::SourcePartition;
use crate::pause::{PauseController, PauseEntry, PauseReason};
use crate::producer::{ProducerHandle, SendError};
use crate::source::{
    AssignmentContext, AssignmentListener, RecordBatch, SourceAdapter, SourceError, SourceWaker,
};
use crate::tracker::FlushlessTracker;

use self::readiness::TopicReadiness;
use self::translate::{TranslateError, Translator};

pub mod readiness;
pub mod translate;

/// Extra slack before a poll is counted as overrunning its timeout.
const POLL_BUFFER_TIME: Duration = Duration::from_secs(1);

/// How often the processed-records progress line may be emitted.
const EVENTS_PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    #[default]
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Control signals pushed onto the task's update queue. Producers are the
/// supervisor, the assignment callbacks, and the flow-control path; the loop
/// drains the queue before every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskUpdate {
    PauseResumePartitions,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connection(#[from] ConnectionStringError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Translation(#[from] TranslateError),
    #[error("failed to subscribe the source adapter: {0}")]
    Subscribe(SourceError),
    #[error("source adapter closed unexpectedly")]
    SourceClosed,
    #[error("producer failed fatally: {0}")]
    Producer(SendError),
    #[error("no start offset configured for partition {partition}")]
    MissingStartOffset { partition: SourcePartition },
}

#[derive(Debug, thiserror::Error)]
enum CommitFailure {
    #[error("producer flush failed: {0}")]
    Flush(SendError),
    #[error("offset commit failed: {0}")]
    Commit(SourceError),
}

/// One-shot gate used for the started/stopped signals and for
/// stop-interruptible sleeps.
pub(crate) struct Latch {
    opened: Mutex<bool>,
    condvar: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self {
            opened: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn open(&self) {
        let mut opened = self.opened.lock();
        *opened = true;
        self.condvar.notify_all();
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut opened = self.opened.lock();
        while !*opened {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.condvar.wait_for(&mut opened, deadline - now);
        }
        true
    }
}

/// State shared between the loop thread, the assignment callbacks (which run
/// on the loop thread, inside `poll`) and the supervisor. Everything here is
/// either immutable, atomic, or behind its own short-lived lock.
pub(crate) struct TaskContext {
    task_name: String,
    datastream: Mutex<Datastream>,
    config: TaskConfig,
    state: AtomicCell<TaskState>,
    stop_requested: AtomicBool,
    stop_latch: Latch,
    started: Latch,
    stopped: Latch,
    updates: SegQueue<TaskUpdate>,
    pause: PauseController,
    producer: Arc<dyn ProducerHandle>,
    tracker: Option<Arc<FlushlessTracker>>,
    waker: Arc<dyn SourceWaker>,
    last_polled: AtomicCell<Instant>,
    last_committed: AtomicCell<Instant>,
    assignment: Mutex<Vec<SourcePartition>>,
    positions: PositionTracker,
}

impl TaskContext {
    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{} stopping", self.task_name);
        match self.state.load() {
            TaskState::Stopped | TaskState::Error => {}
            _ => self.state.store(TaskState::Stopping),
        }
        self.stop_latch.open();
        self.waker.wakeup();
    }

    /// Sleep up to `duration`, returning early (true) when stop is
    /// requested.
    fn interruptible_sleep(&self, duration: Duration) -> bool {
        self.stop_latch.wait_timeout(duration)
    }

    /// Commit the tracker's safe offsets for every assigned partition that
    /// has one.
    fn commit_safe_offsets<A>(&self, adapter: &A) -> Result<(), SourceError>
    where
        A: AssignmentContext + ?Sized,
    {
        let Some(tracker) = &self.tracker else {
            return Ok(());
        };

        let mut offsets = HashMap::new();
        for tp in adapter.assignment()? {
            // the safe offset plus one is the next offset to consume
            if let Some(checkpoint) = tracker.ack_checkpoint(tp.topic(), tp.partition()) {
                offsets.insert(tp, checkpoint + 1);
            }
        }

        if !offsets.is_empty() {
            adapter.commit_sync(Some(&offsets))?;
            for (tp, offset) in &offsets {
                self.positions.record_committed(tp, *offset);
            }
        }

        self.last_committed.store(Instant::now());
        Ok(())
    }

    fn flush_and_commit<A>(&self, adapter: &A) -> Result<(), CommitFailure>
    where
        A: AssignmentContext + ?Sized,
    {
        self.producer.flush().map_err(CommitFailure::Flush)?;

        match &self.tracker {
            Some(tracker) => {
                self.commit_safe_offsets(adapter)
                    .map_err(CommitFailure::Commit)?;
                tracker.clear();
            }
            None => {
                adapter.commit_sync(None).map_err(CommitFailure::Commit)?;
                self.positions.commit_polled();
                self.last_committed.store(Instant::now());
            }
        }

        Ok(())
    }
}

/// The consumer-producer loop driving one datastream task.
///
/// Owns the source adapter for its lifetime; everything observable from the
/// outside goes through the [`TaskHandle`]. The loop is cooperative: stop
/// wakes the adapter, and retries and sleeps abort as soon as stop is
/// requested.
pub struct ConnectorTask {
    ctx: Arc<TaskContext>,
    adapter: Box<dyn SourceAdapter>,
    translator: Box<dyn Translator>,
    readiness: Arc<dyn TopicReadiness>,
    events_processed: usize,
    events_logged_at: Instant,
    slow_poll_count: u64,
    delayed_batch_count: u64,
}

impl ConnectorTask {
    pub fn new(
        datastream: Datastream,
        config: TaskConfig,
        adapter: Box<dyn SourceAdapter>,
        producer: Arc<dyn ProducerHandle>,
        translator: Box<dyn Translator>,
        readiness: Arc<dyn TopicReadiness>,
    ) -> Result<Self, TaskError> {
        config.validate()?;

        let manual_paused = datastream.paused_source_partitions()?;
        let tracker = config
            .flushless_mode
            .then(|| Arc::new(FlushlessTracker::new(producer.clone())));

        info!(
            "Creating connector task for datastream {} with commit interval {:?}, retry sleep {:?}, \
             retry count {}, pausePartitionOnSendError {}, flushless {}",
            datastream.name(),
            config.offset_commit_interval,
            config.retry_sleep,
            config.max_retry_count,
            config.pause_partition_on_error,
            config.flushless_mode,
        );

        let waker = adapter.waker();
        let pause = PauseController::new();
        pause.set_manual(manual_paused);

        let ctx = Arc::new(TaskContext {
            task_name: datastream.name().to_owned(),
            datastream: Mutex::new(datastream),
            config,
            state: AtomicCell::new(TaskState::Starting),
            stop_requested: AtomicBool::new(false),
            stop_latch: Latch::new(),
            started: Latch::new(),
            stopped: Latch::new(),
            updates: SegQueue::new(),
            pause,
            producer,
            tracker,
            waker,
            last_polled: AtomicCell::new(Instant::now()),
            last_committed: AtomicCell::new(Instant::now()),
            assignment: Mutex::new(Vec::new()),
            positions: PositionTracker::new(),
        });

        Ok(Self {
            ctx,
            adapter,
            translator,
            readiness,
            events_processed: 0,
            events_logged_at: Instant::now(),
            slow_poll_count: 0,
            delayed_batch_count: 0,
        })
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            ctx: self.ctx.clone(),
        }
    }

    /// Run the task to completion. Intended as a thread target; returns once
    /// stop is requested or a fatal error occurs.
    pub fn run(mut self) {
        info!("Starting connector task for datastream {}", self.ctx.task_name);

        let result = self.run_loop();

        match &result {
            Ok(()) => {
                if let Err(err) = self.ctx.flush_and_commit(&*self.adapter) {
                    warn!(
                        "Final commit for task {} failed: {}",
                        self.ctx.task_name, err
                    );
                }
                self.ctx.state.store(TaskState::Stopped);
            }
            Err(err) => {
                error!("Task {} failed: {}", self.ctx.task_name, err);
                self.ctx.state.store(TaskState::Error);
            }
        }

        self.adapter.close();
        self.readiness.stop();

        // unblock waiters even when startup never completed
        self.ctx.started.open();
        self.ctx.stopped.open();
        info!("{} stopped", self.ctx.task_name);
    }

    fn run_loop(&mut self) -> Result<(), TaskError> {
        let listener = TaskListener {
            ctx: self.ctx.clone(),
            readiness: self.readiness.clone(),
        };

        let subscription = self.translator.subscription();
        debug!("Subscribing to source: {:?}", subscription);
        self.adapter
            .subscribe(subscription, Box::new(listener))
            .map_err(TaskError::Subscribe)?;

        let poll_timeout = self.ctx.config.poll_timeout();
        // first poll is fast so startup can be signalled promptly
        let mut current_timeout = Duration::ZERO;
        let mut starting_up = true;

        while !self.ctx.stop_requested() {
            if self.ctx.pause.has_resumable_entries() {
                self.ctx.updates.push(TaskUpdate::PauseResumePartitions);
            }
            self.drain_task_updates()?;
            self.recover_failed_partitions()?;

            let batch = self.poll_once(current_timeout)?;
            self.ctx.last_polled.store(Instant::now());

            if starting_up {
                current_timeout = poll_timeout;
                starting_up = false;
                self.ctx.state.store(TaskState::Running);
                self.ctx.started.open();
            }

            if batch.is_empty() {
                continue;
            }

            let read_instant = Instant::now();
            let read_time_ms = epoch_ms();

            self.record_polled_positions(&batch);
            self.translate_and_send_batch(&batch, read_time_ms)?;
            self.track_events_progress(batch.count());

            if read_instant.elapsed() > self.ctx.config.processing_delay_threshold {
                self.delayed_batch_count += 1;
                warn!(
                    "Processing a batch of {} records for {} took longer than {:?} ({} so far)",
                    batch.count(),
                    self.ctx.task_name,
                    self.ctx.config.processing_delay_threshold,
                    self.delayed_batch_count,
                );
            }

            if !self.ctx.stop_requested() {
                self.maybe_commit(false)?;
            }
        }

        Ok(())
    }

    fn poll_once(&mut self, timeout: Duration) -> Result<RecordBatch, TaskError> {
        let poll_started = Instant::now();

        match self.adapter.poll(timeout) {
            Ok(batch) => {
                let poll_duration = poll_started.elapsed();
                if poll_duration > timeout + POLL_BUFFER_TIME {
                    self.slow_poll_count += 1;
                    warn!(
                        "Task {}: poll took {:?} (> poll timeout {:?} + buffer {:?})",
                        self.ctx.task_name, poll_duration, timeout, POLL_BUFFER_TIME,
                    );
                }
                Ok(batch)
            }
            Err(SourceError::NoOffsetForPartition(partitions)) => {
                info!(
                    "Poll reported no committed offset for partitions {:?}",
                    partitions
                );
                if !self.ctx.stop_requested() {
                    self.seek_to_start_position(&partitions)?;
                }
                Ok(RecordBatch::new())
            }
            Err(SourceError::OffsetOutOfRange(partitions)) => {
                warn!("Consumed offsets out of range: {:?}", partitions);
                self.adapter.handle_offset_out_of_range(&partitions);
                Ok(RecordBatch::new())
            }
            Err(SourceError::Wakeup) => {
                debug!("Poll woken, shutdown in progress");
                Ok(RecordBatch::new())
            }
            Err(SourceError::Closed) => Err(TaskError::SourceClosed),
            Err(err) => {
                warn!(
                    "Poll failed, sleeping for {:?} and retrying: {}",
                    self.ctx.config.retry_sleep, err
                );
                self.ctx.interruptible_sleep(self.ctx.config.retry_sleep);
                Ok(RecordBatch::new())
            }
        }
    }

    fn translate_and_send_batch(
        &mut self,
        batch: &RecordBatch,
        read_time_ms: i64,
    ) -> Result<(), TaskError> {
        let mut enqueue_pause_update = false;

        // one partition at a time, so a failing partition cannot stall the
        // others
        'partitions: for tp in batch.partitions() {
            for record in batch.records(tp) {
                if self.partition_has_failed_delivery(tp) {
                    // recovery runs at the top of the next loop iteration
                    continue 'partitions;
                }

                match self.send_with_retries(record, read_time_ms) {
                    SendOutcome::Sent => {}
                    SendOutcome::Stopping => return Ok(()),
                    SendOutcome::Fatal(err) => return Err(err),
                    SendOutcome::Exhausted(err) => {
                        error!(
                            "Sending {} failed after {} attempts: {}",
                            record, self.ctx.config.max_retry_count, err
                        );
                        self.seek_to_last_checkpoint(std::slice::from_ref(tp))?;
                        if self.ctx.config.pause_partition_on_error {
                            warn!("Adding {} to the auto-pause set", tp);
                            self.ctx.pause.auto_pause(
                                tp.clone(),
                                PauseEntry::until_elapsed(
                                    PauseReason::SendError,
                                    self.ctx.config.pause_error_duration,
                                ),
                            );
                            enqueue_pause_update = true;
                        }
                        continue 'partitions;
                    }
                }
            }
        }

        if enqueue_pause_update {
            self.ctx.updates.push(TaskUpdate::PauseResumePartitions);
        }

        Ok(())
    }

    fn send_with_retries(&self, record: &crate::source::Record, read_time_ms: i64) -> SendOutcome {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let produced = match self.translator.translate(record, read_time_ms) {
                Ok(produced) => produced,
                Err(err) => return SendOutcome::Fatal(err.into()),
            };

            let result = match &self.ctx.tracker {
                Some(tracker) => tracker.send(
                    produced,
                    record.topic(),
                    record.partition(),
                    record.offset(),
                ),
                None => self.ctx.producer.send(produced, Box::new(|_| {})),
            };

            match result {
                Ok(()) => {
                    self.check_flow_control(record);
                    return SendOutcome::Sent;
                }
                Err(SendError::Closed) => {
                    return SendOutcome::Fatal(TaskError::Producer(SendError::Closed))
                }
                Err(err) => {
                    error!("Error sending {}: {}", record, err);
                    if self.ctx.stop_requested() {
                        return SendOutcome::Stopping;
                    }
                    if attempts >= self.ctx.config.max_retry_count {
                        return SendOutcome::Exhausted(err);
                    }
                    warn!(
                        "Sleeping for {:?} before retrying, attempt {} of {}",
                        self.ctx.config.retry_sleep, attempts, self.ctx.config.max_retry_count
                    );
                    if self.ctx.interruptible_sleep(self.ctx.config.retry_sleep) {
                        return SendOutcome::Stopping;
                    }
                }
            }
        }
    }

    fn check_flow_control(&self, record: &crate::source::Record) {
        if !self.ctx.config.flow_control_enabled {
            return;
        }
        let Some(tracker) = &self.ctx.tracker else {
            return;
        };

        let in_flight = tracker.in_flight_count(record.topic(), record.partition()) as u64;
        if in_flight <= self.ctx.config.max_in_flight_messages_threshold {
            return;
        }

        let tp = record.source_partition();
        warn!(
            "In-flight count {} for {} exceeded maxInFlightMessagesThreshold {}; pausing",
            in_flight, tp, self.ctx.config.max_in_flight_messages_threshold
        );

        let probe_tracker = tracker.clone();
        let topic = record.topic().to_owned();
        let partition = record.partition();
        let min_in_flight = self.ctx.config.min_in_flight_messages_threshold;
        self.ctx.pause.auto_pause(
            tp,
            PauseEntry::with_predicate(PauseReason::ExceededMaxInFlight, move || {
                probe_tracker.in_flight_count(&topic, partition) as u64 <= min_in_flight
            }),
        );
        self.ctx.updates.push(TaskUpdate::PauseResumePartitions);
    }

    fn partition_has_failed_delivery(&self, tp: &SourcePartition) -> bool {
        self.ctx
            .tracker
            .as_ref()
            .is_some_and(|tracker| tracker.has_failed(tp))
    }

    /// Apply the send-error recovery to partitions whose asynchronous
    /// delivery acks failed terminally since the last check.
    fn recover_failed_partitions(&mut self) -> Result<(), TaskError> {
        let Some(tracker) = &self.ctx.tracker else {
            return Ok(());
        };

        let failed = tracker.take_failed_partitions();
        if failed.is_empty() {
            return Ok(());
        }

        error!(
            "Delivery failures reported for {:?}; rewinding to last checkpoints",
            failed
        );
        self.seek_to_last_checkpoint(&failed)?;

        if self.ctx.config.pause_partition_on_error {
            for tp in failed {
                self.ctx.pause.auto_pause(
                    tp,
                    PauseEntry::until_elapsed(
                        PauseReason::SendError,
                        self.ctx.config.pause_error_duration,
                    ),
                );
            }
            self.ctx.updates.push(TaskUpdate::PauseResumePartitions);
        }

        Ok(())
    }

    fn drain_task_updates(&mut self) -> Result<(), TaskError> {
        while let Some(update) = self.ctx.updates.pop() {
            match update {
                TaskUpdate::PauseResumePartitions => self.apply_pause_update()?,
            }
        }
        Ok(())
    }

    fn apply_pause_update(&mut self) -> Result<(), TaskError> {
        let assigned = match self.adapter.assignment() {
            Ok(assigned) => assigned,
            Err(SourceError::Closed) => return Err(TaskError::SourceClosed),
            Err(err) => {
                warn!("Could not read assignment while reconciling pauses: {}", err);
                return Ok(());
            }
        };

        let currently_paused = match self.adapter.paused() {
            Ok(paused) => paused,
            Err(SourceError::Closed) => return Err(TaskError::SourceClosed),
            Err(err) => {
                warn!("Could not read paused set while reconciling pauses: {}", err);
                return Ok(());
            }
        };

        let desired = self.ctx.pause.reconcile(&assigned);

        debug!(
            "Task {}: assignment {:?}, currently paused {:?}, desired {:?}",
            self.ctx.task_name, assigned, currently_paused, desired
        );

        // resume everything, then pause the full desired set
        if let Err(err) = self.adapter.resume(&currently_paused) {
            warn!("Resume during pause reconciliation failed: {}", err);
            return Ok(());
        }

        let desired_list: Vec<SourcePartition> = desired.iter().cloned().collect();
        if let Err(err) = self.adapter.pause(&desired_list) {
            warn!("Pause during pause reconciliation failed: {}", err);
            return Ok(());
        }

        if desired_list
            .iter()
            .any(|tp| !currently_paused.contains(tp))
        {
            info!(
                "Task {}: new pause list is {:?}",
                self.ctx.task_name, desired_list
            );
        }

        *self.ctx.assignment.lock() = assigned;
        Ok(())
    }

    fn maybe_commit(&mut self, force: bool) -> Result<(), TaskError> {
        let action = commit_action(
            self.ctx.tracker.is_some(),
            force,
            self.ctx.last_committed.load().elapsed(),
            self.ctx.config.offset_commit_interval,
        );

        match action {
            CommitAction::Skip => Ok(()),
            CommitAction::CommitSafe => {
                if let Err(err) = self.ctx.commit_safe_offsets(&*self.adapter) {
                    warn!("Committing safe offsets failed, will retry: {}", err);
                }
                Ok(())
            }
            CommitAction::FlushAndCommit => match self.ctx.flush_and_commit(&*self.adapter) {
                Ok(()) => Ok(()),
                Err(CommitFailure::Flush(err)) => {
                    // some deliveries in the flushed window failed; rewind
                    // every owned partition to its last checkpoint
                    warn!("Flush before commit failed: {}", err);
                    let assigned = self.adapter.assignment().unwrap_or_default();
                    self.seek_to_last_checkpoint(&assigned)?;
                    Ok(())
                }
                Err(CommitFailure::Commit(err)) => {
                    warn!("Offset commit failed, will retry: {}", err);
                    Ok(())
                }
            },
        }
    }

    fn seek_to_last_checkpoint(&mut self, partitions: &[SourcePartition]) -> Result<(), TaskError> {
        info!("Seeking to previous checkpoints for {:?}", partitions);

        let mut without_commit = Vec::new();
        for tp in partitions {
            match self.adapter.committed(tp) {
                Ok(Some(offset)) => {
                    if let Err(err) = self.adapter.seek(tp, offset) {
                        warn!("Seek to {} for {} failed: {}", offset, tp, err);
                    }
                }
                Ok(None) => without_commit.push(tp.clone()),
                Err(err) => warn!("Could not read committed offset for {}: {}", tp, err),
            }
        }

        if !without_commit.is_empty() {
            self.seek_to_start_position(&without_commit)?;
        }

        Ok(())
    }

    fn seek_to_start_position(&mut self, partitions: &[SourcePartition]) -> Result<(), TaskError> {
        let start_positions = self.ctx.datastream.lock().start_positions()?;

        match start_positions {
            Some(offsets) => {
                info!("Seeking to configured start positions: {:?}", offsets);
                for tp in partitions {
                    let offset =
                        offsets
                            .get(&tp.partition())
                            .ok_or_else(|| TaskError::MissingStartOffset {
                                partition: tp.clone(),
                            })?;
                    if let Err(err) = self.adapter.seek(tp, *offset) {
                        warn!("Seek to start position for {} failed: {}", tp, err);
                    }
                }
            }
            None => {
                let result = match self.ctx.config.auto_offset_reset {
                    OffsetReset::Earliest => {
                        info!("Seeking to beginning for partitions {:?}", partitions);
                        self.adapter.seek_to_beginning(partitions)
                    }
                    OffsetReset::Latest => {
                        info!("Seeking to end for partitions {:?}", partitions);
                        self.adapter.seek_to_end(partitions)
                    }
                };
                if let Err(err) = result {
                    warn!("Seek to reset position failed: {}", err);
                }
            }
        }

        Ok(())
    }

    fn record_polled_positions(&self, batch: &RecordBatch) {
        for tp in batch.partitions() {
            if let Some(record) = batch.records(tp).last() {
                self.ctx.positions.record_polled(tp, record.offset());
            }
        }
    }

    fn track_events_progress(&mut self, count: usize) {
        self.events_processed += count;
        let since_logged = self.events_logged_at.elapsed();
        if since_logged > EVENTS_PROGRESS_LOG_INTERVAL {
            info!(
                "Processed {} records in {} seconds for datastream {}",
                self.events_processed,
                since_logged.as_secs(),
                self.ctx.task_name,
            );
            self.events_processed = 0;
            self.events_logged_at = Instant::now();
        }
    }
}

enum SendOutcome {
    Sent,
    Exhausted(SendError),
    Stopping,
    Fatal(TaskError),
}

/// Assignment callbacks, invoked by the source adapter on the loop thread
/// from inside `poll`.
struct TaskListener {
    ctx: Arc<TaskContext>,
    readiness: Arc<dyn TopicReadiness>,
}

impl AssignmentListener for TaskListener {
    fn on_assigned(&self, adapter: &dyn AssignmentContext, partitions: &[SourcePartition]) {
        info!("Partition ownership assigned for {:?}", partitions);

        match adapter.assignment() {
            Ok(assigned) => *self.ctx.assignment.lock() = assigned,
            Err(_) => *self.ctx.assignment.lock() = partitions.to_vec(),
        }

        self.ctx.updates.push(TaskUpdate::PauseResumePartitions);

        let not_ready = self.readiness.on_assigned(partitions);
        if not_ready.is_empty() {
            return;
        }

        // pause inside the callback: the poll delivering this assignment
        // could otherwise already return records for these partitions
        info!("Destination not ready for {:?}; pausing", not_ready);
        if let Err(err) = adapter.pause(&not_ready) {
            error!("Pausing not-ready partitions failed: {}", err);
        }

        for tp in not_ready {
            let readiness = self.readiness.clone();
            let probe = tp.clone();
            self.ctx.pause.auto_pause(
                tp,
                PauseEntry::with_predicate(PauseReason::TopicNotReady, move || {
                    readiness.should_resume(&probe)
                }),
            );
        }
    }

    fn on_revoked(&self, adapter: &dyn AssignmentContext, partitions: &[SourcePartition]) {
        info!(
            "Partition ownership revoked for {:?}, checkpointing",
            partitions
        );

        // the final commit at shutdown covers the stopping case
        if !self.ctx.stop_requested() {
            if let Err(err) = self.ctx.flush_and_commit(adapter) {
                warn!("Commit during revoke failed: {}", err);
            }
        }

        {
            let mut assignment = self.ctx.assignment.lock();
            assignment.retain(|tp| !partitions.contains(tp));
            self.ctx.pause.retain_assigned(&assignment);
        }

        self.ctx.updates.push(TaskUpdate::PauseResumePartitions);
        self.readiness.on_revoked(partitions);
    }
}

/// Cloneable external view of a running task, held by the supervisor and the
/// diagnostics surface.
#[derive(Clone)]
pub struct TaskHandle {
    ctx: Arc<TaskContext>,
}

impl TaskHandle {
    pub fn task_name(&self) -> String {
        self.ctx.task_name.clone()
    }

    pub fn state(&self) -> TaskState {
        self.ctx.state.load()
    }

    /// Request a cooperative stop. Idempotent; safe from any thread.
    pub fn stop(&self) {
        self.ctx.request_stop();
    }

    pub fn await_start(&self, timeout: Duration) -> bool {
        self.ctx.started.wait_timeout(timeout)
    }

    pub fn await_stop(&self, timeout: Duration) -> bool {
        self.ctx.stopped.wait_timeout(timeout)
    }

    pub fn last_polled(&self) -> Instant {
        self.ctx.last_polled.load()
    }

    pub fn datastream(&self) -> Datastream {
        self.ctx.datastream.lock().clone()
    }

    /// Swap in a fresh datastream snapshot after a definition update. Only a
    /// change to the paused partitions schedules work for the loop; a
    /// malformed pause config is rejected and the previous state kept.
    pub fn update_datastream(&self, datastream: Datastream) -> Result<(), MetadataError> {
        let manual_paused = datastream.paused_source_partitions()?;

        *self.ctx.datastream.lock() = datastream;

        if self.ctx.pause.set_manual(manual_paused) {
            info!(
                "Paused partitions changed for {}; scheduling an update",
                self.ctx.task_name
            );
            self.ctx.updates.push(TaskUpdate::PauseResumePartitions);
        }

        Ok(())
    }

    pub fn datastream_state(&self) -> DatastreamStateResponse {
        let in_flight = self
            .ctx
            .tracker
            .as_ref()
            .map(|tracker| tracker.in_flight_message_counts())
            .unwrap_or_default();

        DatastreamStateResponse::new(
            self.ctx.task_name.clone(),
            self.ctx.pause.auto_paused_snapshot(),
            self.ctx.pause.manual_snapshot(),
            self.ctx.assignment.lock().clone(),
            in_flight,
        )
    }

    pub fn positions(&self) -> Vec<PositionEntry> {
        let datastream = self.ctx.datastream.lock();
        self.ctx
            .positions
            .entries(datastream.name(), datastream.group_id())
    }
}

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::datastream::PAUSED_SOURCE_PARTITIONS;
    use crate::message::metadata;
    use crate::task::readiness::NoOpTopicReadiness;
    use crate::task::translate::MirrorTranslator;
    use crate::testutil::{
        mirror_datastream, record, tp, wait_until, MockProducer, MockSourceAdapter,
        MockSourceState, SeekTarget,
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    struct RunningTask {
        handle: TaskHandle,
        thread: std::thread::JoinHandle<()>,
        source: Arc<MockSourceState>,
        producer: Arc<MockProducer>,
    }

    impl RunningTask {
        fn shutdown(self) {
            self.handle.stop();
            assert!(self.handle.await_stop(WAIT));
            self.thread.join().unwrap();
        }
    }

    fn fast_config() -> TaskConfig {
        TaskConfig {
            offset_commit_interval: Duration::from_millis(10),
            retry_sleep: Duration::from_millis(1),
            max_retry_count: 2,
            ..Default::default()
        }
    }

    fn flushless_config() -> TaskConfig {
        TaskConfig {
            flushless_mode: true,
            ..fast_config()
        }
    }

    fn start_task(
        datastream: Datastream,
        config: TaskConfig,
        producer: Arc<MockProducer>,
        readiness: Arc<dyn TopicReadiness>,
    ) -> RunningTask {
        let source = Arc::new(MockSourceState::default());
        let adapter = MockSourceAdapter::new(source.clone());
        let translator = MirrorTranslator::from_datastream(&datastream).unwrap();

        let task = ConnectorTask::new(
            datastream,
            config,
            Box::new(adapter),
            producer.clone(),
            Box::new(translator),
            readiness,
        )
        .unwrap();

        let handle = task.handle();
        let thread = std::thread::spawn(move || task.run());
        assert!(handle.await_start(WAIT));

        RunningTask {
            handle,
            thread,
            source,
            producer,
        }
    }

    fn checkpoints_for(task: &RunningTask, prefix: &str) -> Vec<String> {
        task.producer
            .checkpoints()
            .into_iter()
            .filter(|checkpoint| checkpoint.starts_with(prefix))
            .collect()
    }

    #[test]
    fn mirrors_records_from_three_topics() {
        let producer = Arc::new(MockProducer::default());
        let task = start_task(
            mirror_datastream("mirror"),
            fast_config(),
            producer,
            Arc::new(NoOpTopicReadiness),
        );

        task.source
            .push_assign(vec![tp("A", 0), tp("B", 0), tp("C", 0)]);
        task.source
            .push_batch(vec![record("A", 0, 0), record("B", 0, 0), record("C", 0, 0)]);

        wait_until("three records sent", WAIT, || task.producer.sent_count() == 3);

        let sends = task.producer.sends();
        let destinations: BTreeSet<String> =
            sends.iter().map(|send| send.destination.clone()).collect();
        assert_eq!(
            destinations,
            BTreeSet::from([
                "kafka://dest:9092/A".to_owned(),
                "kafka://dest:9092/B".to_owned(),
                "kafka://dest:9092/C".to_owned(),
            ])
        );

        for send in &sends {
            let origin_topic = &send.metadata[metadata::ORIGIN_TOPIC];
            assert_eq!(send.destination, format!("kafka://dest:9092/{origin_topic}"));
            assert_eq!(send.metadata[metadata::ORIGIN_PARTITION], "0");
            assert_eq!(send.metadata[metadata::ORIGIN_OFFSET], "0");
            assert!(send.metadata.contains_key(metadata::EVENT_TIMESTAMP));
            assert_eq!(send.partition, None);
        }

        task.shutdown();
    }

    #[test]
    fn wildcard_pause_config_applies_to_the_assignment() {
        let datastream = mirror_datastream("mirror")
            .with_metadata(PAUSED_SOURCE_PARTITIONS, r#"{"A": ["*"], "B": ["0"]}"#);
        let task = start_task(
            datastream,
            fast_config(),
            Arc::new(MockProducer::default()),
            Arc::new(NoOpTopicReadiness),
        );

        task.source
            .push_assign(vec![tp("A", 0), tp("B", 0), tp("B", 1)]);

        wait_until("pause reconciled onto the adapter", WAIT, || {
            task.source.paused_set() == BTreeSet::from([tp("A", 0), tp("B", 0)])
        });

        task.shutdown();
    }

    #[test]
    fn send_failure_pauses_the_partition_and_spares_the_rest() {
        let producer = Arc::new(MockProducer::default());
        producer.fail_send_for("A-0-2");

        let task = start_task(
            mirror_datastream("mirror"),
            fast_config(),
            producer,
            Arc::new(NoOpTopicReadiness),
        );

        task.source.push_assign(vec![tp("A", 0), tp("B", 0)]);
        task.source.push_batch(vec![
            record("A", 0, 0),
            record("A", 0, 1),
            record("A", 0, 2),
            record("A", 0, 3),
            record("A", 0, 4),
            record("B", 0, 0),
            record("B", 0, 1),
            record("B", 0, 2),
        ]);

        wait_until("partition A-0 auto-paused on the adapter", WAIT, || {
            task.source.paused_set().contains(&tp("A", 0))
        });

        // records before the failure went out, records after it did not
        assert_eq!(checkpoints_for(&task, "A-0-"), vec!["A-0-0", "A-0-1"]);
        // the healthy partition is untouched, in offset order
        assert_eq!(checkpoints_for(&task, "B-0-"), vec!["B-0-0", "B-0-1", "B-0-2"]);

        // no prior commit, so the failed partition rewound to the beginning
        assert!(task
            .source
            .seeks()
            .contains(&(tp("A", 0), SeekTarget::Beginning)));

        let state = task.handle.datastream_state();
        assert_eq!(
            state.auto_paused_partitions["A-0"].reason,
            PauseReason::SendError
        );

        task.shutdown();
    }

    #[test]
    fn manual_pause_overrides_auto_pause_and_clearing_it_resumes() {
        let producer = Arc::new(MockProducer::default());
        producer.fail_send_for("A-0-0");

        let task = start_task(
            mirror_datastream("mirror"),
            fast_config(),
            producer,
            Arc::new(NoOpTopicReadiness),
        );

        task.source.push_assign(vec![tp("A", 0)]);
        task.source.push_batch(vec![record("A", 0, 0)]);

        wait_until("partition auto-paused", WAIT, || {
            task.handle
                .datastream_state()
                .auto_paused_partitions
                .contains_key("A-0")
        });

        let manual = mirror_datastream("mirror")
            .with_metadata(PAUSED_SOURCE_PARTITIONS, r#"{"A": ["0"]}"#);
        task.handle.update_datastream(manual).unwrap();

        wait_until("manual entry replaces the auto entry", WAIT, || {
            let state = task.handle.datastream_state();
            state.auto_paused_partitions.is_empty()
                && state.manual_paused_partitions.contains_key("A")
        });
        assert!(task.source.paused_set().contains(&tp("A", 0)));

        task.handle
            .update_datastream(mirror_datastream("mirror"))
            .unwrap();

        wait_until("clearing the manual entry resumes", WAIT, || {
            task.source.paused_set().is_empty()
        });

        task.shutdown();
    }

    #[test]
    fn malformed_pause_update_is_rejected_and_state_kept() {
        let datastream = mirror_datastream("mirror")
            .with_metadata(PAUSED_SOURCE_PARTITIONS, r#"{"A": ["*"]}"#);
        let task = start_task(
            datastream,
            fast_config(),
            Arc::new(MockProducer::default()),
            Arc::new(NoOpTopicReadiness),
        );

        let bad = mirror_datastream("mirror").with_metadata(PAUSED_SOURCE_PARTITIONS, "not json");
        assert!(task.handle.update_datastream(bad).is_err());

        let state = task.handle.datastream_state();
        assert!(state.manual_paused_partitions.contains_key("A"));

        task.shutdown();
    }

    #[test]
    fn flushless_commits_only_contiguously_acknowledged_offsets() {
        let producer = Arc::new(MockProducer::holding());
        let task = start_task(
            mirror_datastream("mirror"),
            flushless_config(),
            producer,
            Arc::new(NoOpTopicReadiness),
        );

        task.source.push_assign(vec![tp("A", 0)]);
        task.source
            .push_batch((0..10).map(|offset| record("A", 0, offset)).collect());

        wait_until("all ten records sent", WAIT, || {
            task.producer.sent_count() == 10
        });

        let commits_for_a = |task: &RunningTask| -> Vec<i64> {
            task.source
                .commits()
                .iter()
                .filter_map(|commit| commit.get(&tp("A", 0)).copied())
                .collect()
        };

        // acks 0-2 arrive; the next soft commit may advance to offset 3
        for offset in ["A-0-0", "A-0-1", "A-0-2"] {
            task.producer.release(offset, Ok(()));
        }
        std::thread::sleep(Duration::from_millis(15));
        task.source.push_batch(vec![record("B", 0, 0)]);
        wait_until("commit at the first gap", WAIT, || {
            commits_for_a(&task).last() == Some(&3)
        });

        // 4 and 5 are acknowledged but 3 still holds the checkpoint back
        task.producer.release("A-0-4", Ok(()));
        task.producer.release("A-0-5", Ok(()));
        task.producer.release("A-0-3", Ok(()));
        std::thread::sleep(Duration::from_millis(15));
        task.source.push_batch(vec![record("B", 0, 1)]);
        wait_until("commit advances over the closed gap", WAIT, || {
            commits_for_a(&task).last() == Some(&6)
        });

        for offset in ["A-0-6", "A-0-7", "A-0-8", "A-0-9"] {
            task.producer.release(offset, Ok(()));
        }
        std::thread::sleep(Duration::from_millis(15));
        task.source.push_batch(vec![record("B", 0, 2)]);
        wait_until("commit reaches the end of the window", WAIT, || {
            commits_for_a(&task).last() == Some(&10)
        });

        // monotone and gap-free
        assert_eq!(commits_for_a(&task), vec![3, 6, 10]);

        task.shutdown();
    }

    #[test]
    fn flushless_async_delivery_failure_rewinds_and_pauses() {
        let producer = Arc::new(MockProducer::holding());
        let task = start_task(
            mirror_datastream("mirror"),
            flushless_config(),
            producer,
            Arc::new(NoOpTopicReadiness),
        );

        task.source.push_assign(vec![tp("A", 0)]);
        task.source
            .push_batch(vec![record("A", 0, 0), record("A", 0, 1)]);

        wait_until("both records sent", WAIT, || task.producer.sent_count() == 2);

        task.producer.release("A-0-0", Ok(()));
        task.producer.release(
            "A-0-1",
            Err(SendError::Delivery {
                destination: "kafka://dest:9092/A".to_owned(),
                message: "unknown partition".to_owned(),
            }),
        );

        wait_until("failed partition auto-paused", WAIT, || {
            task.handle
                .datastream_state()
                .auto_paused_partitions
                .contains_key("A-0")
        });
        assert!(task
            .source
            .seeks()
            .iter()
            .any(|(partition, _)| partition == &tp("A", 0)));

        task.shutdown();
    }

    #[test]
    fn flushful_commit_flushes_then_commits_consumed_positions() {
        let producer = Arc::new(MockProducer::default());
        let task = start_task(
            mirror_datastream("mirror"),
            fast_config(),
            producer,
            Arc::new(NoOpTopicReadiness),
        );

        task.source.push_assign(vec![tp("A", 0)]);
        std::thread::sleep(Duration::from_millis(15));
        task.source
            .push_batch(vec![record("A", 0, 0), record("A", 0, 1), record("A", 0, 2)]);

        wait_until("consumed positions committed", WAIT, || {
            task.source
                .commits()
                .iter()
                .any(|commit| commit.get(&tp("A", 0)) == Some(&3))
        });
        assert!(task.producer.flush_count() >= 1);

        task.shutdown();
    }

    #[test]
    fn flush_failure_rewinds_assigned_partitions_and_skips_the_commit() {
        let producer = Arc::new(MockProducer::holding());
        producer.fail_ack_for("A-0-1");

        let task = start_task(
            mirror_datastream("mirror"),
            fast_config(),
            producer,
            Arc::new(NoOpTopicReadiness),
        );

        task.source.push_assign(vec![tp("A", 0), tp("B", 0)]);
        task.source.set_committed(tp("A", 0), 1);
        std::thread::sleep(Duration::from_millis(15));
        task.source
            .push_batch(vec![record("A", 0, 1), record("A", 0, 2), record("B", 0, 0)]);

        // the flush before the commit reports the failed delivery, so every
        // assigned partition rewinds: A-0 to its checkpoint, B-0 (never
        // committed) to the beginning
        wait_until("all assigned partitions rewound", WAIT, || {
            let seeks = task.source.seeks();
            seeks.contains(&(tp("A", 0), SeekTarget::Offset(1)))
                && seeks.contains(&(tp("B", 0), SeekTarget::Beginning))
        });
        assert!(task.source.commits().is_empty());

        task.shutdown();
    }

    #[test]
    fn shutdown_commits_outstanding_progress() {
        let producer = Arc::new(MockProducer::default());
        let task = start_task(
            mirror_datastream("mirror"),
            // long commit interval, so only the final commit can cover it
            TaskConfig {
                offset_commit_interval: Duration::from_secs(600),
                ..fast_config()
            },
            producer,
            Arc::new(NoOpTopicReadiness),
        );

        task.source.push_assign(vec![tp("A", 0)]);
        task.source.push_batch(vec![record("A", 0, 0)]);
        wait_until("record sent", WAIT, || task.producer.sent_count() == 1);
        assert!(task.source.commits().is_empty());

        let source = task.source.clone();
        task.shutdown();

        let commits = source.commits();
        assert_eq!(commits.last().and_then(|c| c.get(&tp("A", 0))), Some(&1));
    }

    #[test]
    fn revoke_commits_and_prunes_auto_paused_partitions() {
        let producer = Arc::new(MockProducer::default());
        producer.fail_send_for("A-0-1");

        let task = start_task(
            mirror_datastream("mirror"),
            fast_config(),
            producer,
            Arc::new(NoOpTopicReadiness),
        );

        task.source.push_assign(vec![tp("A", 0), tp("B", 0)]);
        task.source.push_batch(vec![
            record("A", 0, 0),
            record("A", 0, 1),
            record("B", 0, 0),
        ]);

        wait_until("partition auto-paused", WAIT, || {
            task.handle
                .datastream_state()
                .auto_paused_partitions
                .contains_key("A-0")
        });

        task.source.push_revoke(vec![tp("A", 0)]);

        wait_until("auto-pause pruned to the surviving assignment", WAIT, || {
            task.handle
                .datastream_state()
                .auto_paused_partitions
                .is_empty()
        });
        // the revoke checkpointed inline
        wait_until("revoke committed progress", WAIT, || {
            !task.source.commits().is_empty()
        });

        task.shutdown();
    }

    #[test]
    fn stop_is_idempotent() {
        let task = start_task(
            mirror_datastream("mirror"),
            fast_config(),
            Arc::new(MockProducer::default()),
            Arc::new(NoOpTopicReadiness),
        );

        task.handle.stop();
        task.handle.stop();
        assert!(task.handle.await_stop(WAIT));
        task.thread.join().unwrap();
        assert_eq!(task.handle.state(), TaskState::Stopped);

        // stopping a stopped task changes nothing
        task.handle.stop();
        assert_eq!(task.handle.state(), TaskState::Stopped);
    }

    #[test]
    fn source_close_is_fatal_for_the_task() {
        let task = start_task(
            mirror_datastream("mirror"),
            fast_config(),
            Arc::new(MockProducer::default()),
            Arc::new(NoOpTopicReadiness),
        );

        task.source.push_error(SourceError::Closed);

        wait_until("task enters the error state", WAIT, || {
            task.handle.state() == TaskState::Error
        });
        assert!(task.handle.await_stop(WAIT));
        task.thread.join().unwrap();
    }

    #[test]
    fn transient_poll_errors_keep_the_loop_alive() {
        let task = start_task(
            mirror_datastream("mirror"),
            fast_config(),
            Arc::new(MockProducer::default()),
            Arc::new(NoOpTopicReadiness),
        );

        task.source.push_assign(vec![tp("A", 0)]);
        task.source
            .push_error(SourceError::transient("broker hiccup"));
        task.source.push_batch(vec![record("A", 0, 0)]);

        wait_until("record sent after the transient error", WAIT, || {
            task.producer.sent_count() == 1
        });

        task.shutdown();
    }

    #[test]
    fn no_offset_for_partition_seeks_start_position() {
        let datastream = mirror_datastream("mirror")
            .with_metadata(crate::datastream::START_POSITION, r#"{"0": 100}"#);
        let task = start_task(
            datastream,
            fast_config(),
            Arc::new(MockProducer::default()),
            Arc::new(NoOpTopicReadiness),
        );

        task.source.push_assign(vec![tp("A", 0)]);
        task.source
            .push_error(SourceError::NoOffsetForPartition(vec![tp("A", 0)]));

        wait_until("seeked to the configured start position", WAIT, || {
            task.source
                .seeks()
                .contains(&(tp("A", 0), SeekTarget::Offset(100)))
        });

        task.shutdown();
    }

    struct GatedReadiness {
        ready: AtomicBool,
    }

    impl TopicReadiness for GatedReadiness {
        fn on_assigned(&self, partitions: &[SourcePartition]) -> Vec<SourcePartition> {
            if self.ready.load(Ordering::SeqCst) {
                Vec::new()
            } else {
                partitions.to_vec()
            }
        }

        fn should_resume(&self, _partition: &SourcePartition) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn not_ready_destinations_pause_before_the_first_record() {
        let readiness = Arc::new(GatedReadiness {
            ready: AtomicBool::new(false),
        });
        let producer = Arc::new(MockProducer::default());
        let task = start_task(
            mirror_datastream("mirror"),
            fast_config(),
            producer,
            readiness.clone(),
        );

        // the batch rides the same poll as the assignment callback
        task.source.push_assign(vec![tp("A", 0)]);
        task.source.push_batch(vec![record("A", 0, 0)]);

        wait_until("partition paused inside the callback", WAIT, || {
            task.source.paused_set().contains(&tp("A", 0))
        });
        assert_eq!(task.producer.sent_count(), 0);
        assert_eq!(
            task.handle.datastream_state().auto_paused_partitions["A-0"].reason,
            PauseReason::TopicNotReady
        );

        readiness.ready.store(true, Ordering::SeqCst);
        wait_until("partition resumed once the topic is ready", WAIT, || {
            task.source.paused_set().is_empty()
        });

        task.source.push_batch(vec![record("A", 0, 0)]);
        wait_until("record flows after resume", WAIT, || {
            task.producer.sent_count() == 1
        });

        task.shutdown();
    }
}

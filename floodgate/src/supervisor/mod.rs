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

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::ConnectorConfig;
use crate::datastream::{Datastream, MetadataError};
use crate::diag::{DatastreamStateResponse, PositionEntry};
use crate::pause::PAUSE_ALL_PARTITIONS;
use crate::source::{PartitionInfo, SourceError};
use crate::task::{ConnectorTask, Latch, TaskError, TaskHandle};

/// Supervisor threads start no earlier than this past alignment, unless the
/// check interval itself is shorter.
const MIN_DAEMON_STARTUP_DELAY: Duration = Duration::from_secs(2 * 60);

/// Builds a fresh task instance for a datastream; invoked on initial
/// assignment and whenever a stalled task is replaced.
pub type TaskFactory = Box<dyn Fn(&Datastream) -> Result<ConnectorTask, TaskError> + Send + Sync>;

/// Validation failure for an operator-submitted datastream update. The
/// update is rejected and the previous state kept.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("cannot list partitions for topic {topic}: {source}")]
    PartitionLookup {
        topic: String,
        source: SourceError,
    },
}

/// Per-connector registry of running tasks.
///
/// Reacts to assignment changes by starting, refreshing and cancelling
/// tasks, and runs a liveness daemon that replaces any task whose thread
/// died or whose loop stopped polling.
pub struct TaskSupervisor {
    inner: Arc<SupervisorInner>,
    daemon: Mutex<Option<JoinHandle<()>>>,
    daemon_stop: Arc<Latch>,
}

struct SupervisorInner {
    connector: String,
    config: ConnectorConfig,
    factory: TaskFactory,
    running: DashMap<String, TaskHandle>,
    threads: DashMap<String, JoinHandle<()>>,
    thread_counter: AtomicUsize,
}

impl TaskSupervisor {
    pub fn new(
        connector: impl Into<String>,
        config: ConnectorConfig,
        factory: TaskFactory,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                connector: connector.into(),
                config,
                factory,
                running: DashMap::new(),
                threads: DashMap::new(),
                thread_counter: AtomicUsize::new(0),
            }),
            daemon: Mutex::new(None),
            daemon_stop: Arc::new(Latch::new()),
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    /// Start the liveness daemon. The initial delay is aligned to
    /// `daemonInterval` boundaries from the top of the hour so instances
    /// across hosts do not all check at once.
    pub fn start(&self) {
        let mut daemon = self.daemon.lock();
        if daemon.is_some() {
            return;
        }

        let inner = self.inner.clone();
        let stop = self.daemon_stop.clone();
        let interval = self.inner.config.daemon_interval;
        let initial_delay = daemon_start_delay(epoch_secs(), interval);

        let thread = std::thread::Builder::new()
            .name(format!("{} daemon thread", self.inner.connector))
            .spawn(move || {
                if stop.wait_timeout(initial_delay) {
                    return;
                }
                loop {
                    inner.check_tasks();
                    if stop.wait_timeout(interval) {
                        return;
                    }
                }
            });

        match thread {
            Ok(thread) => *daemon = Some(thread),
            Err(err) => error!("Failed to spawn supervisor daemon: {}", err),
        }
    }

    /// Apply a new task assignment: cancel tasks that are gone, refresh the
    /// snapshot of tasks that stay, create tasks that are new.
    pub fn on_assignment_change(&self, assigned: Vec<Datastream>) {
        self.inner.on_assignment_change(assigned);
    }

    /// Stop the daemon and every running task.
    pub fn stop(&self) {
        self.daemon_stop.open();
        if let Some(daemon) = self.daemon.lock().take() {
            let _ = daemon.join();
        }
        self.inner.stop_all();
    }

    pub fn datastream_state(&self, datastream: &str) -> Option<DatastreamStateResponse> {
        self.inner.datastream_state(datastream)
    }

    pub fn positions(&self) -> Vec<PositionEntry> {
        self.inner.positions()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.inner.task_names()
    }
}

impl SupervisorInner {
    fn on_assignment_change(&self, assigned: Vec<Datastream>) {
        info!(
            "onAssignmentChange called with datastreams {:?}",
            assigned.iter().map(Datastream::name).collect::<Vec<_>>()
        );

        let assigned_names: HashSet<&str> = assigned.iter().map(Datastream::name).collect();
        let to_cancel: Vec<String> = self
            .running
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|name| !assigned_names.contains(name.as_str()))
            .collect();

        for name in to_cancel {
            self.stop_task(&name);
        }

        for datastream in assigned {
            let name = datastream.name().to_owned();

            let existing = self
                .running
                .get(&name)
                .map(|entry| entry.value().clone());

            match existing {
                Some(handle) => {
                    // already running; swap in the fresh snapshot, which
                    // schedules a pause update only if that config changed
                    if let Err(err) = handle.update_datastream(datastream) {
                        warn!("Rejected datastream update for {}: {}", name, err);
                    }
                }
                None => self.create_task(datastream),
            }
        }
    }

    fn create_task(&self, datastream: Datastream) {
        let name = datastream.name().to_owned();
        info!("Creating task for {}", name);

        let task = match (self.factory)(&datastream) {
            Ok(task) => task,
            Err(err) => {
                error!("Failed to create task for {}: {}", name, err);
                return;
            }
        };

        let handle = task.handle();
        let thread_id = self.thread_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let thread = std::thread::Builder::new()
            .name(format!(
                "{} task thread {} {}",
                self.connector, name, thread_id
            ))
            .spawn(move || task.run());

        match thread {
            Ok(thread) => {
                self.running.insert(name.clone(), handle);
                self.threads.insert(name, thread);
            }
            Err(err) => error!("Failed to spawn task thread for {}: {}", name, err),
        }
    }

    /// Stop a task and wait up to `cancelTaskTimeout` for a clean exit. A
    /// thread cannot be interrupted, so on timeout the task is force-removed
    /// and its thread abandoned; the woken adapter lets the loop exit on its
    /// own once it regains control.
    fn stop_task(&self, name: &str) -> bool {
        let Some((_, handle)) = self.running.remove(name) else {
            return true;
        };

        handle.stop();
        let stopped = handle.await_stop(self.config.cancel_task_timeout);
        let thread = self.threads.remove(name).map(|(_, thread)| thread);

        if stopped {
            if let Some(thread) = thread {
                let _ = thread.join();
            }
        } else {
            warn!(
                "Task {} took longer than {:?} to stop; abandoning its thread",
                name, self.config.cancel_task_timeout
            );
        }

        stopped
    }

    fn check_tasks(&self) {
        if self.running.is_empty() {
            warn!("Connector {} has no datastream tasks yet", self.connector);
            return;
        }

        info!("Checking status of running connector tasks");
        let names: Vec<String> = self
            .running
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for name in names {
            self.restart_if_not_running(&name);
        }
    }

    fn restart_if_not_running(&self, name: &str) {
        let Some(handle) = self.running.get(name).map(|entry| entry.value().clone()) else {
            return;
        };

        if self.is_task_running(name, &handle) {
            return;
        }

        warn!(
            "Detected that the connector task for {} is not running; restarting it",
            name
        );
        let snapshot = handle.datastream();
        self.stop_task(name);
        self.create_task(snapshot);
    }

    /// A task is live iff its thread is alive and its loop polled recently.
    fn is_task_running(&self, name: &str, handle: &TaskHandle) -> bool {
        let thread_alive = self
            .threads
            .get(name)
            .map(|thread| !thread.is_finished())
            .unwrap_or(false);

        thread_alive && handle.last_polled().elapsed() < self.config.non_good_state_threshold
    }

    fn stop_all(&self) {
        let names: Vec<String> = self
            .running
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            self.stop_task(&name);
        }

        self.running.clear();
        self.threads.clear();
        info!("Connector {} stopped", self.connector);
    }

    fn datastream_state(&self, datastream: &str) -> Option<DatastreamStateResponse> {
        self.running
            .get(datastream)
            .map(|entry| entry.value().datastream_state())
    }

    fn positions(&self) -> Vec<PositionEntry> {
        self.running
            .iter()
            .flat_map(|entry| entry.value().positions())
            .collect()
    }

    fn task_names(&self) -> Vec<String> {
        self.running
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Validate an operator update to `pausedSourcePartitions` against the live
/// partition list: a `"*"` entry is inflated to the partitions known right
/// now, and unknown partitions are dropped. Partitions added to a topic
/// later stay unpaused until the next update revalidates the map.
pub fn validate_paused_partitions<F>(
    datastream: &mut Datastream,
    partitions_for: F,
) -> Result<(), ControlError>
where
    F: Fn(&str) -> Result<Vec<PartitionInfo>, SourceError>,
{
    let mut config = datastream.paused_source_partitions()?;

    for (topic, partitions) in config.iter_mut() {
        let known: BTreeSet<String> = partitions_for(topic)
            .map_err(|source| ControlError::PartitionLookup {
                topic: topic.clone(),
                source,
            })?
            .into_iter()
            .map(|info| info.partition().to_string())
            .collect();

        if partitions.contains(PAUSE_ALL_PARTITIONS) {
            *partitions = known;
        } else {
            partitions.retain(|partition| known.contains(partition));
        }
    }

    datastream.set_paused_source_partitions(&config)?;
    Ok(())
}

/// Delay until the next `interval` boundary aligned to the top of the hour,
/// at least `MIN_DAEMON_STARTUP_DELAY` (or the interval, whichever is
/// smaller) away. Hosts sharing a clock thus fire at roughly the same
/// moments, and a host starting at hh:59 waits for hh:05, not hh:00.
fn daemon_start_delay(now_epoch_secs: u64, interval: Duration) -> Duration {
    let interval_secs = interval.as_secs().max(1);
    let min_delay = MIN_DAEMON_STARTUP_DELAY.min(interval).as_secs();

    let mut next = now_epoch_secs - (now_epoch_secs % 3600);
    while next < now_epoch_secs || next - now_epoch_secs < min_delay {
        next += interval_secs;
    }

    Duration::from_secs(next - now_epoch_secs)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

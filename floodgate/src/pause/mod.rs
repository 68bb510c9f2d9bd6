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
use std::fmt::Display;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::partition::SourcePartition;

/// Pause-config entry meaning every partition of the topic.
pub const PAUSE_ALL_PARTITIONS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseReason {
    SendError,
    ExceededMaxInFlight,
    TopicNotReady,
    Manual,
}

impl Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendError => write!(f, "SEND_ERROR"),
            Self::ExceededMaxInFlight => write!(f, "EXCEEDED_MAX_IN_FLIGHT"),
            Self::TopicNotReady => write!(f, "TOPIC_NOT_READY"),
            Self::Manual => write!(f, "MANUAL"),
        }
    }
}

type ResumePredicate = Box<dyn Fn() -> bool + Send>;

/// Why a partition is paused and, for auto-pauses, when it may resume.
pub struct PauseEntry {
    reason: PauseReason,
    predicate: Option<ResumePredicate>,
    since: Instant,
}

impl PauseEntry {
    pub fn manual() -> Self {
        Self {
            reason: PauseReason::Manual,
            predicate: None,
            since: Instant::now(),
        }
    }

    pub fn with_predicate(
        reason: PauseReason,
        predicate: impl Fn() -> bool + Send + 'static,
    ) -> Self {
        Self {
            reason,
            predicate: Some(Box::new(predicate)),
            since: Instant::now(),
        }
    }

    /// An entry that expires once `duration` has passed since it was
    /// created, the recovery used for send-error pauses.
    pub fn until_elapsed(reason: PauseReason, duration: std::time::Duration) -> Self {
        let since = Instant::now();
        Self {
            reason,
            predicate: Some(Box::new(move || since.elapsed() >= duration)),
            since,
        }
    }

    pub fn reason(&self) -> PauseReason {
        self.reason
    }

    pub fn since(&self) -> Instant {
        self.since
    }

    pub fn should_resume(&self) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(),
            None => false,
        }
    }
}

impl std::fmt::Debug for PauseEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseEntry")
            .field("reason", &self.reason)
            .field("since", &self.since)
            .finish()
    }
}

/// Pause state for one task: the operator-configured map and the partitions
/// the task paused on its own. Pure state; the task loop applies the result
/// of [`reconcile`](PauseController::reconcile) to the adapter.
#[derive(Default)]
pub struct PauseController {
    manual: Mutex<HashMap<String, BTreeSet<String>>>,
    auto: Mutex<HashMap<SourcePartition, PauseEntry>>,
}

impl PauseController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the operator pause map. Returns true when the new map differs
    /// from the previous one.
    pub fn set_manual(&self, config: HashMap<String, BTreeSet<String>>) -> bool {
        let mut manual = self.manual.lock();
        if *manual == config {
            return false;
        }
        *manual = config;
        true
    }

    pub fn manual_snapshot(&self) -> HashMap<String, BTreeSet<String>> {
        self.manual.lock().clone()
    }

    pub fn auto_pause(&self, partition: SourcePartition, entry: PauseEntry) {
        self.auto.lock().insert(partition, entry);
    }

    pub fn auto_paused_snapshot(&self) -> HashMap<SourcePartition, PauseReason> {
        self.auto
            .lock()
            .iter()
            .map(|(tp, entry)| (tp.clone(), entry.reason()))
            .collect()
    }

    pub fn is_auto_paused(&self, partition: &SourcePartition) -> bool {
        self.auto.lock().contains_key(partition)
    }

    /// Fast pre-poll probe: does any auto entry's resume predicate fire?
    /// When it does, the caller schedules a reconciliation.
    pub fn has_resumable_entries(&self) -> bool {
        self.auto.lock().values().any(PauseEntry::should_resume)
    }

    /// Prune auto entries to the given assignment, the revoke-time cleanup
    /// that keeps the auto set a subset of owned partitions.
    pub fn retain_assigned(&self, assigned: &[SourcePartition]) {
        self.auto.lock().retain(|tp, _| assigned.contains(tp));
    }

    /// Compute the set of partitions that should be paused right now: the
    /// union of manual and auto pauses restricted to `assigned`. Auto
    /// entries whose resume predicate fires are dropped, as are entries for
    /// partitions no longer assigned. A partition present in both maps is
    /// left to the manual config alone.
    pub fn reconcile(&self, assigned: &[SourcePartition]) -> BTreeSet<SourcePartition> {
        let manual = self.manual.lock();
        let mut auto = self.auto.lock();

        auto.retain(|tp, entry| assigned.contains(tp) && !entry.should_resume());

        let mut to_pause = BTreeSet::new();
        for tp in assigned {
            if manual_contains(&manual, tp) {
                to_pause.insert(tp.clone());
                // manual config wins over an auto entry for the same partition
                auto.remove(tp);
            } else if auto.contains_key(tp) {
                to_pause.insert(tp.clone());
            }
        }

        to_pause
    }
}

fn manual_contains(config: &HashMap<String, BTreeSet<String>>, tp: &SourcePartition) -> bool {
    match config.get(tp.topic()) {
        Some(partitions) => {
            partitions.contains(PAUSE_ALL_PARTITIONS)
                || partitions.contains(tp.partition().to_string().as_str())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn tp(topic: &str, partition: i32) -> SourcePartition {
        SourcePartition::new(topic, partition)
    }

    fn manual_map(entries: &[(&str, &[&str])]) -> HashMap<String, BTreeSet<String>> {
        entries
            .iter()
            .map(|(topic, partitions)| {
                (
                    (*topic).to_owned(),
                    partitions.iter().map(|p| (*p).to_owned()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn wildcard_pauses_every_assigned_partition_of_topic() {
        let controller = PauseController::new();
        controller.set_manual(manual_map(&[("A", &["*"]), ("B", &["0"])]));

        let assigned = vec![tp("A", 0), tp("B", 0), tp("B", 1)];
        let paused = controller.reconcile(&assigned);

        assert_eq!(paused, BTreeSet::from([tp("A", 0), tp("B", 0)]));
    }

    #[test]
    fn auto_entries_resume_when_predicate_fires() {
        let controller = PauseController::new();
        let resume = Arc::new(AtomicBool::new(false));

        let flag = resume.clone();
        controller.auto_pause(
            tp("A", 0),
            PauseEntry::with_predicate(PauseReason::ExceededMaxInFlight, move || {
                flag.load(Ordering::SeqCst)
            }),
        );

        let assigned = vec![tp("A", 0)];
        assert_eq!(controller.reconcile(&assigned).len(), 1);

        resume.store(true, Ordering::SeqCst);
        assert!(controller.reconcile(&assigned).is_empty());
        assert!(!controller.is_auto_paused(&tp("A", 0)));
    }

    #[test]
    fn manual_config_wins_over_auto_entry() {
        let controller = PauseController::new();
        controller.auto_pause(
            tp("A", 0),
            PauseEntry::until_elapsed(PauseReason::SendError, Duration::from_secs(600)),
        );
        controller.set_manual(manual_map(&[("A", &["0"])]));

        let paused = controller.reconcile(&[tp("A", 0)]);
        assert_eq!(paused, BTreeSet::from([tp("A", 0)]));
        // the auto entry is dropped, so clearing the manual config resumes
        assert!(!controller.is_auto_paused(&tp("A", 0)));

        controller.set_manual(HashMap::new());
        assert!(controller.reconcile(&[tp("A", 0)]).is_empty());
    }

    #[test]
    fn unassigned_partitions_are_dropped() {
        let controller = PauseController::new();
        controller.auto_pause(
            tp("A", 0),
            PauseEntry::until_elapsed(PauseReason::SendError, Duration::from_secs(600)),
        );
        controller.auto_pause(
            tp("A", 1),
            PauseEntry::until_elapsed(PauseReason::SendError, Duration::from_secs(600)),
        );

        controller.retain_assigned(&[tp("A", 1)]);
        assert!(!controller.is_auto_paused(&tp("A", 0)));
        assert!(controller.is_auto_paused(&tp("A", 1)));
    }

    #[test]
    fn set_manual_reports_changes_only() {
        let controller = PauseController::new();
        assert!(controller.set_manual(manual_map(&[("A", &["*"])])));
        assert!(!controller.set_manual(manual_map(&[("A", &["*"])])));
        assert!(controller.set_manual(HashMap::new()));
    }

    #[test]
    fn send_error_pause_expires_after_duration() {
        let entry = PauseEntry::until_elapsed(PauseReason::SendError, Duration::ZERO);
        assert!(entry.should_resume());

        let entry = PauseEntry::until_elapsed(PauseReason::SendError, Duration::from_secs(600));
        assert!(!entry.should_resume());

        assert!(!PauseEntry::manual().should_resume());
    }
}

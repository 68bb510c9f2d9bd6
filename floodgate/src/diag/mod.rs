use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::partition::SourcePartition;
use crate::pause::PauseReason;

/// Read-only pause/assignment state of one datastream, keyed the way the
/// diagnostics surface expects it:
///
/// ```json
/// {"datastream":"PizzaDatastream",
///  "autoPausedPartitions":{"SaltyPizza-6":{"reason":"SEND_ERROR"}},
///  "manualPausedPartitions":{"YummyPizza":["19"]},
///  "assignment":["SaltyPizza-6","YummyPizza-19"],
///  "inFlightMessageCounts":{"SaltyPizza-6":42}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastreamStateResponse {
    pub datastream: String,
    pub auto_paused_partitions: BTreeMap<String, PausedPartitionInfo>,
    pub manual_paused_partitions: BTreeMap<String, BTreeSet<String>>,
    pub assignment: BTreeSet<String>,
    pub in_flight_message_counts: BTreeMap<String, usize>,
}

impl DatastreamStateResponse {
    pub fn new(
        datastream: impl Into<String>,
        auto_paused: HashMap<SourcePartition, PauseReason>,
        manual_paused: HashMap<String, BTreeSet<String>>,
        assignment: Vec<SourcePartition>,
        in_flight: HashMap<SourcePartition, usize>,
    ) -> Self {
        Self {
            datastream: datastream.into(),
            auto_paused_partitions: auto_paused
                .into_iter()
                .map(|(tp, reason)| (tp.to_string(), PausedPartitionInfo { reason }))
                .collect(),
            manual_paused_partitions: manual_paused.into_iter().collect(),
            assignment: assignment.iter().map(SourcePartition::to_string).collect(),
            in_flight_message_counts: in_flight
                .into_iter()
                .map(|(tp, count)| (tp.to_string(), count))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PausedPartitionInfo {
    pub reason: PauseReason,
}

/// Identifies the partition a position entry describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionKey {
    pub datastream: String,
    pub consumer_group: String,
    pub topic: String,
    pub partition: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionValue {
    pub committed_offset: Option<i64>,
    pub last_polled_offset: Option<i64>,
    pub last_poll_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEntry {
    pub key: PositionKey,
    pub value: PositionValue,
}

/// Per-partition progress as observed by one task, fed by the poll loop and
/// the commit path.
#[derive(Debug, Default)]
pub struct PositionTracker {
    positions: DashMap<SourcePartition, PositionValue>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_polled(&self, partition: &SourcePartition, offset: i64) {
        let mut entry = self.positions.entry(partition.clone()).or_default();
        entry.last_polled_offset = Some(offset);
        entry.last_poll_time_ms = Some(epoch_ms());
    }

    pub fn record_committed(&self, partition: &SourcePartition, offset: i64) {
        self.positions
            .entry(partition.clone())
            .or_default()
            .committed_offset = Some(offset);
    }

    /// Flushful commits cover everything polled so far: the committed offset
    /// becomes the next offset to consume for every tracked partition.
    pub fn commit_polled(&self) {
        for mut entry in self.positions.iter_mut() {
            if let Some(polled) = entry.last_polled_offset {
                entry.committed_offset = Some(polled + 1);
            }
        }
    }

    pub fn entries(&self, datastream: &str, consumer_group: &str) -> Vec<PositionEntry> {
        let mut entries: Vec<_> = self
            .positions
            .iter()
            .map(|item| PositionEntry {
                key: PositionKey {
                    datastream: datastream.to_owned(),
                    consumer_group: consumer_group.to_owned(),
                    topic: item.key().topic().to_owned(),
                    partition: item.key().partition(),
                },
                value: *item.value(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.key.topic, a.key.partition).cmp(&(&b.key.topic, b.key.partition)));
        entries
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Fold per-host diagnostics responses into one JSON object keyed by host
/// name, the aggregation shape used when a fleet of instances is queried.
pub fn aggregate_by_host<T: Serialize>(
    responses: &HashMap<String, T>,
) -> Result<serde_json::Value, serde_json::Error> {
    let mut aggregated = serde_json::Map::new();
    for (host, response) in responses {
        aggregated.insert(host.clone(), serde_json::to_value(response)?);
    }
    Ok(serde_json::Value::Object(aggregated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_response_serializes_with_partition_keys() {
        let mut auto = HashMap::new();
        auto.insert(
            SourcePartition::new("SaltyPizza", 6),
            PauseReason::SendError,
        );

        let response = DatastreamStateResponse::new(
            "PizzaDatastream",
            auto,
            HashMap::new(),
            vec![SourcePartition::new("SaltyPizza", 6)],
            HashMap::new(),
        );

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json["autoPausedPartitions"]["SaltyPizza-6"]["reason"],
            "SEND_ERROR"
        );
        assert_eq!(json["assignment"][0], "SaltyPizza-6");
    }

    #[test]
    fn tracker_reports_sorted_entries() {
        let tracker = PositionTracker::new();
        tracker.record_polled(&SourcePartition::new("B", 0), 10);
        tracker.record_polled(&SourcePartition::new("A", 1), 5);
        tracker.record_committed(&SourcePartition::new("A", 1), 6);

        let entries = tracker.entries("stream", "group");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key.topic, "A");
        assert_eq!(entries[0].value.committed_offset, Some(6));
        assert_eq!(entries[1].value.last_polled_offset, Some(10));
    }

    #[test]
    fn commit_polled_advances_to_next_offset() {
        let tracker = PositionTracker::new();
        tracker.record_polled(&SourcePartition::new("A", 0), 41);
        tracker.commit_polled();

        let entries = tracker.entries("stream", "group");
        assert_eq!(entries[0].value.committed_offset, Some(42));
    }

    #[test]
    fn aggregation_keys_by_host() {
        let mut responses = HashMap::new();
        responses.insert("host-1".to_owned(), vec![1, 2]);
        responses.insert("host-2".to_owned(), vec![3]);

        let value = aggregate_by_host(&responses).unwrap();
        assert_eq!(value["host-1"][1], 2);
        assert_eq!(value["host-2"][0], 3);
    }
}

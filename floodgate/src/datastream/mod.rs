use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

pub mod connection;

pub use connection::{ConnectionString, ConnectionStringError};

/// Metadata key holding the operator-configured paused partitions, as a JSON
/// object of `topic -> [partitionId | "*"]`.
pub const PAUSED_SOURCE_PARTITIONS: &str = "pausedSourcePartitions";

/// Metadata key holding explicit start offsets, as a JSON object of
/// `partitionId -> offset`. Consulted when no committed offset exists.
pub const START_POSITION: &str = "startPosition";

/// Metadata key overriding the derived consumer group identifier.
pub const GROUP_ID: &str = "groupId";

/// Metadata key enabling identity partitioning (destination partition equals
/// source partition).
pub const IDENTITY_PARTITIONING: &str = "identityPartitioning";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatastreamStatus {
    #[display(fmt = "READY")]
    Ready,
    #[display(fmt = "PAUSED")]
    Paused,
    #[display(fmt = "STOPPED")]
    Stopped,
    #[display(fmt = "ERROR")]
    Error,
}

/// Read-only snapshot of a datastream definition as held by a task. The
/// supervisor swaps a fresh snapshot in when the definition changes; the task
/// never writes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datastream {
    name: String,
    connector: String,
    source: String,
    destination: String,
    status: DatastreamStatus,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl Datastream {
    pub fn new(
        name: impl Into<String>,
        connector: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            connector: connector.into(),
            source: source.into(),
            destination: destination.into(),
            status: DatastreamStatus::Ready,
            metadata: HashMap::new(),
        }
    }

    pub fn with_status(mut self, status: DatastreamStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn status(&self) -> DatastreamStatus {
        self.status
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// The consumer group identifier for tasks of this datastream:
    /// `metadata.groupId` when present, else the datastream name.
    pub fn group_id(&self) -> &str {
        self.metadata
            .get(GROUP_ID)
            .map(String::as_str)
            .unwrap_or(&self.name)
    }

    pub fn identity_partitioning(&self) -> bool {
        self.metadata
            .get(IDENTITY_PARTITIONING)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// Parse the operator pause configuration. Absent metadata is an empty
    /// map; malformed JSON is an error so the caller can keep the previous
    /// state.
    pub fn paused_source_partitions(
        &self,
    ) -> Result<HashMap<String, BTreeSet<String>>, MetadataError> {
        match self.metadata.get(PAUSED_SOURCE_PARTITIONS) {
            None => Ok(HashMap::new()),
            Some(raw) => serde_json::from_str(raw).map_err(|source| MetadataError::InvalidJson {
                key: PAUSED_SOURCE_PARTITIONS,
                source,
            }),
        }
    }

    /// Replace the pause configuration, leaving every other metadata key
    /// untouched.
    pub fn set_paused_source_partitions(
        &mut self,
        partitions: &HashMap<String, BTreeSet<String>>,
    ) -> Result<(), MetadataError> {
        let raw =
            serde_json::to_string(partitions).map_err(|source| MetadataError::InvalidJson {
                key: PAUSED_SOURCE_PARTITIONS,
                source,
            })?;
        self.metadata
            .insert(PAUSED_SOURCE_PARTITIONS.to_owned(), raw);
        Ok(())
    }

    /// Parse the explicit start offsets, keyed by partition id.
    pub fn start_positions(&self) -> Result<Option<HashMap<i32, i64>>, MetadataError> {
        let Some(raw) = self.metadata.get(START_POSITION) else {
            return Ok(None);
        };

        let by_partition: HashMap<String, i64> =
            serde_json::from_str(raw).map_err(|source| MetadataError::InvalidJson {
                key: START_POSITION,
                source,
            })?;

        let mut positions = HashMap::with_capacity(by_partition.len());
        for (partition, offset) in by_partition {
            let partition = partition
                .parse()
                .map_err(|_| MetadataError::InvalidPartitionId { value: partition })?;
            positions.insert(partition, offset);
        }

        Ok(Some(positions))
    }

    pub fn source_connection(&self) -> Result<ConnectionString, ConnectionStringError> {
        self.source.parse()
    }

    pub fn destination_connection(&self) -> Result<ConnectionString, ConnectionStringError> {
        self.destination.parse()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata key {key} holds invalid JSON: {source}")]
    InvalidJson {
        key: &'static str,
        source: serde_json::Error,
    },
    #[error("invalid partition id in metadata: {value}")]
    InvalidPartitionId { value: String },
}

use crate::partition::SourcePartition;

/// Hook consulted when partitions are assigned, letting an implementation
/// hold back consumption until the matching destination topic exists.
///
/// `on_assigned` runs inside the assignment callback, before the poll that
/// delivered the callback returns any records, so a partition it reports as
/// not ready is paused before its first record can be consumed.
pub trait TopicReadiness: Send + Sync {
    /// Returns the subset of `partitions` whose destination is not ready
    /// yet. Each is auto-paused until [`should_resume`](Self::should_resume)
    /// reports true.
    fn on_assigned(&self, partitions: &[SourcePartition]) -> Vec<SourcePartition> {
        let _ = partitions;
        Vec::new()
    }

    fn should_resume(&self, partition: &SourcePartition) -> bool {
        let _ = partition;
        true
    }

    fn on_revoked(&self, partitions: &[SourcePartition]) {
        let _ = partitions;
    }

    fn stop(&self) {}
}

/// Default readiness hook: every destination is always ready.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpTopicReadiness;

impl TopicReadiness for NoOpTopicReadiness {}

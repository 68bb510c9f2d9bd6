use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Source checkpoint carried by every producer record in mirror mode.
///
/// Serialized as `{topic}-{partition}-{offset}`. Topics may themselves
/// contain `-`, so parsing splits from the right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorCheckpoint {
    topic: String,
    partition: i32,
    offset: i64,
}

impl MirrorCheckpoint {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
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
}

impl Display for MirrorCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.topic, self.partition, self.offset)
    }
}

impl FromStr for MirrorCheckpoint {
    type Err = CheckpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.rsplitn(3, '-');

        let offset = fields.next().ok_or_else(|| malformed(s))?;
        let partition = fields.next().ok_or_else(|| malformed(s))?;
        let topic = fields.next().ok_or_else(|| malformed(s))?;

        if topic.is_empty() {
            return Err(malformed(s));
        }

        Ok(Self {
            topic: topic.to_owned(),
            partition: partition.parse().map_err(|_| malformed(s))?,
            offset: offset.parse().map_err(|_| malformed(s))?,
        })
    }
}

/// Source checkpoint for single-topic mode, serialized as
/// `{partition}-{offset}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicCheckpoint {
    partition: i32,
    offset: i64,
}

impl TopicCheckpoint {
    pub fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl Display for TopicCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.partition, self.offset)
    }
}

impl FromStr for TopicCheckpoint {
    type Err = CheckpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split('-').collect();

        let [partition, offset] = fields.as_slice() else {
            return Err(malformed(s));
        };

        Ok(Self {
            partition: partition.parse().map_err(|_| malformed(s))?,
            offset: offset.parse().map_err(|_| malformed(s))?,
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckpointParseError {
    #[error("malformed checkpoint token: {token}")]
    Malformed { token: String },
}

fn malformed(token: &str) -> CheckpointParseError {
    CheckpointParseError::Malformed {
        token: token.to_owned(),
    }
}

/// What the task loop should do at a commit opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    Skip,
    /// Commit the tracker's safe offsets without flushing the producer.
    CommitSafe,
    /// Flush the producer, then commit.
    FlushAndCommit,
}

/// Pure commit decision. A hard commit always flushes; a soft commit only
/// fires once the commit interval has elapsed, and in flushless mode it
/// commits safe offsets without touching the producer.
pub fn commit_action(
    flushless: bool,
    force: bool,
    since_last_commit: Duration,
    commit_interval: Duration,
) -> CommitAction {
    if force {
        return CommitAction::FlushAndCommit;
    }

    if since_last_commit <= commit_interval {
        return CommitAction::Skip;
    }

    if flushless {
        CommitAction::CommitSafe
    } else {
        CommitAction::FlushAndCommit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_checkpoint_round_trips() {
        let checkpoint = MirrorCheckpoint::new("YummyPizza", 3, 42);
        let parsed: MirrorCheckpoint = checkpoint.to_string().parse().unwrap();
        assert_eq!(parsed, checkpoint);
    }

    #[test]
    fn mirror_checkpoint_topic_may_contain_dashes() {
        let parsed: MirrorCheckpoint = "change-of-address-7-1234".parse().unwrap();
        assert_eq!(parsed.topic(), "change-of-address");
        assert_eq!(parsed.partition(), 7);
        assert_eq!(parsed.offset(), 1234);
    }

    #[test]
    fn mirror_checkpoint_rejects_missing_fields() {
        assert!("7-1234".parse::<MirrorCheckpoint>().is_err());
        assert!("1234".parse::<MirrorCheckpoint>().is_err());
        assert!("".parse::<MirrorCheckpoint>().is_err());
    }

    #[test]
    fn topic_checkpoint_rejects_extra_fields() {
        assert!("topic-7-1234".parse::<TopicCheckpoint>().is_err());
        assert_eq!(
            "7-1234".parse::<TopicCheckpoint>().unwrap(),
            TopicCheckpoint::new(7, 1234)
        );
    }

    #[test]
    fn soft_commit_waits_for_the_interval() {
        let interval = Duration::from_secs(60);
        assert_eq!(
            commit_action(false, false, Duration::from_secs(1), interval),
            CommitAction::Skip
        );
        assert_eq!(
            commit_action(false, false, Duration::from_secs(61), interval),
            CommitAction::FlushAndCommit
        );
        assert_eq!(
            commit_action(true, false, Duration::from_secs(61), interval),
            CommitAction::CommitSafe
        );
    }

    #[test]
    fn hard_commit_always_flushes() {
        let interval = Duration::from_secs(60);
        assert_eq!(
            commit_action(true, true, Duration::ZERO, interval),
            CommitAction::FlushAndCommit
        );
    }
}

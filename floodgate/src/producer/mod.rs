use crate::message::ProducerRecord;

pub mod kafka;

/// Callback invoked exactly once per submitted record, with success or a
/// terminal failure. May fire on a different thread than the sender.
pub type AckCallback = Box<dyn FnOnce(Result<(), SendError>) + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// The transport cannot accept the record right now; the caller may
    /// retry.
    #[error("transient send failure to {destination}: {message}")]
    Transient {
        destination: String,
        message: String,
    },
    /// The destination rejected the record terminally.
    #[error("terminal delivery failure to {destination}: {message}")]
    Delivery {
        destination: String,
        message: String,
    },
    #[error("{failures} deliveries failed terminally since the last flush")]
    FlushFailures { failures: usize },
    #[error("producer handle is closed")]
    Closed,
    #[error("record destination is malformed: {message}")]
    Destination { message: String },
}

/// Contract for the transport producer. Thread-safe; the tracker may invoke
/// `send` from the task loop while delivery acks arrive concurrently.
///
/// Internal transport retries are the implementation's concern. Once `ack`
/// reports a failure, the runtime counts the record as terminally failed.
pub trait ProducerHandle: Send + Sync {
    /// Schedule delivery of `record`. `ack` fires exactly once when the
    /// record is durably accepted or terminally rejected.
    fn send(&self, record: ProducerRecord, ack: AckCallback) -> Result<(), SendError>;

    /// Block until every previously submitted record is terminally
    /// acknowledged. Reports an error if any delivery since the previous
    /// flush failed.
    fn flush(&self) -> Result<(), SendError>;
}

use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::Offset;

/// One (stream, partition) shard as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamPartition {
    stream: String,
    partition: i32,
}

impl StreamPartition {
    pub fn new(stream: String, partition: i32) -> Self {
        Self { stream, partition }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl From<TopicPartitionListElem<'_>> for StreamPartition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// The unit of assignment handed to the broker: where to resume one shard.
/// `Offset::Invalid` means "resume from the stored commit, or the configured
/// reset policy if none".
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPartitionOffset {
    pub stream: String,
    pub partition: i32,
    pub offset: Offset,
}

impl StreamPartitionOffset {
    pub fn new(stream: impl Into<String>, partition: i32, offset: Offset) -> Self {
        Self {
            stream: stream.into(),
            partition,
            offset,
        }
    }

    pub fn resume_from_committed(stream: impl Into<String>, partition: i32) -> Self {
        Self::new(stream, partition, Offset::Invalid)
    }
}

/// An owned record detached from the broker's buffers, as queued for a
/// processor host. Keys are carried but unused by the core.
#[derive(Debug, Clone)]
pub struct Record {
    pub stream: String,
    pub partition: i32,
    pub offset: i64,
    /// Broker timestamp in milliseconds since epoch, when available
    pub timestamp: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        Self {
            stream: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            timestamp: msg.timestamp().to_millis(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
        }
    }

    #[cfg(test)]
    pub fn new_for_test(stream: &str, partition: i32, offset: i64, payload: &[u8]) -> Self {
        Self {
            stream: stream.to_string(),
            partition,
            offset,
            timestamp: None,
            key: None,
            payload: payload.to_vec(),
        }
    }
}

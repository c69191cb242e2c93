//! Kafka merged-stream metadata used by the HTTP-Kafka proxies.

use bytes::Bytes;

/// Offset sentinel meaning "only records produced from now on".
pub const OFFSET_LIVE: i64 = -1;
/// Offset sentinel meaning "from the earliest retained record".
pub const OFFSET_HISTORICAL: i64 = -2;

/// Whether a merged stream reads from or writes to the topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KafkaCapabilities {
    #[default]
    FetchOnly,
    ProduceOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KafkaAckMode {
    None,
    LeaderOnly,
    #[default]
    InSyncReplicas,
}

/// Position within one partition of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KafkaPartitionOffset {
    pub partition_id: i32,
    pub partition_offset: i64,
    pub stable_offset: i64,
    pub latest_offset: i64,
}

impl KafkaPartitionOffset {
    pub fn new(partition_id: i32, partition_offset: i64) -> Self {
        Self {
            partition_id,
            partition_offset,
            stable_offset: OFFSET_LIVE,
            latest_offset: OFFSET_LIVE,
        }
    }

    /// All partitions, from the earliest offset.
    pub fn historical() -> Self {
        Self::new(-1, OFFSET_HISTORICAL)
    }

    /// Partition chosen by the broker, used when producing.
    pub fn any() -> Self {
        Self::new(-1, OFFSET_LIVE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaHeader {
    pub name: String,
    pub value: Bytes,
}

impl KafkaHeader {
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaCondition {
    Key(Bytes),
    Header { name: String, value: Bytes },
}

/// Records pass a filter when every condition matches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KafkaFilter {
    pub conditions: Vec<KafkaCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KafkaBeginEx {
    pub capabilities: KafkaCapabilities,
    pub topic: String,
    pub partitions: Vec<KafkaPartitionOffset>,
    pub filters: Vec<KafkaFilter>,
    pub ack_mode: KafkaAckMode,
}

/// Record metadata for the first DATA frame of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaDataEx {
    /// Value bytes still to follow in later DATA frames.
    pub deferred: u32,
    pub timestamp: i64,
    pub partition: KafkaPartitionOffset,
    /// Merged progress across all partitions after this record.
    pub progress: Vec<KafkaPartitionOffset>,
    pub key: Option<Bytes>,
    pub headers: Vec<KafkaHeader>,
}

impl Default for KafkaDataEx {
    fn default() -> Self {
        Self {
            deferred: 0,
            timestamp: 0,
            partition: KafkaPartitionOffset::any(),
            progress: Vec::new(),
            key: None,
            headers: Vec::new(),
        }
    }
}

impl KafkaDataEx {
    pub fn header(&self, name: &str) -> Option<&KafkaHeader> {
        self.headers.iter().find(|h| h.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KafkaFlushEx {
    pub progress: Vec<KafkaPartitionOffset>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_exact() {
        let ex = KafkaDataEx {
            headers: vec![KafkaHeader::new("content-type", "text/plain")],
            ..KafkaDataEx::default()
        };
        assert_eq!(
            ex.header("content-type").and_then(|h| h.value_str()),
            Some("text/plain")
        );
        assert!(ex.header("Content-Type").is_none());
    }

    #[test]
    fn historical_targets_every_partition() {
        let p = KafkaPartitionOffset::historical();
        assert_eq!(p.partition_id, -1);
        assert_eq!(p.partition_offset, OFFSET_HISTORICAL);
    }
}

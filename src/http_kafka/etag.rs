//! Etags carrying fetch progress.
//!
//! An etag is the URL-safe base64 (padded) encoding of a version byte, a
//! partition count and one `(partition id, offset)` entry per partition, all
//! little-endian. Decoding never fails loudly: anything malformed is simply
//! no etag at all.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};

use crate::ext::kafka::{OFFSET_HISTORICAL, OFFSET_LIVE};
use crate::ext::KafkaPartitionOffset;

const ETAG_V1: u8 = 1;
const V1_HEADER: usize = 1 + 4;
const V1_ENTRY: usize = 4 + 8;

/// Etag of the next offset to fetch on every partition.
pub fn encode(progress: &[KafkaPartitionOffset]) -> String {
    encode_with(progress, |p| p.partition_offset)
}

/// Etag of the latest offset seen on every partition.
pub fn encode_latest(progress: &[KafkaPartitionOffset]) -> String {
    encode_with(progress, |p| p.latest_offset)
}

fn encode_with(progress: &[KafkaPartitionOffset], offset: impl Fn(&KafkaPartitionOffset) -> i64) -> String {
    let partitions: Vec<_> = progress.iter().filter(|p| p.partition_id >= 0).collect();
    let mut raw = BytesMut::with_capacity(V1_HEADER + partitions.len() * V1_ENTRY);
    raw.put_u8(ETAG_V1);
    raw.put_u32_le(partitions.len() as u32);
    for partition in partitions {
        raw.put_i32_le(partition.partition_id);
        raw.put_i64_le(offset(partition));
    }
    URL_SAFE.encode(&raw)
}

/// Resume a live fetch after the encoded offsets.
pub fn decode_live(etag: &str) -> Option<Vec<KafkaPartitionOffset>> {
    decode_with(etag, |id, offset| KafkaPartitionOffset {
        partition_id: id,
        partition_offset: offset,
        stable_offset: OFFSET_LIVE,
        latest_offset: OFFSET_LIVE,
    })
}

/// Resume a historical fetch from the encoded offsets.
pub fn decode_historical(etag: &str) -> Option<Vec<KafkaPartitionOffset>> {
    decode_with(etag, |id, offset| KafkaPartitionOffset {
        partition_id: id,
        partition_offset: offset,
        stable_offset: OFFSET_HISTORICAL,
        latest_offset: OFFSET_HISTORICAL,
    })
}

/// Offsets from an [`encode_latest`] etag, for comparing merged snapshots.
pub fn decode_latest(etag: &str) -> Option<Vec<KafkaPartitionOffset>> {
    decode_with(etag, |id, offset| KafkaPartitionOffset {
        partition_id: id,
        partition_offset: 0,
        stable_offset: offset,
        latest_offset: offset,
    })
}

fn decode_with(
    etag: &str,
    partition: impl Fn(i32, i64) -> KafkaPartitionOffset,
) -> Option<Vec<KafkaPartitionOffset>> {
    if !well_formed(etag) {
        return None;
    }
    let raw = URL_SAFE.decode(etag).ok()?;
    let mut buf = raw.as_slice();
    if buf.remaining() < V1_HEADER || buf.get_u8() != ETAG_V1 {
        return None;
    }
    let count = buf.get_u32_le() as usize;
    if buf.remaining() != count.checked_mul(V1_ENTRY)? {
        return None;
    }
    let mut progress = Vec::with_capacity(count);
    for _ in 0..count {
        let id = buf.get_i32_le();
        let offset = buf.get_i64_le();
        progress.push(partition(id, offset));
    }
    Some(progress)
}

/// Split an `If-None-Match` or `If-Match` value into its progress etag and
/// the record etag that may follow a `/`.
pub fn split(value: &str) -> Option<(&str, Option<&str>)> {
    let (progress, record) = match value.split_once('/') {
        Some((progress, record)) => (progress, Some(record)),
        None => (value, None),
    };
    let valid = progress
        .bytes()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'-' | b'_' | b'='));
    (!progress.is_empty() && valid).then_some((progress, record))
}

/// Padded URL-safe alphabet, with padding only at the end.
fn well_formed(etag: &str) -> bool {
    if etag.len() % 4 != 0 {
        return false;
    }
    let mut padding = false;
    for c in etag.bytes() {
        match c {
            b'=' => padding = true,
            b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z' | b'-' | b'_' if !padding => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress() -> Vec<KafkaPartitionOffset> {
        vec![
            KafkaPartitionOffset::new(0, 17),
            KafkaPartitionOffset::new(1, 4),
            KafkaPartitionOffset::new(7, 0),
        ]
    }

    #[test]
    fn live_decode_restores_offsets() {
        let decoded = decode_live(&encode(&progress())).unwrap();
        assert_eq!(decoded, progress());
    }

    #[test]
    fn empty_progress_has_an_etag() {
        let etag = encode(&[]);
        assert_eq!(decode_live(&etag), Some(vec![]));
    }

    #[test]
    fn unassigned_partitions_are_skipped() {
        let mut with_any = progress();
        with_any.push(KafkaPartitionOffset::any());
        assert_eq!(encode(&with_any), encode(&progress()));
    }

    #[test]
    fn historical_and_latest_decodes() {
        let etag = encode(&progress());
        let historical = decode_historical(&etag).unwrap();
        assert_eq!(historical[0].partition_offset, 17);
        assert_eq!(historical[0].stable_offset, OFFSET_HISTORICAL);

        let mut snapshot = progress();
        snapshot[1].latest_offset = 99;
        let latest = decode_latest(&encode_latest(&snapshot)).unwrap();
        assert_eq!(latest[1].partition_offset, 0);
        assert_eq!(latest[1].latest_offset, 99);
        assert_eq!(latest[1].stable_offset, 99);
    }

    #[test]
    fn split_separates_record_etag() {
        assert_eq!(split("AQAAAAA=/rev-7"), Some(("AQAAAAA=", Some("rev-7"))));
        assert_eq!(split("AQAAAAA="), Some(("AQAAAAA=", None)));
        assert_eq!(split("\"quoted\""), None);
        assert_eq!(split("/rev"), None);
    }

    #[test]
    fn malformed_etags_are_absent() {
        let etag = encode(&progress());
        assert!(decode_live(&etag[1..]).is_none());
        assert!(decode_live("ab+/").is_none());
        assert!(decode_live("AQ==AAAA").is_none());
        assert!(decode_live("").is_none());
        // well formed base64 but not an etag
        assert!(decode_live("AAAA").is_none());
    }
}

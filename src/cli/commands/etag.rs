//! Etag encoding and decoding.

use crate::cli::args::{EtagAction, EtagArgs};
use crate::ext::KafkaPartitionOffset;
use crate::http_kafka::etag;
use anyhow::{anyhow, Context, Result};

pub fn run_etag(args: EtagArgs) -> Result<()> {
    match args.action {
        EtagAction::Encode { offsets } => {
            let progress = offsets
                .iter()
                .map(|pair| parse_offset(pair))
                .collect::<Result<Vec<_>>>()?;
            println!("{}", etag::encode(&progress));
        }
        EtagAction::Decode { etag: value } => {
            let (progress, _) =
                etag::split(&value).ok_or_else(|| anyhow!("malformed etag {value:?}"))?;
            let partitions =
                etag::decode_live(progress).ok_or_else(|| anyhow!("malformed etag {value:?}"))?;
            for partition in partitions {
                println!("{}:{}", partition.partition_id, partition.partition_offset);
            }
        }
    }
    Ok(())
}

fn parse_offset(pair: &str) -> Result<KafkaPartitionOffset> {
    let (partition, offset) = pair
        .split_once(':')
        .ok_or_else(|| anyhow!("expected partition:offset, got {pair:?}"))?;
    let partition = partition
        .parse()
        .with_context(|| format!("invalid partition in {pair:?}"))?;
    let offset = offset
        .parse()
        .with_context(|| format!("invalid offset in {pair:?}"))?;
    Ok(KafkaPartitionOffset::new(partition, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_parse_as_pairs() {
        assert_eq!(parse_offset("3:120").unwrap(), KafkaPartitionOffset::new(3, 120));
        assert!(parse_offset("3").is_err());
        assert!(parse_offset("x:1").is_err());
    }
}

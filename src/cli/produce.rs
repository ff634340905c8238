use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Args;

use crate::client::{partition::Compression, producer::Producer, Client};

#[derive(Debug, Args)]
pub struct ProduceArgs {
    /// topic to produce to
    pub topic: String,

    /// file whose whole content becomes the message value
    pub file: PathBuf,

    /// message key, messages without a key go to a random partition
    pub key: Option<String>,

    /// the level of acknowledgement reliability needed from the broker (0 none, 1 leader, -1 all replicas)
    #[arg(long = "request.required.acks", default_value_t = 1, allow_negative_numbers = true)]
    pub required_acks: i16,

    /// how long the broker may wait for the required acknowledgements
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// compression codec: none, gzip, snappy, lz4 or zstd
    #[arg(long, default_value = "none", value_parser = parse_compression)]
    pub compression: Compression,
}

fn parse_compression(s: &str) -> Result<Compression, String> {
    match s {
        "none" => Ok(Compression::NoCompression),
        #[cfg(feature = "compression-gzip")]
        "gzip" => Ok(Compression::Gzip),
        #[cfg(feature = "compression-snappy")]
        "snappy" => Ok(Compression::Snappy),
        #[cfg(feature = "compression-lz4")]
        "lz4" => Ok(Compression::Lz4),
        #[cfg(feature = "compression-zstd")]
        "zstd" => Ok(Compression::Zstd),
        other => Err(format!("unsupported compression \"{other}\"")),
    }
}

pub(super) async fn run(client: Arc<Client>, args: ProduceArgs) -> Result<ExitCode> {
    let value = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("cannot read {}", args.file.display()))?;

    let producer = Producer::new(client)
        .with_acks(args.required_acks)
        .with_timeout(args.timeout)
        .with_compression(args.compression);

    let (partition, offset) = producer
        .send(&args.topic, args.key.map(String::into_bytes), value)
        .await
        .with_context(|| format!("cannot produce to topic {}", args.topic))?;

    println!(
        "Sent to {}, partition: {}, offset: {}",
        args.topic, partition, offset
    );

    Ok(ExitCode::SUCCESS)
}

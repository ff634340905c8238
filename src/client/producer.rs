//! Single-record producer that picks partitions the way sarama's hash partitioner does.
//!
//! Keyed records always land on the same partition for a given partition count, so records written by this tool
//! and by sarama-based producers end up side by side.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use rand::prelude::*;
use tracing::debug;

use crate::{
    client::{
        error::{Error, Result},
        partition::Compression,
        Client,
    },
    record::Record,
};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32 bit FNV-1a.
fn fnv1a(data: &[u8]) -> u32 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Chooses the partition for a record.
///
/// Records with a key are hashed, records without one go to a random partition.
#[derive(Debug, Default, Clone, Copy)]
pub struct Partitioner;

impl Partitioner {
    /// Index into the partition list of a topic with `num_partitions` partitions.
    pub fn partition(&self, key: Option<&[u8]>, num_partitions: i32) -> i32 {
        if num_partitions <= 1 {
            return 0;
        }

        match key {
            // the hash is reinterpreted as a signed value before taking the remainder
            Some(key) => ((fnv1a(key) as i32) % num_partitions).abs(),
            None => thread_rng().gen_range(0..num_partitions),
        }
    }
}

/// Sends records one by one and waits for the broker to acknowledge each.
#[derive(Debug)]
pub struct Producer {
    client: Arc<Client>,
    partitioner: Partitioner,
    compression: Compression,
    acks: i16,
    timeout: Duration,
}

impl Producer {
    pub fn new(client: Arc<Client>) -> Self {
        Self {
            client,
            partitioner: Partitioner,
            compression: Compression::default(),
            acks: 1,
            timeout: Duration::from_secs(10),
        }
    }

    /// Acknowledgements to wait for: `0` none, `1` the leader, `-1` all in-sync replicas.
    pub fn with_acks(mut self, acks: i16) -> Self {
        self.acks = acks;
        self
    }

    /// How long the broker may wait for the requested acknowledgements.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Send one record and return its partition and offset.
    ///
    /// An empty key counts as no key. The offset is `-1` when no acknowledgement was requested.
    pub async fn send(
        &self,
        topic: &str,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
    ) -> Result<(i32, i64)> {
        let key = key.filter(|k| !k.is_empty());

        let partitions = self.client.partitions(topic).await?;
        let num_partitions = i32::try_from(partitions.len()).map_err(|_| {
            Error::InvalidResponse(format!("Too many partitions: {}", partitions.len()))
        })?;
        let index = self.partitioner.partition(key.as_deref(), num_partitions);
        let partition = usize::try_from(index)
            .ok()
            .and_then(|i| partitions.get(i).copied())
            .ok_or_else(|| {
                Error::InvalidResponse(format!("Topic \"{topic}\" has no partitions"))
            })?;

        debug!(topic, partition, "Sending record");

        let record = Record {
            key,
            value: Some(value),
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
        };

        let offsets = self
            .client
            .partition_client(topic, partition)
            .produce(vec![record], self.compression, self.acks, self.timeout)
            .await?;

        Ok((partition, offsets.first().copied().unwrap_or(-1)))
    }
}

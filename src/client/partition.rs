use std::{
    ops::{ControlFlow, Range},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::{
    backoff::{Backoff, BackoffConfig, ErrorOrThrottle},
    client::error::{Error, ProtocolError, RequestContext, Result},
    connection::{
        BrokerCache, BrokerCacheGeneration, BrokerConnection, BrokerConnector, MessengerTransport,
        MetadataLookupMode,
    },
    messenger::RequestError,
    protocol::{
        messages::{
            FetchRequest, FetchRequestPartition, FetchRequestTopic, FetchResponse,
            FetchResponsePartition, ListOffsetsRequest, ListOffsetsRequestPartition,
            ListOffsetsRequestTopic, ListOffsetsResponse, ListOffsetsResponsePartition,
            ProduceRequest, ProduceRequestPartitionData, ProduceRequestTopicData, ProduceResponse,
        },
        primitives::Records,
        record::{
            ControlBatchOrRecords, Record as ProtocolRecord, RecordBatch, RecordBatchCompression,
            RecordBatchTimestampType, RecordHeader,
        },
    },
    record::{Record, RecordAndOffset},
    throttle::maybe_throttle,
    validation::ExactlyOne,
};

/// Replica ID used by ordinary clients.
const NORMAL_CONSUMER: i32 = -1;

/// Outcome of [`PartitionClient::fetch_records`].
#[derive(Debug)]
pub struct FetchedRecords {
    /// Records at or after the requested offset, transaction markers excluded.
    pub records: Vec<RecordAndOffset>,

    /// Offset the next produced record will get.
    pub high_watermark: i64,

    /// Offset following the last batch of the response.
    ///
    /// `None` if not a single complete batch fit into the fetch size. This moves past control batches and batches
    /// emptied by compaction, which yield no records.
    pub next_offset: Option<i64>,
}

/// Compression applied to produced record batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    NoCompression,
    #[cfg(feature = "compression-gzip")]
    Gzip,
    #[cfg(feature = "compression-snappy")]
    Snappy,
    #[cfg(feature = "compression-lz4")]
    Lz4,
    #[cfg(feature = "compression-zstd")]
    Zstd,
}

impl From<Compression> for RecordBatchCompression {
    fn from(compression: Compression) -> Self {
        match compression {
            Compression::NoCompression => Self::NoCompression,
            #[cfg(feature = "compression-gzip")]
            Compression::Gzip => Self::Gzip,
            #[cfg(feature = "compression-snappy")]
            Compression::Snappy => Self::Snappy,
            #[cfg(feature = "compression-lz4")]
            Compression::Lz4 => Self::Lz4,
            #[cfg(feature = "compression-zstd")]
            Compression::Zstd => Self::Zstd,
        }
    }
}

/// Which type of offset should be requested by [`PartitionClient::get_offset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetAt {
    /// Earliest existing record.
    ///
    /// This is NOT the earliest produced record but the earliest record that is still kept, i.e. the offset might
    /// change if records are pruned by Kafka (retention policy) or if they are deleted.
    Earliest,

    /// The offset the next produced record will get.
    Latest,

    /// Offset of the first record with a timestamp at or after the given one.
    Timestamp(DateTime<Utc>),
}

impl OffsetAt {
    fn timestamp(self) -> i64 {
        match self {
            Self::Earliest => -2,
            Self::Latest => -1,
            Self::Timestamp(ts) => ts.timestamp_millis(),
        }
    }
}

/// Many operations must be performed on the leader for a partition
///
/// Additionally a partition is the unit of concurrency within Kafka
///
/// As such a [`PartitionClient`] is a dedicated connection to the leader of a partition, re-resolving the leader
/// whenever the connection breaks or the broker stops leading the partition.
#[derive(Debug)]
pub struct PartitionClient {
    topic: String,
    partition: i32,
    brokers: Arc<BrokerConnector>,

    backoff_config: Arc<BackoffConfig>,

    /// Current broker connection if any
    current_broker: Mutex<(Option<BrokerConnection>, BrokerCacheGeneration)>,
}

impl PartitionClient {
    pub(super) fn new(
        topic: String,
        partition: i32,
        brokers: Arc<BrokerConnector>,
        backoff_config: Arc<BackoffConfig>,
    ) -> Self {
        Self {
            topic,
            partition,
            brokers,
            backoff_config,
            current_broker: Mutex::new((None, BrokerCacheGeneration::START)),
        }
    }

    /// Topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Produce a batch of records to the partition.
    ///
    /// Returns the offsets of the records in order. With `acks = 0` the broker does not answer, so no offsets are
    /// known and the result is empty.
    pub async fn produce(
        &self,
        records: Vec<Record>,
        compression: Compression,
        acks: i16,
        timeout: Duration,
    ) -> Result<Vec<i64>> {
        if records.is_empty() {
            return Ok(vec![]);
        }

        let n = records.len() as i64;
        let request = &build_produce_request(
            self.partition,
            &self.topic,
            records,
            compression,
            acks,
            timeout,
        );

        maybe_retry(&self.backoff_config, self, "produce", || async move {
            let (broker, gen) = self
                .get()
                .await
                .map_err(|e| ErrorOrThrottle::Error((e, None)))?;

            if acks == 0 {
                broker
                    .send_only(request)
                    .await
                    .map_err(|e| ErrorOrThrottle::Error((e.into(), Some(gen))))?;
                return Ok(vec![]);
            }

            let response = broker
                .request(request)
                .await
                .map_err(|e| ErrorOrThrottle::Error((e.into(), Some(gen))))?;
            maybe_throttle(Some(response.throttle_time_ms))?;
            process_produce_response(self.partition, &self.topic, n, response)
                .map_err(|e| ErrorOrThrottle::Error((e, Some(gen))))
        })
        .await
    }

    /// Fetch `bytes` bytes of record data starting at sequence number `offset`
    ///
    /// Returns the records, the current high watermark and where the next fetch should continue.
    ///
    /// # Error Handling
    /// Fetching records outside the range known the to broker (marked by low and high watermark) will lead to a
    /// [`ServerError`](Error::ServerError) with [`OffsetOutOfRange`](ProtocolError::OffsetOutOfRange).
    pub async fn fetch_records(
        &self,
        offset: i64,
        bytes: Range<i32>,
        max_wait_ms: i32,
    ) -> Result<FetchedRecords> {
        let request = &build_fetch_request(offset, bytes, max_wait_ms, self.partition, &self.topic);

        let partition = maybe_retry(&self.backoff_config, self, "fetch_records", || async move {
            let (broker, gen) = self
                .get()
                .await
                .map_err(|e| ErrorOrThrottle::Error((e, None)))?;
            let response = broker
                .request(request)
                .await
                .map_err(|e| ErrorOrThrottle::Error((e.into(), Some(gen))))?;
            maybe_throttle(Some(response.throttle_time_ms))?;
            process_fetch_response(self.partition, &self.topic, response)
                .map_err(|e| ErrorOrThrottle::Error((e, Some(gen))))
        })
        .await?;

        let (records, next_offset) = extract_records(partition.records.0, offset)?;

        Ok(FetchedRecords {
            records,
            high_watermark: partition.high_watermark,
            next_offset: next_offset.filter(|next| *next > offset),
        })
    }

    /// Get offset for this partition.
    ///
    /// Note that the value returned by this method should be considered stale data, since:
    ///
    /// - **[`OffsetAt::Earliest`]:** Might be change at any time due to the Kafka retention policy or by
    ///   deleting records.
    /// - **[`OffsetAt::Latest`]:** Might be change at any time by producing records.
    pub async fn get_offset(&self, at: OffsetAt) -> Result<i64> {
        let request = &build_list_offsets_request(self.partition, &self.topic, at);

        let partition = maybe_retry(&self.backoff_config, self, "get_offset", || async move {
            let (broker, gen) = self
                .get()
                .await
                .map_err(|e| ErrorOrThrottle::Error((e, None)))?;
            let response = broker
                .request(request)
                .await
                .map_err(|e| ErrorOrThrottle::Error((e.into(), Some(gen))))?;
            maybe_throttle(response.throttle_time_ms)?;
            process_list_offsets_response(self.partition, &self.topic, response)
                .map_err(|e| ErrorOrThrottle::Error((e, Some(gen))))
        })
        .await?;

        Ok(partition.offset)
    }

    /// Retrieve the broker ID of the partition leader
    async fn get_leader(&self, metadata_mode: MetadataLookupMode) -> Result<i32> {
        let metadata = self
            .brokers
            .request_metadata(metadata_mode, Some(vec![self.topic.clone()]))
            .await?;

        let topic = metadata
            .topics
            .exactly_one()
            .map_err(Error::exactly_one_topic)?;

        if topic.name != self.topic {
            return Err(Error::InvalidResponse(format!(
                "Expected metadata for topic \"{}\" got \"{}\"",
                self.topic, topic.name
            )));
        }

        if let Some(e) = topic.error {
            return Err(Error::ServerError {
                protocol_error: e,
                error_message: None,
                request: RequestContext::Topic(self.topic.clone()),
                is_virtual: false,
            });
        }

        let partition = topic
            .partitions
            .into_iter()
            .find(|p| p.partition_index == self.partition)
            .ok_or_else(|| Error::ServerError {
                protocol_error: ProtocolError::UnknownTopicOrPartition,
                error_message: Some(format!(
                    "Partition {} not found in metadata response",
                    self.partition
                )),
                request: RequestContext::Partition(self.topic.clone(), self.partition),
                is_virtual: true,
            })?;

        if let Some(e) = partition.error {
            return Err(Error::ServerError {
                protocol_error: e,
                error_message: None,
                request: RequestContext::Partition(self.topic.clone(), self.partition),
                is_virtual: false,
            });
        }

        if partition.leader_id < 0 {
            return Err(Error::ServerError {
                protocol_error: ProtocolError::LeaderNotAvailable,
                error_message: Some("Partition has no leader".to_owned()),
                request: RequestContext::Partition(self.topic.clone(), self.partition),
                is_virtual: true,
            });
        }

        info!(
            topic=%self.topic,
            partition=%self.partition,
            leader=partition.leader_id,
            "Detected leader",
        );
        Ok(partition.leader_id)
    }
}

/// Caches the partition leader broker.
#[async_trait]
impl BrokerCache for &PartitionClient {
    type R = MessengerTransport;
    type E = Error;

    async fn get(&self) -> Result<(Arc<Self::R>, BrokerCacheGeneration)> {
        let mut current_broker = self.current_broker.lock().await;
        if let Some(broker) = &current_broker.0 {
            return Ok((Arc::clone(broker), current_broker.1));
        }

        info!(
            topic=%self.topic,
            partition=%self.partition,
            "Creating new partition-specific broker connection",
        );

        let leader = self
            .get_leader(MetadataLookupMode::CachedArbitrary)
            .await
            .inspect_err(|_| {
                self.brokers
                    .invalidate_metadata_cache("partition client: leader lookup failed")
            })?;

        let broker = self.brokers.connect(leader).await?.ok_or_else(|| {
            Error::InvalidResponse(format!(
                "Partition leader {leader} not found in metadata response"
            ))
        })?;

        current_broker.0 = Some(Arc::clone(&broker));
        current_broker.1.bump();

        Ok((broker, current_broker.1))
    }

    async fn invalidate(&self, reason: &'static str, gen: BrokerCacheGeneration) {
        let mut current_broker = self.current_broker.lock().await;

        if current_broker.1 != gen {
            // stale request
            debug!(
                reason,
                current_gen = current_broker.1.get(),
                request_gen = gen.get(),
                "stale invalidation request for partition leader cache",
            );
            return;
        }

        info!(
            topic = self.topic.as_str(),
            partition = self.partition,
            reason,
            "Invalidating cached leader",
        );
        current_broker.0 = None;
        self.brokers.invalidate_metadata_cache(reason);
    }
}

/// Takes a `request_name` and a function yielding a fallible future and handles certain classes of error.
///
/// Broken connections and leadership changes invalidate `broker_cache` and are retried, everything else is returned
/// to the caller.
async fn maybe_retry<B, R, F, T>(
    backoff_config: &BackoffConfig,
    broker_cache: B,
    request_name: &str,
    f: R,
) -> Result<T>
where
    B: BrokerCache,
    R: (Fn() -> F) + Send + Sync,
    F: std::future::Future<
            Output = Result<T, ErrorOrThrottle<(Error, Option<BrokerCacheGeneration>)>>,
        > + Send,
{
    let mut backoff = Backoff::new(backoff_config);

    backoff
        .retry_with_backoff(request_name, || async {
            let (error, cache_gen) = match f().await {
                Ok(v) => {
                    return ControlFlow::Break(Ok(v));
                }
                Err(ErrorOrThrottle::Throttle(throttle)) => {
                    return ControlFlow::Continue(ErrorOrThrottle::Throttle(throttle));
                }
                Err(ErrorOrThrottle::Error(e)) => e,
            };

            let invalidate_reason = match &error {
                Error::Request(RequestError::Poisoned(_) | RequestError::ConnectionClosed)
                | Error::Connection(_) => "partition client: connection broken",
                Error::ServerError {
                    protocol_error:
                        ProtocolError::NotLeaderOrFollower
                        | ProtocolError::LeaderNotAvailable
                        | ProtocolError::UnknownTopicOrPartition
                        | ProtocolError::RequestTimedOut,
                    ..
                } => "partition client: leader changed",
                _ => {
                    error!(
                        e=%error,
                        request_name,
                        "request encountered fatal error",
                    );
                    return ControlFlow::Break(Err(error));
                }
            };

            if let Some(cache_gen) = cache_gen {
                broker_cache.invalidate(invalidate_reason, cache_gen).await;
            }

            ControlFlow::Continue(ErrorOrThrottle::Error(error))
        })
        .await
        .map_err(Error::RetryFailed)?
}

fn build_produce_request(
    partition: i32,
    topic: &str,
    records: Vec<Record>,
    compression: Compression,
    acks: i16,
    timeout: Duration,
) -> ProduceRequest {
    let first_timestamp = records
        .iter()
        .map(|r| r.timestamp.timestamp_millis())
        .min()
        .unwrap_or_default();
    let max_timestamp = records
        .iter()
        .map(|r| r.timestamp.timestamp_millis())
        .max()
        .unwrap_or_default();

    let records: Vec<ProtocolRecord> = (0i32..)
        .zip(records)
        .map(|(offset_delta, record)| ProtocolRecord {
            timestamp_delta: record.timestamp.timestamp_millis() - first_timestamp,
            offset_delta,
            key: record.key,
            value: record.value,
            headers: record
                .headers
                .into_iter()
                .map(|(key, value)| RecordHeader { key, value })
                .collect(),
        })
        .collect();
    let last_offset_delta = records.last().map(|r| r.offset_delta).unwrap_or_default();

    let record_batch = RecordBatch {
        base_offset: 0,
        partition_leader_epoch: -1,
        last_offset_delta,
        first_timestamp,
        max_timestamp,
        producer_id: -1,
        producer_epoch: -1,
        base_sequence: -1,
        records: ControlBatchOrRecords::Records(records),
        compression: compression.into(),
        is_transactional: false,
        timestamp_type: RecordBatchTimestampType::CreateTime,
    };

    ProduceRequest {
        transactional_id: None,
        acks,
        timeout_ms: i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX),
        topic_data: vec![ProduceRequestTopicData {
            name: topic.to_string(),
            partition_data: vec![ProduceRequestPartitionData {
                index: partition,
                records: Records(vec![record_batch]),
            }],
        }],
    }
}

fn process_produce_response(
    partition: i32,
    topic: &str,
    num_records: i64,
    response: ProduceResponse,
) -> Result<Vec<i64>> {
    let response = response
        .responses
        .exactly_one()
        .map_err(Error::exactly_one_topic)?;

    if response.name != topic {
        return Err(Error::InvalidResponse(format!(
            "Expected write for topic \"{}\" got \"{}\"",
            topic, response.name,
        )));
    }

    let response = response
        .partition_responses
        .exactly_one()
        .map_err(Error::exactly_one_partition)?;

    if response.index != partition {
        return Err(Error::InvalidResponse(format!(
            "Expected partition {} for topic \"{}\" got {}",
            partition, topic, response.index,
        )));
    }

    match response.error {
        Some(e) => Err(Error::ServerError {
            protocol_error: e,
            error_message: None,
            request: RequestContext::Partition(topic.to_owned(), partition),
            is_virtual: false,
        }),
        None => Ok((0..num_records)
            .map(|x| x + response.base_offset)
            .collect()),
    }
}

fn build_fetch_request(
    offset: i64,
    bytes: Range<i32>,
    max_wait_ms: i32,
    partition: i32,
    topic: &str,
) -> FetchRequest {
    // `bytes.end` is exclusive
    let max_bytes = bytes.end.saturating_sub(1);

    FetchRequest {
        replica_id: NORMAL_CONSUMER,
        max_wait_ms,
        min_bytes: bytes.start,
        max_bytes: Some(max_bytes),
        isolation_level: None,
        topics: vec![FetchRequestTopic {
            topic: topic.to_string(),
            partitions: vec![FetchRequestPartition {
                partition,
                fetch_offset: offset,
                partition_max_bytes: max_bytes,
            }],
        }],
    }
}

fn process_fetch_response(
    partition: i32,
    topic: &str,
    response: FetchResponse,
) -> Result<FetchResponsePartition> {
    let response_topic = response
        .responses
        .exactly_one()
        .map_err(Error::exactly_one_topic)?;

    if response_topic.topic != topic {
        return Err(Error::InvalidResponse(format!(
            "Expected topic \"{}\" in fetch response, got \"{}\"",
            topic, response_topic.topic,
        )));
    }

    let response_partition = response_topic
        .partitions
        .exactly_one()
        .map_err(Error::exactly_one_partition)?;

    if response_partition.partition_index != partition {
        return Err(Error::InvalidResponse(format!(
            "Expected partition {} for topic \"{}\" in fetch response, got {}",
            partition, topic, response_partition.partition_index,
        )));
    }

    if let Some(err) = response_partition.error_code {
        return Err(Error::ServerError {
            protocol_error: err,
            error_message: None,
            request: RequestContext::Partition(topic.to_owned(), partition),
            is_virtual: false,
        });
    }

    Ok(response_partition)
}

/// User records at or after `request_offset`, plus the offset following the last batch.
fn extract_records(
    partition_records: Vec<RecordBatch>,
    request_offset: i64,
) -> Result<(Vec<RecordAndOffset>, Option<i64>)> {
    let mut records = vec![];
    let mut next_offset: Option<i64> = None;

    for batch in partition_records {
        let batch_end = batch.base_offset + i64::from(batch.last_offset_delta) + 1;
        next_offset = Some(next_offset.map_or(batch_end, |next| next.max(batch_end)));

        match batch.records {
            ControlBatchOrRecords::ControlBatch(_) => {
                // ignore
            }
            ControlBatchOrRecords::Records(protocol_records) => {
                let log_append_time = match batch.timestamp_type {
                    RecordBatchTimestampType::LogAppendTime => {
                        Some(parse_timestamp(batch.max_timestamp)?)
                    }
                    RecordBatchTimestampType::CreateTime => None,
                };

                records.reserve(protocol_records.len());

                for record in protocol_records {
                    let offset = batch.base_offset + i64::from(record.offset_delta);
                    if offset < request_offset {
                        // Kafka does not split record batches on the server side, so we need to do this filtering on
                        // the client side
                        continue;
                    }

                    let timestamp = parse_timestamp(batch.first_timestamp + record.timestamp_delta)?;

                    records.push(RecordAndOffset {
                        record: Record {
                            key: record.key,
                            value: record.value,
                            headers: record
                                .headers
                                .into_iter()
                                .map(|header| (header.key, header.value))
                                .collect(),
                            timestamp,
                        },
                        offset,
                        log_append_time,
                    })
                }
            }
        }
    }

    Ok((records, next_offset))
}

fn parse_timestamp(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::InvalidResponse(format!("Cannot parse timestamp: {millis}")))
}

fn build_list_offsets_request(partition: i32, topic: &str, at: OffsetAt) -> ListOffsetsRequest {
    ListOffsetsRequest {
        replica_id: NORMAL_CONSUMER,
        isolation_level: None,
        topics: vec![ListOffsetsRequestTopic {
            name: topic.to_owned(),
            partitions: vec![ListOffsetsRequestPartition {
                partition_index: partition,
                timestamp: at.timestamp(),
            }],
        }],
    }
}

fn process_list_offsets_response(
    partition: i32,
    topic: &str,
    response: ListOffsetsResponse,
) -> Result<ListOffsetsResponsePartition> {
    let response_topic = response
        .topics
        .exactly_one()
        .map_err(Error::exactly_one_topic)?;

    if response_topic.name != topic {
        return Err(Error::InvalidResponse(format!(
            "Expected topic \"{}\" in list offsets response, got \"{}\"",
            topic, response_topic.name,
        )));
    }

    let response_partition = response_topic
        .partitions
        .exactly_one()
        .map_err(Error::exactly_one_partition)?;

    if response_partition.partition_index != partition {
        return Err(Error::InvalidResponse(format!(
            "Expected partition {} for topic \"{}\" in list offsets response, got {}",
            partition, topic, response_partition.partition_index,
        )));
    }

    match response_partition.error_code {
        Some(err) => Err(Error::ServerError {
            protocol_error: err,
            error_message: None,
            request: RequestContext::Partition(topic.to_owned(), partition),
            is_virtual: false,
        }),
        None => Ok(response_partition),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        connection::{
            fake_broker::{metadata_response, FakeBroker, FakeRequest},
            ConnectionConfig, TlsConfig,
        },
        protocol::{
            api_key::ApiKey,
            messages::{
                FetchResponseTopic, ListOffsetsResponseTopic, ProduceResponsePartitionResponse,
                ProduceResponseResponse,
            },
            record::ControlBatchRecord,
            traits::ReadType,
        },
    };

    const TOPIC: &str = "foo";

    fn partition_client(broker: &FakeBroker) -> PartitionClient {
        let backoff_config = Arc::new(BackoffConfig::fixed(Duration::from_millis(10), 3));
        let brokers = Arc::new(BrokerConnector::new(
            vec![broker.address()],
            Arc::from("test"),
            ConnectionConfig::default(),
            None,
            TlsConfig::default(),
            Arc::clone(&backoff_config),
            Duration::from_secs(600),
            1024 * 1024,
        ));

        PartitionClient::new(TOPIC.to_string(), 0, brokers, backoff_config)
    }

    fn record(value: &str, timestamp_millis: i64) -> Record {
        Record {
            key: None,
            value: Some(value.as_bytes().to_vec()),
            headers: BTreeMap::from([("h".to_string(), b"v".to_vec())]),
            timestamp: Utc.timestamp_millis_opt(timestamp_millis).unwrap(),
        }
    }

    fn batch(base_offset: i64, values: &[&str]) -> RecordBatch {
        RecordBatch {
            base_offset,
            partition_leader_epoch: 0,
            last_offset_delta: values.len() as i32 - 1,
            first_timestamp: 1_000,
            max_timestamp: 1_000 + values.len() as i64,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            records: ControlBatchOrRecords::Records(
                (0i32..)
                    .zip(values)
                    .map(|(offset_delta, value)| ProtocolRecord {
                        timestamp_delta: i64::from(offset_delta),
                        offset_delta,
                        key: None,
                        value: Some(value.as_bytes().to_vec()),
                        headers: vec![],
                    })
                    .collect(),
            ),
            compression: RecordBatchCompression::NoCompression,
            is_transactional: false,
            timestamp_type: RecordBatchTimestampType::CreateTime,
        }
    }

    fn fetch_response(
        error_code: Option<ProtocolError>,
        high_watermark: i64,
        batches: Vec<RecordBatch>,
    ) -> FetchResponse {
        FetchResponse {
            throttle_time_ms: 0,
            responses: vec![FetchResponseTopic {
                topic: TOPIC.to_string(),
                partitions: vec![FetchResponsePartition {
                    partition_index: 0,
                    error_code,
                    high_watermark,
                    last_stable_offset: high_watermark,
                    aborted_transactions: vec![],
                    records: Records(batches),
                }],
            }],
        }
    }

    /// Pull the fetch offset of the only partition out of a v4 fetch request.
    fn requested_fetch_offset(req: &FakeRequest) -> i64 {
        let mut body = req.body();
        // replica id, max wait, min bytes, max bytes
        for _ in 0..4 {
            i32::read(&mut body).unwrap();
        }
        i8::read(&mut body).unwrap();
        assert_eq!(i32::read(&mut body).unwrap(), 1);
        assert_eq!(String::read(&mut body).unwrap(), TOPIC);
        assert_eq!(i32::read(&mut body).unwrap(), 1);
        assert_eq!(i32::read(&mut body).unwrap(), 0);
        i64::read(&mut body).unwrap()
    }

    /// Pull the requested timestamp out of a v3 list offsets request.
    fn requested_timestamp(req: &FakeRequest) -> i64 {
        let mut body = req.body();
        i32::read(&mut body).unwrap();
        i8::read(&mut body).unwrap();
        i32::read(&mut body).unwrap();
        String::read(&mut body).unwrap();
        i32::read(&mut body).unwrap();
        i32::read(&mut body).unwrap();
        i64::read(&mut body).unwrap()
    }

    #[test]
    fn produce_request_layout() {
        let request = build_produce_request(
            3,
            TOPIC,
            vec![record("a", 2_000), record("b", 1_500)],
            Compression::NoCompression,
            -1,
            Duration::from_secs(10),
        );

        assert_eq!(request.acks, -1);
        assert_eq!(request.timeout_ms, 10_000);

        let data = &request.topic_data[0].partition_data[0];
        assert_eq!(data.index, 3);

        let batch = &data.records.0[0];
        assert_eq!(batch.first_timestamp, 1_500);
        assert_eq!(batch.max_timestamp, 2_000);
        assert_eq!(batch.last_offset_delta, 1);
        assert_matches!(&batch.records, ControlBatchOrRecords::Records(records) => {
            assert_eq!(records[0].timestamp_delta, 500);
            assert_eq!(records[1].timestamp_delta, 0);
            assert_eq!(records[1].offset_delta, 1);
            assert_eq!(records[0].headers, vec![RecordHeader { key: "h".to_string(), value: b"v".to_vec() }]);
        });
    }

    #[test]
    fn extract_records_filters_and_skips_control_batches() {
        let mut control = batch(13, &[]);
        control.last_offset_delta = 0;
        control.records = ControlBatchOrRecords::ControlBatch(ControlBatchRecord::Commit);

        let mut log_append = batch(14, &["e"]);
        log_append.timestamp_type = RecordBatchTimestampType::LogAppendTime;
        log_append.max_timestamp = 5_000;

        let (records, next_offset) = extract_records(
            vec![batch(10, &["a", "b", "c"]), control, log_append],
            11,
        )
        .unwrap();

        assert_eq!(next_offset, Some(15));

        assert_eq!(
            records.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![11, 12, 14]
        );
        assert_eq!(records[0].record.value.as_deref(), Some(&b"b"[..]));
        assert_eq!(records[0].record.timestamp.timestamp_millis(), 1_001);
        assert_eq!(records[0].log_append_time, None);
        assert_eq!(
            records[2].log_append_time.map(|t| t.timestamp_millis()),
            Some(5_000)
        );
    }

    #[tokio::test]
    async fn produce() {
        let broker = FakeBroker::spawn(|port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 1)]))),
            ApiKey::Produce => Some(req.respond(&ProduceResponse {
                responses: vec![ProduceResponseResponse {
                    name: TOPIC.to_string(),
                    partition_responses: vec![ProduceResponsePartitionResponse {
                        index: 0,
                        error: None,
                        base_offset: 42,
                        log_append_time_ms: -1,
                        log_start_offset: Some(0),
                    }],
                }],
                throttle_time_ms: 0,
            })),
            _ => None,
        })
        .await;

        let client = partition_client(&broker);
        let offsets = client
            .produce(
                vec![record("a", 1_000), record("b", 1_001)],
                Compression::NoCompression,
                1,
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert_eq!(offsets, vec![42, 43]);
    }

    #[tokio::test]
    async fn produce_without_acks() {
        let broker = FakeBroker::spawn(|port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 1)]))),
            // brokers never answer acks=0 produce requests
            _ => None,
        })
        .await;

        let client = partition_client(&broker);
        let offsets = client
            .produce(
                vec![record("a", 1_000)],
                Compression::NoCompression,
                0,
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert!(offsets.is_empty());
    }

    #[tokio::test]
    async fn produce_error() {
        let broker = FakeBroker::spawn(|port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 1)]))),
            ApiKey::Produce => Some(req.respond(&ProduceResponse {
                responses: vec![ProduceResponseResponse {
                    name: TOPIC.to_string(),
                    partition_responses: vec![ProduceResponsePartitionResponse {
                        index: 0,
                        error: Some(ProtocolError::MessageTooLarge),
                        base_offset: -1,
                        log_append_time_ms: -1,
                        log_start_offset: Some(0),
                    }],
                }],
                throttle_time_ms: 0,
            })),
            _ => None,
        })
        .await;

        let client = partition_client(&broker);
        let err = client
            .produce(
                vec![record("a", 1_000)],
                Compression::NoCompression,
                1,
                Duration::from_secs(10),
            )
            .await
            .unwrap_err();

        assert_eq!(err.protocol_error(), Some(ProtocolError::MessageTooLarge));
        assert_eq!(broker.count(ApiKey::Produce), 1);
    }

    #[tokio::test]
    async fn fetch_records() {
        let broker = FakeBroker::spawn(|port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 1)]))),
            ApiKey::Fetch => {
                assert_eq!(requested_fetch_offset(req), 11);
                Some(req.respond(&fetch_response(
                    None,
                    13,
                    vec![batch(10, &["a", "b", "c"])],
                )))
            }
            _ => None,
        })
        .await;

        let client = partition_client(&broker);
        let fetched = client.fetch_records(11, 1..100_000, 250).await.unwrap();

        assert_eq!(fetched.high_watermark, 13);
        assert_eq!(fetched.next_offset, Some(13));
        assert_eq!(
            fetched.records.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![11, 12]
        );
    }

    #[tokio::test]
    async fn fetch_retries_when_leader_moved() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let fetches_captured = Arc::clone(&fetches);

        let broker = FakeBroker::spawn(move |port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 1)]))),
            ApiKey::Fetch => {
                let response = match fetches_captured.fetch_add(1, Ordering::SeqCst) {
                    0 => fetch_response(Some(ProtocolError::NotLeaderOrFollower), -1, vec![]),
                    _ => fetch_response(None, 1, vec![batch(0, &["a"])]),
                };
                Some(req.respond(&response))
            }
            _ => None,
        })
        .await;

        let client = partition_client(&broker);
        let fetched = client.fetch_records(0, 1..100_000, 250).await.unwrap();

        assert_eq!(fetched.records.len(), 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        // the leader was looked up again
        assert_eq!(broker.count(ApiKey::Metadata), 2);
    }

    #[tokio::test]
    async fn fetch_offset_out_of_range_is_fatal() {
        let broker = FakeBroker::spawn(|port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 1)]))),
            ApiKey::Fetch => Some(req.respond(&fetch_response(
                Some(ProtocolError::OffsetOutOfRange),
                -1,
                vec![],
            ))),
            _ => None,
        })
        .await;

        let client = partition_client(&broker);
        let err = client.fetch_records(100, 1..100_000, 250).await.unwrap_err();

        assert_eq!(err.protocol_error(), Some(ProtocolError::OffsetOutOfRange));
        assert_eq!(broker.count(ApiKey::Fetch), 1);
    }

    #[tokio::test]
    async fn unknown_partition() {
        let broker = FakeBroker::spawn(|port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 0)]))),
            _ => None,
        })
        .await;

        let client = partition_client(&broker);
        let err = client.get_offset(OffsetAt::Latest).await.unwrap_err();

        assert_matches!(err, Error::RetryFailed(_));
    }

    #[tokio::test]
    async fn get_offset() {
        let broker = FakeBroker::spawn(|port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 1)]))),
            ApiKey::ListOffsets => {
                let offset = match requested_timestamp(req) {
                    -2 => 3,
                    -1 => 100,
                    _ => 50,
                };
                Some(req.respond(&ListOffsetsResponse {
                    throttle_time_ms: Some(0),
                    topics: vec![ListOffsetsResponseTopic {
                        name: TOPIC.to_string(),
                        partitions: vec![ListOffsetsResponsePartition {
                            partition_index: 0,
                            error_code: None,
                            timestamp: -1,
                            offset,
                        }],
                    }],
                }))
            }
            _ => None,
        })
        .await;

        let client = partition_client(&broker);
        assert_eq!(client.get_offset(OffsetAt::Earliest).await.unwrap(), 3);
        assert_eq!(client.get_offset(OffsetAt::Latest).await.unwrap(), 100);
        assert_eq!(
            client
                .get_offset(OffsetAt::Timestamp(Utc::now()))
                .await
                .unwrap(),
            50
        );

        // one connection for all requests
        assert_eq!(broker.count(ApiKey::Metadata), 1);
    }
}

//! Reading a single partition from a start position onwards.
//!
//! # Usage
//! ```no_run
//! # async fn test() {
//! use futures::StreamExt;
//! use kafka_cli::client::{
//!     consumer::{FetchConfig, PartitionConsumer, StartOffset},
//!     ClientBuilder,
//! };
//!
//! let client = ClientBuilder::new(vec!["127.0.0.1:9092".to_owned()])
//!     .build()
//!     .await
//!     .unwrap();
//! let partition_client = client.partition_client("my_topic", 0);
//!
//! let mut stream = PartitionConsumer::new(partition_client, StartOffset::Earliest, FetchConfig::default())
//!     .into_stream()
//!     .boxed();
//!
//! while let Some(record) = stream.next().await {
//!     println!("{:?}", record.unwrap());
//! }
//! # }
//! ```
use std::time::Duration;

use futures::{stream, Stream, TryStreamExt};
use tracing::{debug, info, warn};

use crate::{
    client::{
        error::{Error, ProtocolError, RequestContext, Result},
        partition::{OffsetAt, PartitionClient},
    },
    record::RecordAndOffset,
};

/// Where to begin reading a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// Oldest record still kept by the broker.
    Earliest,

    /// Only records produced after the consumer started.
    Latest,

    /// A known offset, which must lie between the earliest and the latest offset.
    At(i64),
}

impl From<i64> for StartOffset {
    /// `-1` is the latest and `-2` the earliest offset.
    fn from(offset: i64) -> Self {
        match offset {
            -1 => Self::Latest,
            -2 => Self::Earliest,
            offset => Self::At(offset),
        }
    }
}

/// Fetch tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchConfig {
    /// The broker waits until at least this many bytes are available or `max_wait` passed.
    pub min_bytes: i32,

    /// Record bytes requested per fetch.
    pub default_bytes: i32,

    /// Upper limit when growing the fetch size for records that did not fit, `0` means no limit.
    pub max_bytes: i32,

    pub max_wait: Duration,

    /// Pause after a fetch failed with a retriable error.
    pub retry_backoff: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            min_bytes: 1,
            default_bytes: 32768,
            max_bytes: 0,
            max_wait: Duration::from_millis(250),
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// Reads one partition in offset order.
#[derive(Debug)]
pub struct PartitionConsumer {
    client: PartitionClient,
    start: StartOffset,
    config: FetchConfig,

    /// Resolved on the first fetch.
    next_offset: Option<i64>,

    fetch_size: i32,
}

impl PartitionConsumer {
    pub fn new(client: PartitionClient, start: StartOffset, config: FetchConfig) -> Self {
        Self {
            client,
            start,
            config,
            next_offset: None,
            fetch_size: config.default_bytes,
        }
    }

    pub fn topic(&self) -> &str {
        self.client.topic()
    }

    pub fn partition(&self) -> i32 {
        self.client.partition()
    }

    /// Turn the start position into a concrete offset.
    async fn resolve_start(&self) -> Result<i64> {
        match self.start {
            StartOffset::Earliest => self.client.get_offset(OffsetAt::Earliest).await,
            StartOffset::Latest => self.client.get_offset(OffsetAt::Latest).await,
            StartOffset::At(offset) => {
                let earliest = self.client.get_offset(OffsetAt::Earliest).await?;
                let latest = self.client.get_offset(OffsetAt::Latest).await?;

                if offset < earliest || offset > latest {
                    return Err(Error::ServerError {
                        protocol_error: ProtocolError::OffsetOutOfRange,
                        error_message: Some(format!(
                            "Offset {offset} is outside of [{earliest}, {latest}]"
                        )),
                        request: RequestContext::Partition(
                            self.topic().to_owned(),
                            self.partition(),
                        ),
                        is_virtual: true,
                    });
                }

                Ok(offset)
            }
        }
    }

    /// Fetch the next chunk of records, which might be empty if nothing arrived within `max_wait`.
    pub async fn next_batch(&mut self) -> Result<Vec<RecordAndOffset>> {
        let offset = match self.next_offset {
            Some(offset) => offset,
            None => {
                let offset = self.resolve_start().await?;
                info!(
                    topic = self.topic(),
                    partition = self.partition(),
                    offset,
                    "Start consuming"
                );
                self.next_offset = Some(offset);
                offset
            }
        };

        let max_wait_ms = i32::try_from(self.config.max_wait.as_millis()).unwrap_or(i32::MAX);

        loop {
            let bytes = self.config.min_bytes..self.fetch_size.saturating_add(1);
            let fetched = match self.client.fetch_records(offset, bytes, max_wait_ms).await {
                Ok(r) => r,
                Err(e @ Error::RetryFailed(_)) => {
                    warn!(
                        %e,
                        topic = self.topic(),
                        partition = self.partition(),
                        backoff_ms = self.config.retry_backoff.as_millis() as u64,
                        "Fetch failed, retrying",
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            // batches holding only transaction markers or compacted away records still move the offset
            if let Some(next_offset) = fetched.next_offset {
                self.next_offset = Some(next_offset);
                self.fetch_size = self.config.default_bytes;
                return Ok(fetched.records);
            }

            if fetched.high_watermark <= offset {
                // caught up
                return Ok(fetched.records);
            }

            // there is data, but the first batch did not fit into the fetch size
            self.grow_fetch_size(offset)?;
        }
    }

    fn grow_fetch_size(&mut self, offset: i64) -> Result<()> {
        let max_bytes = self.config.max_bytes;
        if max_bytes > 0 && self.fetch_size >= max_bytes {
            return Err(Error::RecordTooLarge { offset, max_bytes });
        }

        self.fetch_size = self.fetch_size.saturating_mul(2);
        if max_bytes > 0 {
            self.fetch_size = self.fetch_size.min(max_bytes);
        }

        debug!(
            topic = self.topic(),
            partition = self.partition(),
            fetch_size = self.fetch_size,
            "Record did not fit, growing fetch size",
        );
        Ok(())
    }

    /// Endless stream of records. The stream ends after yielding the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<RecordAndOffset>> + Send {
        stream::try_unfold(self, |mut consumer| async move {
            let records = consumer.next_batch().await?;
            Ok::<_, Error>(Some((stream::iter(records.into_iter().map(Ok)), consumer)))
        })
        .try_flatten()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use assert_matches::assert_matches;
    use futures::StreamExt;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        backoff::BackoffConfig,
        client::{Client, ClientBuilder},
        connection::fake_broker::{metadata_response, FakeBroker, FakeRequest},
        protocol::{
            api_key::ApiKey,
            messages::{
                FetchResponse, FetchResponsePartition, FetchResponseTopic, ListOffsetsResponse,
                ListOffsetsResponsePartition, ListOffsetsResponseTopic,
            },
            primitives::Records,
            record::{
                ControlBatchOrRecords, ControlBatchRecord, Record, RecordBatch, RecordBatchCompression,
                RecordBatchTimestampType,
            },
            traits::ReadType,
        },
    };

    const TOPIC: &str = "foo";
    const EARLIEST: i64 = 2;
    const LATEST: i64 = 5;

    #[derive(Debug)]
    struct FetchParams {
        offset: i64,
        partition_max_bytes: i32,
    }

    fn fetch_params(req: &FakeRequest) -> FetchParams {
        let mut body = req.body();
        for _ in 0..4 {
            i32::read(&mut body).unwrap();
        }
        i8::read(&mut body).unwrap();
        i32::read(&mut body).unwrap();
        String::read(&mut body).unwrap();
        i32::read(&mut body).unwrap();
        i32::read(&mut body).unwrap();
        let offset = i64::read(&mut body).unwrap();
        let partition_max_bytes = i32::read(&mut body).unwrap();
        FetchParams {
            offset,
            partition_max_bytes,
        }
    }

    fn list_offsets(req: &FakeRequest) -> Vec<u8> {
        let mut body = req.body();
        i32::read(&mut body).unwrap();
        i8::read(&mut body).unwrap();
        i32::read(&mut body).unwrap();
        String::read(&mut body).unwrap();
        i32::read(&mut body).unwrap();
        i32::read(&mut body).unwrap();
        let offset = match i64::read(&mut body).unwrap() {
            -2 => EARLIEST,
            _ => LATEST,
        };

        req.respond(&ListOffsetsResponse {
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
        })
    }

    fn fetch_response(req: &FakeRequest, high_watermark: i64, batches: Vec<RecordBatch>) -> Vec<u8> {
        req.respond(&FetchResponse {
            throttle_time_ms: 0,
            responses: vec![FetchResponseTopic {
                topic: TOPIC.to_string(),
                partitions: vec![FetchResponsePartition {
                    partition_index: 0,
                    error_code: None,
                    high_watermark,
                    last_stable_offset: high_watermark,
                    aborted_transactions: vec![],
                    records: Records(batches),
                }],
            }],
        })
    }

    fn batch(base_offset: i64, n: i32) -> RecordBatch {
        RecordBatch {
            base_offset,
            partition_leader_epoch: 0,
            last_offset_delta: n - 1,
            first_timestamp: 1_000,
            max_timestamp: 1_000,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            records: ControlBatchOrRecords::Records(
                (0..n)
                    .map(|offset_delta| Record {
                        timestamp_delta: 0,
                        offset_delta,
                        key: None,
                        value: Some(b"TEST".to_vec()),
                        headers: vec![],
                    })
                    .collect(),
            ),
            compression: RecordBatchCompression::NoCompression,
            is_transactional: false,
            timestamp_type: RecordBatchTimestampType::CreateTime,
        }
    }

    fn commit_marker(offset: i64) -> RecordBatch {
        RecordBatch {
            last_offset_delta: 0,
            producer_id: 1,
            producer_epoch: 0,
            records: ControlBatchOrRecords::ControlBatch(ControlBatchRecord::Commit),
            is_transactional: true,
            ..batch(offset, 1)
        }
    }

        async fn client(broker: &FakeBroker) -> Client {
        ClientBuilder::new(vec![broker.address()])
            .backoff_config(BackoffConfig::fixed(Duration::from_millis(10), 2))
            .build()
            .await
            .unwrap()
    }

    fn consumer(client: &Client, start: StartOffset, config: FetchConfig) -> PartitionConsumer {
        PartitionConsumer::new(client.partition_client(TOPIC, 0), start, config)
    }

    #[test]
    fn start_offset_from_flag() {
        assert_eq!(StartOffset::from(-1), StartOffset::Latest);
        assert_eq!(StartOffset::from(-2), StartOffset::Earliest);
        assert_eq!(StartOffset::from(3), StartOffset::At(3));
    }

    #[tokio::test]
    async fn consume_from_latest() {
        let fetched = Arc::new(Mutex::new(vec![]));
        let fetched_captured = Arc::clone(&fetched);

        let broker = FakeBroker::spawn(move |port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 1)]))),
            ApiKey::ListOffsets => Some(list_offsets(req)),
            ApiKey::Fetch => {
                let params = fetch_params(req);
                fetched_captured.lock().push(params.offset);
                let response = match params.offset {
                    LATEST => fetch_response(req, LATEST + 2, vec![batch(LATEST, 2)]),
                    offset => fetch_response(req, offset, vec![]),
                };
                Some(response)
            }
            _ => None,
        })
        .await;

        let client = client(&broker).await;
        let mut consumer = consumer(&client, StartOffset::Latest, FetchConfig::default());

        let records = consumer.next_batch().await.unwrap();
        assert_eq!(
            records.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![LATEST, LATEST + 1]
        );

        // caught up
        assert!(consumer.next_batch().await.unwrap().is_empty());
        assert_eq!(*fetched.lock(), vec![LATEST, LATEST + 2]);
    }

    #[tokio::test]
    async fn stream_from_earliest() {
        let broker = FakeBroker::spawn(|port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 1)]))),
            ApiKey::ListOffsets => Some(list_offsets(req)),
            ApiKey::Fetch => {
                let offset = fetch_params(req).offset;
                Some(fetch_response(req, LATEST, vec![batch(offset, 1)]))
            }
            _ => None,
        })
        .await;

        let client = client(&broker).await;
        let records: Vec<_> = consumer(&client, StartOffset::Earliest, FetchConfig::default())
            .into_stream()
            .take(3)
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(
            records.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![EARLIEST, EARLIEST + 1, EARLIEST + 2]
        );
        assert_eq!(
            records[0].record,
            crate::record::Record {
                key: None,
                value: Some(b"TEST".to_vec()),
                headers: BTreeMap::new(),
                timestamp: records[0].record.timestamp,
            }
        );
    }

    #[tokio::test]
    async fn explicit_offset_out_of_range() {
        let broker = FakeBroker::spawn(|port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 1)]))),
            ApiKey::ListOffsets => Some(list_offsets(req)),
            _ => None,
        })
        .await;

        let client = client(&broker).await;
        let mut stream = consumer(&client, StartOffset::At(LATEST + 1), FetchConfig::default())
            .into_stream()
            .boxed();

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.protocol_error(), Some(ProtocolError::OffsetOutOfRange));
        assert!(stream.next().await.is_none());
        assert_eq!(broker.count(ApiKey::Fetch), 0);
    }

    #[tokio::test]
    async fn skips_transaction_marker_at_tail() {
        let fetched = Arc::new(Mutex::new(vec![]));
        let fetched_captured = Arc::clone(&fetched);

        // a committed transaction: records 2..=3, then its marker at 4
        let broker = FakeBroker::spawn(move |port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 1)]))),
            ApiKey::ListOffsets => Some(list_offsets(req)),
            ApiKey::Fetch => {
                let params = fetch_params(req);
                fetched_captured
                    .lock()
                    .push((params.offset, params.partition_max_bytes));
                let batches = match params.offset {
                    EARLIEST => vec![batch(EARLIEST, 2)],
                    4 => vec![commit_marker(4)],
                    _ => vec![],
                };
                Some(fetch_response(req, LATEST, batches))
            }
            _ => None,
        })
        .await;

        let client = client(&broker).await;
        let config = FetchConfig {
            max_bytes: 1 << 20,
            ..Default::default()
        };
        let mut consumer = consumer(&client, StartOffset::Earliest, config);

        assert_eq!(consumer.next_batch().await.unwrap().len(), 2);
        assert!(consumer.next_batch().await.unwrap().is_empty());
        // caught up behind the marker
        assert!(consumer.next_batch().await.unwrap().is_empty());

        assert_eq!(
            *fetched.lock(),
            vec![(EARLIEST, 32768), (4, 32768), (LATEST, 32768)]
        );
    }

    #[tokio::test]
    async fn starts_on_transaction_marker() {
        let broker = FakeBroker::spawn(|port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 1)]))),
            ApiKey::ListOffsets => Some(list_offsets(req)),
            ApiKey::Fetch => {
                let batches = match fetch_params(req).offset {
                    3 => vec![commit_marker(3)],
                    offset => vec![batch(offset, 1)],
                };
                Some(fetch_response(req, LATEST, batches))
            }
            _ => None,
        })
        .await;

        let client = client(&broker).await;
        let config = FetchConfig {
            max_bytes: 1 << 20,
            ..Default::default()
        };
        let records: Vec<_> = consumer(&client, StartOffset::At(3), config)
            .into_stream()
            .take(1)
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(records[0].offset, 4);
    }

    /// Broker holding a single record that only fits into 100 bytes.
    async fn large_record_broker(sizes: Arc<Mutex<Vec<i32>>>) -> FakeBroker {
        FakeBroker::spawn(move |port, req| match req.api_key {
            ApiKey::Metadata => Some(req.respond(&metadata_response(port, &[(TOPIC, 1)]))),
            ApiKey::ListOffsets => Some(list_offsets(req)),
            ApiKey::Fetch => {
                let params = fetch_params(req);
                sizes.lock().push(params.partition_max_bytes);
                let batches = if params.partition_max_bytes >= 100 {
                    vec![batch(params.offset, 1)]
                } else {
                    vec![]
                };
                Some(fetch_response(req, LATEST, batches))
            }
            _ => None,
        })
        .await
    }

    #[tokio::test]
    async fn fetch_size_grows() {
        let sizes = Arc::new(Mutex::new(vec![]));
        let broker = large_record_broker(Arc::clone(&sizes)).await;

        let client = client(&broker).await;
        let config = FetchConfig {
            default_bytes: 30,
            ..Default::default()
        };
        let mut consumer = consumer(&client, StartOffset::At(3), config);

        let records = consumer.next_batch().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 3);

        // back to the default size after a successful fetch
        consumer.next_batch().await.unwrap();
        assert_eq!(*sizes.lock(), vec![30, 60, 120, 30, 60, 120]);
    }

    #[tokio::test]
    async fn fetch_size_limit() {
        let sizes = Arc::new(Mutex::new(vec![]));
        let broker = large_record_broker(Arc::clone(&sizes)).await;

        let client = client(&broker).await;
        let config = FetchConfig {
            default_bytes: 30,
            max_bytes: 50,
            ..Default::default()
        };
        let mut consumer = consumer(&client, StartOffset::At(3), config);

        let err = consumer.next_batch().await.unwrap_err();
        assert_matches!(
            err,
            Error::RecordTooLarge {
                offset: 3,
                max_bytes: 50
            }
        );
        assert_eq!(*sizes.lock(), vec![30, 50]);
    }
}

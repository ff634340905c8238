use std::{ops::ControlFlow, sync::Arc, time::Duration};

use crate::{
    backoff::{Backoff, BackoffConfig, ErrorOrThrottle},
    build_info::DEFAULT_CLIENT_ID,
    client::partition::PartitionClient,
    connection::{
        Broker, BrokerConnector, ConnectionConfig, MetadataLookupMode, SaslConfig, TlsConfig,
    },
    topic::Topic,
    validation::ExactlyOne,
};

pub mod consumer;
pub mod error;
pub(crate) mod metadata_cache;
pub mod partition;
pub mod producer;

use error::{Error, ProtocolError, RequestContext, Result};

/// Configures and connects a [`Client`].
pub struct ClientBuilder {
    bootstrap_brokers: Vec<String>,
    client_id: Option<Arc<str>>,
    max_message_size: usize,
    connection_config: ConnectionConfig,
    sasl_config: Option<SaslConfig>,
    tls_config: TlsConfig,
    backoff_config: BackoffConfig,
    metadata_refresh: Duration,
    metadata_retry: BackoffConfig,
}

impl ClientBuilder {
    /// Start from the `host:port` addresses used to discover the cluster.
    pub fn new(bootstrap_brokers: Vec<String>) -> Self {
        Self {
            bootstrap_brokers,
            client_id: None,
            max_message_size: 100 * 1024 * 1024, // 100MB
            connection_config: ConnectionConfig::default(),
            sasl_config: None,
            tls_config: TlsConfig::default(),
            backoff_config: BackoffConfig::default(),
            metadata_refresh: Duration::from_secs(10 * 60),
            metadata_retry: BackoffConfig::fixed(Duration::from_millis(250), 3),
        }
    }

    /// Client ID sent with every request, defaults to [`DEFAULT_CLIENT_ID`].
    pub fn client_id(mut self, client_id: impl Into<Arc<str>>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Largest response frame accepted from a broker, in bytes.
    ///
    /// Bounds the fetch sizes usable with [`PartitionClient::fetch_records`]. Metadata responses of large clusters
    /// need room too.
    pub fn max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Dial timeout and per-connection messenger settings.
    pub fn connection_config(mut self, connection_config: ConnectionConfig) -> Self {
        self.connection_config = connection_config;
        self
    }

    /// Authenticate every connection with SASL PLAIN.
    pub fn sasl_config(mut self, sasl_config: SaslConfig) -> Self {
        self.sasl_config = Some(sasl_config);
        self
    }

    /// Connect over TLS.
    #[cfg(feature = "transport-tls")]
    pub fn tls_config(mut self, tls_config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(tls_config);
        self
    }

    /// Backoff used when requests fail with retriable errors.
    pub fn backoff_config(mut self, backoff_config: BackoffConfig) -> Self {
        self.backoff_config = backoff_config;
        self
    }

    /// Maximum age of cached cluster metadata.
    pub fn metadata_refresh(mut self, metadata_refresh: Duration) -> Self {
        self.metadata_refresh = metadata_refresh;
        self
    }

    /// How often and how long to wait for a topic to show up with all its partition leaders.
    pub fn metadata_retry(mut self, max_retries: usize, backoff: Duration) -> Self {
        self.metadata_retry = BackoffConfig::fixed(backoff, max_retries);
        self
    }

    /// Connect to the bootstrap brokers and load the cluster metadata.
    pub async fn build(self) -> Result<Client> {
        let backoff_config = Arc::new(self.backoff_config);
        let brokers = Arc::new(BrokerConnector::new(
            self.bootstrap_brokers,
            self.client_id
                .unwrap_or_else(|| Arc::from(DEFAULT_CLIENT_ID)),
            self.connection_config,
            self.sasl_config,
            self.tls_config,
            Arc::clone(&backoff_config),
            self.metadata_refresh,
            self.max_message_size,
        ));
        brokers.refresh_metadata().await?;

        Ok(Client {
            brokers,
            backoff_config,
            metadata_retry: self.metadata_retry,
        })
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder").finish_non_exhaustive()
    }
}

/// Connection to a cluster.
///
/// Answers metadata questions and hands out a [`PartitionClient`] per topic partition. Created by
/// [`ClientBuilder::build`].
#[derive(Debug)]
pub struct Client {
    brokers: Arc<BrokerConnector>,
    backoff_config: Arc<BackoffConfig>,
    metadata_retry: BackoffConfig,
}

impl Client {
    /// Client for produce, fetch and offset requests against one partition.
    pub fn partition_client(&self, topic: impl Into<String>, partition: i32) -> PartitionClient {
        PartitionClient::new(
            topic.into(),
            partition,
            Arc::clone(&self.brokers),
            Arc::clone(&self.backoff_config),
        )
    }

    /// Brokers known from the last metadata response.
    pub fn brokers(&self) -> Vec<Broker> {
        self.brokers.topology.get_brokers()
    }

    /// All topics except the internal ones.
    pub async fn list_topics(&self) -> Result<Vec<Topic>> {
        // always asks a broker so new topics show up, the answer refreshes the cache
        let response = self
            .brokers
            .request_metadata(MetadataLookupMode::ArbitraryBroker, None)
            .await?;

        Ok(response
            .topics
            .into_iter()
            .filter(|t| !matches!(t.is_internal, Some(true)))
            .map(Topic::from)
            .collect())
    }

    /// Fresh metadata of a single topic.
    ///
    /// Brokers configured to do so create unknown topics on this request.
    pub async fn fetch_metadata(&self, topic: &str) -> Result<Topic> {
        let response = self
            .brokers
            .request_metadata(
                MetadataLookupMode::ArbitraryBroker,
                Some(vec![topic.to_string()]),
            )
            .await?;

        let response_topic = response
            .topics
            .exactly_one()
            .map_err(Error::exactly_one_topic)?;

        if let Some(e) = response_topic.error {
            return Err(Error::ServerError {
                protocol_error: e,
                error_message: None,
                request: RequestContext::Topic(topic.to_string()),
                is_virtual: false,
            });
        }

        if response_topic.name != topic {
            return Err(Error::InvalidResponse(format!(
                "Expected metadata for topic \"{}\" got \"{}\"",
                topic, response_topic.name
            )));
        }

        Ok(Topic::from(response_topic))
    }

    /// Partition IDs of `topic` in ascending order.
    ///
    /// A freshly created topic takes a moment until every partition has a leader, so this waits for that according
    /// to [`ClientBuilder::metadata_retry`].
    pub async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let mut backoff = Backoff::new(&self.metadata_retry);

        backoff
            .retry_with_backoff("partitions", || async {
                let metadata = match self.fetch_metadata(topic).await {
                    Ok(metadata) => metadata,
                    Err(
                        e @ Error::ServerError {
                            protocol_error:
                                ProtocolError::LeaderNotAvailable
                                | ProtocolError::UnknownTopicOrPartition,
                            ..
                        },
                    ) => return ControlFlow::Continue(ErrorOrThrottle::Error(e)),
                    Err(e) => return ControlFlow::Break(Err(e)),
                };

                if metadata.partitions.is_empty()
                    || metadata.partitions.values().any(|p| p.leader_id < 0)
                {
                    return ControlFlow::Continue(ErrorOrThrottle::Error(Error::ServerError {
                        protocol_error: ProtocolError::LeaderNotAvailable,
                        error_message: Some("Not all partitions have a leader yet".to_owned()),
                        request: RequestContext::Topic(topic.to_string()),
                        is_virtual: true,
                    }));
                }

                ControlFlow::Break(Ok(metadata.partition_ids()))
            })
            .await
            .map_err(Error::RetryFailed)?
    }
}

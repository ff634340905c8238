use std::{collections::HashMap, ops::ControlFlow, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::prelude::*;
use thiserror::Error;
use tokio::{io::BufStream, sync::Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::{Backoff, BackoffConfig, BackoffError, ErrorOrThrottle},
    client::metadata_cache::MetadataCache,
    messenger::{Messenger, MessengerConfig, RequestError, SaslError, SyncVersionsError},
    protocol::messages::{MetadataRequest, MetadataRequestTopic, MetadataResponse},
};

pub use self::topology::{Broker, BrokerTopology};
#[cfg(feature = "transport-tls")]
pub use self::transport::tls_config_from_pem;
pub use self::transport::{Error as TransportError, TlsConfig, Transport};

#[cfg(test)]
pub(crate) mod fake_broker;
mod topology;
mod transport;

/// A connection to a broker
pub type MessengerTransport = Messenger<BufStream<Transport>>;
pub type BrokerConnection = Arc<MessengerTransport>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("error getting cluster metadata: {0}")]
    Metadata(#[from] RequestError),

    #[error("error connecting to broker \"{broker}\": {error}")]
    Transport {
        broker: String,
        error: transport::Error,
    },

    #[error("cannot sync versions with broker \"{broker}\": {error}")]
    SyncVersions {
        broker: String,
        error: SyncVersionsError,
    },

    #[error("SASL authentication with broker \"{broker}\" failed: {error}")]
    Sasl { broker: String, error: SaslError },

    #[error("no broker to connect to")]
    NoBrokers,

    #[error("all retries failed: {0}")]
    RetryFailed(#[from] BackoffError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Credentials for SASL PLAIN.
#[derive(Clone, PartialEq, Eq)]
pub struct SaslConfig {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SaslConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Settings applied to every broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Limit for dialing a broker, including the TLS handshake.
    pub dial_timeout: Duration,

    pub messenger: MessengerConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            messenger: MessengerConfig::default(),
        }
    }
}

/// How to get metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataLookupMode {
    /// Ask any broker, bypassing the cache.
    ArbitraryBroker,

    /// Serve from the metadata cache if it is fresh, otherwise ask any broker.
    CachedArbitrary,
}

/// Counter that tells a cache whether an invalidation request refers to the entry it currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerCacheGeneration(usize);

impl BrokerCacheGeneration {
    pub const START: Self = Self(0);

    pub fn bump(&mut self) {
        self.0 += 1;
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

/// Caches a broker connection, e.g. the one of a partition leader.
#[async_trait]
pub trait BrokerCache: Send + Sync {
    type R: Send + Sync;
    type E: std::error::Error + Send + Sync;

    async fn get(&self) -> Result<(Arc<Self::R>, BrokerCacheGeneration), Self::E>;

    async fn invalidate(&self, reason: &'static str, gen: BrokerCacheGeneration);
}

/// Builds and caches connections to the brokers of a cluster.
///
/// Bootstrap brokers are only used to get the first connection, afterwards brokers are addressed by the IDs the
/// cluster metadata reports.
#[derive(Debug)]
pub struct BrokerConnector {
    /// Broker URLs used to bootstrap this pool
    bootstrap_brokers: Vec<String>,

    /// Client ID sent with every request
    client_id: Arc<str>,

    /// Discovered brokers in the cluster, including bootstrap brokers
    pub(crate) topology: BrokerTopology,

    /// The current cached broker connection used for metadata requests
    cached_arbitrary_broker: Mutex<(Option<BrokerConnection>, BrokerCacheGeneration)>,

    /// Open connections keyed by broker ID
    cached_brokers: parking_lot::Mutex<HashMap<i32, BrokerConnection>>,

    /// The cached metadata response
    cached_metadata: MetadataCache,

    backoff_config: Arc<BackoffConfig>,

    connection_config: ConnectionConfig,

    sasl_config: Option<SaslConfig>,

    tls_config: TlsConfig,

    /// Maximum message size for framing protocol
    max_message_size: usize,
}

impl BrokerConnector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bootstrap_brokers: Vec<String>,
        client_id: Arc<str>,
        connection_config: ConnectionConfig,
        sasl_config: Option<SaslConfig>,
        tls_config: TlsConfig,
        backoff_config: Arc<BackoffConfig>,
        metadata_refresh: Duration,
        max_message_size: usize,
    ) -> Self {
        Self {
            bootstrap_brokers,
            client_id,
            topology: Default::default(),
            cached_arbitrary_broker: Mutex::new((None, BrokerCacheGeneration::START)),
            cached_brokers: Default::default(),
            cached_metadata: MetadataCache::new(metadata_refresh),
            backoff_config,
            connection_config,
            sasl_config,
            tls_config,
            max_message_size,
        }
    }

    /// Fetch and cache metadata of all topics.
    pub async fn refresh_metadata(&self) -> Result<()> {
        self.request_metadata(MetadataLookupMode::ArbitraryBroker, None)
            .await?;

        Ok(())
    }

    /// Requests metadata for the provided topics, or all topics if `None`.
    ///
    /// Every successful response updates the broker topology, a response covering all topics also replaces the
    /// metadata cache.
    pub async fn request_metadata(
        &self,
        metadata_mode: MetadataLookupMode,
        topics: Option<Vec<String>>,
    ) -> Result<MetadataResponse> {
        if metadata_mode == MetadataLookupMode::CachedArbitrary {
            if let Some(metadata) = self.cached_metadata.get(topics.as_deref()) {
                return Ok(metadata);
            }
        }

        let all_topics = topics.is_none();
        let request = MetadataRequest {
            topics: topics.map(|t| {
                t.into_iter()
                    .map(|name| MetadataRequestTopic { name })
                    .collect()
            }),
            allow_auto_topic_creation: None,
        };

        let response = metadata_request_with_retry(&request, &self.backoff_config, self).await?;

        // Since the metadata request contains information about the cluster state, use it to update our view of the
        // cluster.
        self.topology.update(&response.brokers);

        if all_topics {
            self.cached_metadata.update(response.clone());
        }

        Ok(response)
    }

    /// Drop the cached metadata, e.g. after a broker told us it is not the leader anymore.
    pub(crate) fn invalidate_metadata_cache(&self, reason: &'static str) {
        self.cached_metadata.invalidate(reason);
    }

    /// Returns a connection to the broker with the given ID, or `None` if the ID is not part of the topology.
    ///
    /// Connections are shared, a new one is only opened if there is none or the cached one is broken.
    pub async fn connect(&self, broker_id: i32) -> Result<Option<BrokerConnection>> {
        if let Some(conn) = self.cached_brokers.lock().get(&broker_id) {
            if !conn.is_poisoned() {
                return Ok(Some(Arc::clone(conn)));
            }
        }

        let broker = match self.topology.get_broker(broker_id) {
            Some(broker) => broker,
            None => return Ok(None),
        };

        let conn = self.connect_url(&broker.to_string()).await?;

        let mut cached = self.cached_brokers.lock();
        let conn = match cached.get(&broker_id) {
            // somebody else was faster
            Some(existing) if !existing.is_poisoned() => Arc::clone(existing),
            _ => {
                cached.insert(broker_id, Arc::clone(&conn));
                conn
            }
        };

        Ok(Some(conn))
    }

    /// Open, negotiate and authenticate a fresh connection.
    async fn connect_url(&self, url: &str) -> Result<BrokerConnection> {
        info!(broker = url, "Establishing new connection");

        let transport = Transport::connect(
            url,
            self.tls_config.clone(),
            self.connection_config.dial_timeout,
        )
        .await
        .map_err(|error| Error::Transport {
            broker: url.to_string(),
            error,
        })?;

        let messenger = Arc::new(Messenger::new(
            BufStream::new(transport),
            self.max_message_size,
            Arc::clone(&self.client_id),
            self.connection_config.messenger,
        ));

        messenger
            .sync_versions()
            .await
            .map_err(|error| Error::SyncVersions {
                broker: url.to_string(),
                error,
            })?;

        if let Some(sasl) = &self.sasl_config {
            messenger
                .sasl_plain(&sasl.username, &sasl.password)
                .await
                .map_err(|error| Error::Sasl {
                    broker: url.to_string(),
                    error,
                })?;
        }

        Ok(messenger)
    }

    /// Candidate URLs for an arbitrary connection: known brokers first, then the bootstrap list.
    fn arbitrary_broker_urls(&self) -> Vec<String> {
        let mut known: Vec<String> = self
            .topology
            .get_brokers()
            .iter()
            .map(ToString::to_string)
            .collect();
        known.shuffle(&mut thread_rng());

        let mut bootstrap = self.bootstrap_brokers.clone();
        bootstrap.shuffle(&mut thread_rng());

        for url in bootstrap {
            if !known.contains(&url) {
                known.push(url);
            }
        }

        known
    }
}

#[async_trait]
impl BrokerCache for &BrokerConnector {
    type R = MessengerTransport;
    type E = Error;

    async fn get(&self) -> Result<(Arc<Self::R>, BrokerCacheGeneration)> {
        let mut current_broker = self.cached_arbitrary_broker.lock().await;
        if let Some(broker) = &current_broker.0 {
            return Ok((Arc::clone(broker), current_broker.1));
        }

        let connection = connect_to_a_broker_with_retry(self, &self.backoff_config).await?;

        current_broker.0 = Some(Arc::clone(&connection));
        current_broker.1.bump();

        Ok((connection, current_broker.1))
    }

    async fn invalidate(&self, reason: &'static str, gen: BrokerCacheGeneration) {
        let mut guard = self.cached_arbitrary_broker.lock().await;

        if guard.1 != gen {
            // stale request
            debug!(
                reason,
                current_gen = guard.1.get(),
                request_gen = gen.get(),
                "stale invalidation request for arbitrary broker cache",
            );
            return;
        }

        info!(reason, "Invalidating cached arbitrary broker");
        guard.0.take();
    }
}

/// Try every candidate broker in turn, backing off once all of them failed.
async fn connect_to_a_broker_with_retry(
    connector: &BrokerConnector,
    backoff_config: &BackoffConfig,
) -> Result<BrokerConnection> {
    let mut backoff = Backoff::new(backoff_config);

    backoff
        .retry_with_backoff("broker_connect", || async {
            let mut last_error = None;

            for url in connector.arbitrary_broker_urls() {
                match connector.connect_url(&url).await {
                    Ok(conn) => return ControlFlow::Break(conn),
                    Err(e) => {
                        warn!(%e, broker = url.as_str(), "Failed to connect to broker");
                        last_error = Some(e);
                    }
                }
            }

            ControlFlow::Continue(ErrorOrThrottle::Error(
                last_error.unwrap_or(Error::NoBrokers),
            ))
        })
        .await
        .map_err(Error::RetryFailed)
}

/// Send a metadata request to an arbitrary broker, replacing the connection while it is broken.
async fn metadata_request_with_retry<A>(
    request: &MetadataRequest,
    backoff_config: &BackoffConfig,
    arbitrary_broker_cache: A,
) -> Result<MetadataResponse>
where
    A: BrokerCache<R = MessengerTransport, E = Error>,
{
    let mut backoff = Backoff::new(backoff_config);

    backoff
        .retry_with_backoff("metadata", || async {
            let (broker, gen) = match arbitrary_broker_cache.get().await {
                Ok(inner) => inner,
                Err(e) => return ControlFlow::Break(Err(e)),
            };

            match broker.request(request).await {
                Ok(response) => ControlFlow::Break(Ok(response)),
                Err(e @ (RequestError::Poisoned(_) | RequestError::ConnectionClosed)) => {
                    arbitrary_broker_cache
                        .invalidate("metadata request: arbitrary broker connection is broken", gen)
                        .await;
                    ControlFlow::Continue(ErrorOrThrottle::Error(e))
                }
                Err(e) => {
                    error!(%e, "metadata request failed");
                    ControlFlow::Break(Err(Error::Metadata(e)))
                }
            }
        })
        .await
        .map_err(Error::RetryFailed)?
}

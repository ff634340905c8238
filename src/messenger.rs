//! Request/response multiplexing over a single broker connection.
//!
//! Requests are tagged with increasing correlation IDs and written by the caller. A background task reads every
//! response frame and routes it to the waiting caller. Any IO or framing problem (or a timeout) poisons the
//! messenger: all pending and future requests fail and the connection has to be replaced.

use std::{
    collections::HashMap,
    io::Cursor,
    ops::DerefMut,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, WriteHalf},
    sync::{
        oneshot::{channel, Sender},
        Mutex as AsyncMutex, Semaphore,
    },
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error as ApiError,
    frame::{AsyncMessageRead, AsyncMessageWrite},
    messages::{
        ApiVersionsRequest, ReadVersionedError, ReadVersionedType, RequestBody, RequestHeader,
        ResponseHeader, SaslAuthenticateRequest, SaslHandshakeRequest, WriteVersionedError,
        WriteVersionedType, REQUEST_HEADER_VERSION, RESPONSE_HEADER_VERSION,
    },
};

const SASL_MECHANISM_PLAIN: &str = "PLAIN";

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessengerConfig {
    /// How many requests may wait for a response at the same time.
    pub max_open_requests: usize,

    /// How long to wait for a response.
    pub read_timeout: Duration,

    /// How long writing a request may take.
    pub write_timeout: Duration,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            max_open_requests: 5,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Response {
    header: ResponseHeader,
    data: Cursor<Vec<u8>>,
}

#[derive(Debug)]
enum MessengerState {
    /// Waiting callers, keyed by correlation ID.
    ///
    /// `raw` is only set during a SASL v0 exchange where the broker answers with a bare frame.
    RequestMap {
        pending: HashMap<i32, Sender<Response>>,
        raw: Option<Sender<Vec<u8>>>,
    },

    /// The connection is broken.
    Poison(Arc<RequestError>),
}

impl MessengerState {
    /// Switch to the poisoned state. The first error wins.
    ///
    /// Dropping the senders wakes up every waiting caller.
    fn poison(&mut self, err: RequestError) -> Arc<RequestError> {
        match self {
            Self::Poison(existing) => Arc::clone(existing),
            Self::RequestMap { .. } => {
                let err = Arc::new(err);
                *self = Self::Poison(Arc::clone(&err));
                err
            }
        }
    }
}

/// A connection to a single broker.
///
/// Note that this connection does not care about the exact nature of the broker (e.g. if it is the controller or a
/// partition leader), it just sends requests and routes responses.
#[derive(Debug)]
pub struct Messenger<RW> {
    stream_write: Arc<AsyncMutex<WriteHalf<RW>>>,
    client_id: Arc<str>,
    correlation_id: AtomicI32,
    version_ranges: RwLock<HashMap<ApiKey, ApiVersionRange>>,
    state: Arc<Mutex<MessengerState>>,
    in_flight: Semaphore,
    config: MessengerConfig,
    join_handle: JoinHandle<()>,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RequestError {
    #[error("Cannot find matching version for: {api_key:?}")]
    NoVersionMatch { api_key: ApiKey },

    #[error("Cannot write data: {0}")]
    WriteError(#[from] WriteVersionedError),

    #[error("Cannot write framed message: {0}")]
    WriteMessageError(#[from] crate::protocol::frame::WriteError),

    #[error("Cannot read data: {0}")]
    ReadError(#[from] ReadVersionedError),

    #[error("Cannot read framed message: {0}")]
    ReadFramedMessageError(#[from] crate::protocol::frame::ReadError),

    #[error("Data left at the end of the message. Got {message_size} bytes but only read {read} bytes. api_key={api_key:?} api_version={api_version}")]
    TooMuchData {
        message_size: u64,
        read: u64,
        api_key: ApiKey,
        api_version: ApiVersion,
    },

    #[error("{operation} timed out after {timeout:?} (api_key={api_key:?})")]
    Timeout {
        operation: &'static str,
        api_key: ApiKey,
        timeout: Duration,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection is poisoned: {0}")]
    Poisoned(Arc<RequestError>),
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SyncVersionsError {
    #[error("Request error: {0}")]
    RequestError(#[from] RequestError),

    #[error("Broker rejected version request: {0}")]
    ApiError(ApiError),
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SaslError {
    #[error("Request error: {0}")]
    RequestError(#[from] RequestError),

    #[error("SASL handshake failed: {error}, enabled mechanisms: {mechanisms:?}")]
    Handshake {
        error: ApiError,
        mechanisms: Vec<String>,
    },

    #[error("SASL authentication failed: {error}: {message}")]
    AuthenticationFailed { error: ApiError, message: String },
}

/// Removes a pending request from the map when the caller goes away before the response arrived.
struct CleanupRequestStateOnCancel<'a> {
    state: &'a Mutex<MessengerState>,
    correlation_id: i32,
}

impl Drop for CleanupRequestStateOnCancel<'_> {
    fn drop(&mut self) {
        if let MessengerState::RequestMap { pending, .. } = self.state.lock().deref_mut() {
            pending.remove(&self.correlation_id);
        }
    }
}

impl<RW> Messenger<RW>
where
    RW: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: RW,
        max_message_size: usize,
        client_id: Arc<str>,
        config: MessengerConfig,
    ) -> Self {
        let (mut stream_read, stream_write) = tokio::io::split(stream);
        let state = Arc::new(Mutex::new(MessengerState::RequestMap {
            pending: HashMap::default(),
            raw: None,
        }));
        let state_captured = Arc::clone(&state);

        let join_handle = tokio::spawn(async move {
            loop {
                let msg = match stream_read.read_message(max_message_size).await {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(%e, "Cannot read from broker, poisoning connection");
                        state_captured
                            .lock()
                            .poison(RequestError::ReadFramedMessageError(e));
                        return;
                    }
                };

                if !route_message(&state_captured, msg) {
                    return;
                }
            }
        });

        Self {
            stream_write: Arc::new(AsyncMutex::new(stream_write)),
            client_id,
            correlation_id: AtomicI32::new(0),
            version_ranges: RwLock::new(HashMap::new()),
            state,
            in_flight: Semaphore::new(config.max_open_requests.max(1)),
            config,
            join_handle,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_version_ranges(&self, ranges: HashMap<ApiKey, ApiVersionRange>) {
        *self.version_ranges.write() = ranges;
    }

    /// Highest version of `R` both sides speak.
    fn select_version<R: RequestBody>(&self) -> Result<ApiVersion, RequestError> {
        self.version_ranges
            .read()
            .get(&R::API_KEY)
            .and_then(|broker| R::API_VERSION_RANGE.highest_common(broker))
            .ok_or(RequestError::NoVersionMatch {
                api_key: R::API_KEY,
            })
    }

    pub async fn request<R>(&self, msg: R) -> Result<R::ResponseBody, RequestError>
    where
        R: RequestBody + Send + WriteVersionedType<Vec<u8>>,
        R::ResponseBody: ReadVersionedType<Cursor<Vec<u8>>>,
    {
        let version = self.select_version::<R>()?;
        self.request_with_version(msg, version).await
    }

    /// Send a request the broker will not answer, e.g. a produce request with `acks = 0`.
    pub async fn send_only<R>(&self, msg: R) -> Result<(), RequestError>
    where
        R: RequestBody + Send + WriteVersionedType<Vec<u8>>,
    {
        let version = self.select_version::<R>()?;
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| RequestError::ConnectionClosed)?;

        self.check_poison()?;
        let correlation_id = self.correlation_id.fetch_add(1, Ordering::SeqCst);
        let buf = self.encode(&msg, R::API_KEY, version, correlation_id)?;
        self.send_message(buf, R::API_KEY).await
    }

    async fn request_with_version<R>(
        &self,
        msg: R,
        version: ApiVersion,
    ) -> Result<R::ResponseBody, RequestError>
    where
        R: RequestBody + Send + WriteVersionedType<Vec<u8>>,
        R::ResponseBody: ReadVersionedType<Cursor<Vec<u8>>>,
    {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| RequestError::ConnectionClosed)?;

        let correlation_id = self.correlation_id.fetch_add(1, Ordering::SeqCst);
        let buf = self.encode(&msg, R::API_KEY, version, correlation_id)?;

        let (tx, rx) = channel();
        match self.state.lock().deref_mut() {
            MessengerState::RequestMap { pending, .. } => {
                pending.insert(correlation_id, tx);
            }
            MessengerState::Poison(e) => return Err(RequestError::Poisoned(Arc::clone(e))),
        }
        let _cleanup = CleanupRequestStateOnCancel {
            state: &self.state,
            correlation_id,
        };

        self.send_message(buf, R::API_KEY).await?;

        let mut response = match tokio::time::timeout(self.config.read_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(self.poisoned()),
            Err(_) => {
                return Err(self.poison(RequestError::Timeout {
                    operation: "Read",
                    api_key: R::API_KEY,
                    timeout: self.config.read_timeout,
                }))
            }
        };
        debug_assert_eq!(response.header.correlation_id, correlation_id);

        let body = R::ResponseBody::read_versioned(&mut response.data, version)?;

        let read = response.data.position();
        let message_size = u64::try_from(response.data.get_ref().len()).unwrap_or(u64::MAX);
        if read != message_size {
            return Err(RequestError::TooMuchData {
                message_size,
                read,
                api_key: R::API_KEY,
                api_version: version,
            });
        }

        Ok(body)
    }

    fn encode<R>(
        &self,
        msg: &R,
        api_key: ApiKey,
        version: ApiVersion,
        correlation_id: i32,
    ) -> Result<Vec<u8>, RequestError>
    where
        R: WriteVersionedType<Vec<u8>>,
    {
        let header = RequestHeader {
            request_api_key: api_key,
            request_api_version: version,
            correlation_id,
            client_id: Some(self.client_id.to_string()),
        };

        let mut buf = Vec::new();
        header.write_versioned(&mut buf, REQUEST_HEADER_VERSION)?;
        msg.write_versioned(&mut buf, version)?;
        Ok(buf)
    }

    async fn send_message(&self, buf: Vec<u8>, api_key: ApiKey) -> Result<(), RequestError> {
        let mut stream = self.stream_write.lock().await;
        match tokio::time::timeout(self.config.write_timeout, stream.write_message(&buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.poison(RequestError::WriteMessageError(e))),
            Err(_) => Err(self.poison(RequestError::Timeout {
                operation: "Write",
                api_key,
                timeout: self.config.write_timeout,
            })),
        }
    }

    fn poison(&self, err: RequestError) -> RequestError {
        RequestError::Poisoned(self.state.lock().poison(err))
    }

    fn poisoned(&self) -> RequestError {
        match self.state.lock().deref_mut() {
            MessengerState::Poison(e) => RequestError::Poisoned(Arc::clone(e)),
            MessengerState::RequestMap { .. } => RequestError::ConnectionClosed,
        }
    }

    /// A poisoned messenger never recovers, callers have to open a new connection.
    pub fn is_poisoned(&self) -> bool {
        matches!(*self.state.lock(), MessengerState::Poison(_))
    }

    fn check_poison(&self) -> Result<(), RequestError> {
        match self.state.lock().deref_mut() {
            MessengerState::Poison(e) => Err(RequestError::Poisoned(Arc::clone(e))),
            MessengerState::RequestMap { .. } => Ok(()),
        }
    }

    /// Learn which API versions the broker speaks.
    ///
    /// Uses version 0, which every broker answers.
    pub async fn sync_versions(&self) -> Result<(), SyncVersionsError> {
        let response = self
            .request_with_version(ApiVersionsRequest::default(), ApiVersion(0))
            .await?;

        if let Some(e) = response.error_code {
            return Err(SyncVersionsError::ApiError(e));
        }

        let ranges = response
            .api_keys
            .into_iter()
            .filter(|k| k.min_version <= k.max_version)
            .map(|k| {
                (
                    k.api_key,
                    ApiVersionRange::new(k.min_version, k.max_version),
                )
            })
            .collect::<HashMap<_, _>>();

        debug!(versions = ?ranges, "Detected supported broker versions");
        *self.version_ranges.write() = ranges;

        Ok(())
    }

    /// Authenticate with SASL PLAIN.
    ///
    /// With a version 1 handshake the token travels in a `SaslAuthenticate` request, with version 0 as a bare frame.
    pub async fn sasl_plain(&self, username: &str, password: &str) -> Result<(), SaslError> {
        let handshake_version = self.select_version::<SaslHandshakeRequest>()?;
        let response = self
            .request_with_version(
                SaslHandshakeRequest::new(SASL_MECHANISM_PLAIN),
                handshake_version,
            )
            .await?;
        if let Some(error) = response.error_code {
            return Err(SaslError::Handshake {
                error,
                mechanisms: response.mechanisms,
            });
        }

        let token = format!("\0{username}\0{password}").into_bytes();

        if handshake_version.0 >= 1 {
            let response = self.request(SaslAuthenticateRequest::new(token)).await?;
            if let Some(error) = response.error_code {
                return Err(SaslError::AuthenticationFailed {
                    error,
                    message: response.error_message.unwrap_or_default(),
                });
            }
        } else {
            self.raw_exchange(token).await?;
        }

        debug!(user = username, "SASL authentication succeeded");
        Ok(())
    }

    /// Send a bare frame and wait for the next bare frame.
    async fn raw_exchange(&self, token: Vec<u8>) -> Result<Vec<u8>, RequestError> {
        let (tx, rx) = channel();
        match self.state.lock().deref_mut() {
            MessengerState::RequestMap { raw, .. } => {
                *raw = Some(tx);
            }
            MessengerState::Poison(e) => return Err(RequestError::Poisoned(Arc::clone(e))),
        }

        self.send_message(token, ApiKey::SaslAuthenticate).await?;

        match tokio::time::timeout(self.config.read_timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            // brokers close the connection when the credentials are wrong
            Ok(Err(_)) => Err(self.poisoned()),
            Err(_) => Err(self.poison(RequestError::Timeout {
                operation: "Read",
                api_key: ApiKey::SaslAuthenticate,
                timeout: self.config.read_timeout,
            })),
        }
    }
}

/// Hand a frame to whoever waits for it. Returns `false` once the connection is poisoned.
fn route_message(state: &Mutex<MessengerState>, msg: Vec<u8>) -> bool {
    let mut state = state.lock();
    let MessengerState::RequestMap { pending, raw } = state.deref_mut() else {
        return false;
    };

    if let Some(tx) = raw.take() {
        // receiver may be gone, that's fine
        tx.send(msg).ok();
        return true;
    }

    let mut data = Cursor::new(msg);
    let header = match ResponseHeader::read_versioned(&mut data, RESPONSE_HEADER_VERSION) {
        Ok(header) => header,
        Err(e) => {
            warn!(%e, "Cannot read message header, ignoring message");
            return true;
        }
    };

    match pending.remove(&header.correlation_id) {
        Some(tx) => {
            // receiver may be gone, that's fine
            tx.send(Response { header, data }).ok();
        }
        None => {
            warn!(
                correlation_id = header.correlation_id,
                "Got response for unknown request",
            );
        }
    }

    true
}

impl<RW> Drop for Messenger<RW> {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

//! In-process broker for tests.
//!
//! Answers `ApiVersions` on its own and hands every other request to a handler. A handler returning `None` sends no
//! response at all.

use std::{collections::HashMap, io::Cursor, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

use crate::protocol::{
    api_key::ApiKey,
    api_version::ApiVersion,
    frame::{AsyncMessageRead, AsyncMessageWrite},
    messages::{
        ApiVersionsRequest, ApiVersionsResponse, ApiVersionsResponseApiKey, FetchRequest, ListOffsetsRequest,
        MetadataRequest, MetadataResponse, MetadataResponseBroker, MetadataResponsePartition,
        MetadataResponseTopic, ProduceRequest, ReadVersionedType, RequestBody, RequestHeader,
        ResponseHeader, SaslAuthenticateRequest, SaslHandshakeRequest, WriteVersionedType,
        REQUEST_HEADER_VERSION, RESPONSE_HEADER_VERSION,
    },
};

const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug)]
pub(crate) struct FakeRequest {
    pub(crate) api_key: ApiKey,
    pub(crate) api_version: ApiVersion,
    pub(crate) body: Vec<u8>,
}

impl FakeRequest {
    /// Encode a response body with the version of the request.
    pub(crate) fn respond<T: WriteVersionedType<Vec<u8>>>(&self, body: &T) -> Vec<u8> {
        let mut buf = vec![];
        body.write_versioned(&mut buf, self.api_version).unwrap();
        buf
    }

    pub(crate) fn body(&self) -> Cursor<&[u8]> {
        Cursor::new(self.body.as_slice())
    }
}

type Handler = dyn Fn(u16, &FakeRequest) -> Option<Vec<u8>> + Send + Sync;

pub(crate) struct FakeBroker {
    addr: SocketAddr,
    counts: Arc<Mutex<HashMap<ApiKey, usize>>>,
    join_handle: JoinHandle<()>,
}

impl FakeBroker {
    /// Listen on a random local port. The handler gets that port and the request.
    pub(crate) async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(u16, &FakeRequest) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler: Arc<Handler> = Arc::new(handler);
        let counts = Arc::new(Mutex::new(HashMap::new()));
        let counts_captured = Arc::clone(&counts);

        let join_handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(
                    socket,
                    addr.port(),
                    Arc::clone(&handler),
                    Arc::clone(&counts_captured),
                ));
            }
        });

        Self {
            addr,
            counts,
            join_handle,
        }
    }

    pub(crate) fn address(&self) -> String {
        self.addr.to_string()
    }

    /// An address nobody listens on.
    pub(crate) async fn dead_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    /// How many requests of the given kind were received.
    pub(crate) fn count(&self, api_key: ApiKey) -> usize {
        self.counts.lock().get(&api_key).copied().unwrap_or_default()
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

async fn serve(
    mut socket: TcpStream,
    port: u16,
    handler: Arc<Handler>,
    counts: Arc<Mutex<HashMap<ApiKey, usize>>>,
) {
    while let Ok(msg) = socket.read_message(MAX_MESSAGE_SIZE).await {
        let mut data = Cursor::new(msg);
        let header = RequestHeader::read_versioned(&mut data, REQUEST_HEADER_VERSION).unwrap();
        let pos = data.position() as usize;
        let request = FakeRequest {
            api_key: header.request_api_key,
            api_version: header.request_api_version,
            body: data.into_inner().split_off(pos),
        };
        *counts.lock().entry(request.api_key).or_default() += 1;

        let body = match request.api_key {
            ApiKey::ApiVersions => Some(request.respond(&supported_versions())),
            _ => handler(port, &request),
        };
        let Some(body) = body else {
            continue;
        };

        let mut response = vec![];
        ResponseHeader {
            correlation_id: header.correlation_id,
        }
        .write_versioned(&mut response, RESPONSE_HEADER_VERSION)
        .unwrap();
        response.extend(body);

        if socket.write_message(&response).await.is_err() {
            return;
        }
    }
}

fn api_key<R: RequestBody>() -> ApiVersionsResponseApiKey {
    ApiVersionsResponseApiKey {
        api_key: R::API_KEY,
        min_version: R::API_VERSION_RANGE.min(),
        max_version: R::API_VERSION_RANGE.max(),
    }
}

/// Exactly the versions the client speaks.
fn supported_versions() -> ApiVersionsResponse {
    ApiVersionsResponse {
        error_code: None,
        api_keys: vec![
            api_key::<ProduceRequest>(),
            api_key::<FetchRequest>(),
            api_key::<ListOffsetsRequest>(),
            api_key::<MetadataRequest>(),
            api_key::<SaslHandshakeRequest>(),
            api_key::<SaslAuthenticateRequest>(),
            api_key::<ApiVersionsRequest>(),
        ],
        throttle_time_ms: None,
    }
}

/// Single broker cluster (ID 0, listening on `port`) leading every partition of the given topics.
pub(crate) fn metadata_response(port: u16, topics: &[(&str, i32)]) -> MetadataResponse {
    MetadataResponse {
        throttle_time_ms: Some(0),
        brokers: vec![MetadataResponseBroker {
            node_id: 0,
            host: "127.0.0.1".to_string(),
            port: i32::from(port),
            rack: None,
        }],
        cluster_id: None,
        controller_id: Some(0),
        topics: topics
            .iter()
            .map(|(name, partitions)| MetadataResponseTopic {
                error: None,
                name: name.to_string(),
                is_internal: Some(false),
                partitions: (0..*partitions)
                    .map(|partition_index| MetadataResponsePartition {
                        error: None,
                        partition_index,
                        leader_id: 0,
                        replica_nodes: vec![0],
                        isr_nodes: vec![0],
                    })
                    .collect(),
            })
            .collect(),
    }
}

//!
//! Store client and cluster fan-out
//! --------------------------------
//! Talks to storage servers over the HTTP boundary. In single-server mode
//! every request goes to one address. In cluster mode reads (`get`, `list`)
//! scatter to every configured peer concurrently and gather: the merged
//! response succeeds if any peer succeeded, streams are concatenated with
//! no deduplication, and the last error is kept only when nothing
//! succeeded. Writes route each stream to the consistent-hash owner of its
//! variable. Every request carries a 30 s deadline.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::config::ConfigManager;
use crate::error::{Result, StoreError};
use crate::protocol::{
    decode_body, encode_body, AddRequest, AddResponse, GetRequest, GetResponse, ListRequest,
    ListResponse, ServerState, StoreConfig, ValueStream, CONTENT_TYPE_BASE64,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

enum Mode {
    Single(String),
    Cluster(Arc<ConfigManager>),
}

pub struct StoreClient {
    http: reqwest::Client,
    mode: Mode,
}

impl StoreClient {
    /// Client for one storage server, addressed `host:port`.
    pub fn new<S: Into<String>>(address: S) -> Result<Self> {
        Ok(StoreClient {
            http: Self::http_client(DEFAULT_REQUEST_TIMEOUT)?,
            mode: Mode::Single(address.into()),
        })
    }

    /// Client for the whole cluster described by `config`. Preferred for
    /// scatter-gather reads.
    pub fn for_cluster(config: Arc<ConfigManager>) -> Result<Self> {
        Ok(StoreClient {
            http: Self::http_client(DEFAULT_REQUEST_TIMEOUT)?,
            mode: Mode::Cluster(config),
        })
    }

    fn http_client(timeout: Duration) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::NetworkFailure(e.to_string()))
    }

    /// Peers to contact for a fan-out read. Peers in a non-serving state
    /// are skipped unless that would leave nobody to ask.
    fn fanout_targets(config: &StoreConfig) -> Vec<String> {
        let serving: Vec<String> = config
            .servers
            .iter()
            .filter(|s| matches!(s.state, ServerState::Run | ServerState::Unknown))
            .map(|s| s.address.clone())
            .collect();
        if serving.is_empty() {
            config.servers.iter().map(|s| s.address.clone()).collect()
        } else {
            serving
        }
    }

    async fn send<Req, Resp>(&self, address: &str, path: &str, request: &Req) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("http://{address}{path}");
        let body = encode_body(request)?;
        debug!(target: "tidemark::client", "POST {url} ({} bytes)", body.len());
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_BASE64)
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::NetworkFailure(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        decode_body(&response.text().await?)
    }

    /// Record streams. Cluster mode shards by the hash ring: each stream
    /// goes to the node owning its variable.
    pub async fn add(&self, request: AddRequest) -> Result<AddResponse> {
        match &self.mode {
            Mode::Single(address) => self.send(address, "/add", &request).await,
            Mode::Cluster(config) => {
                let ring = config.ring();
                let mut by_node: std::collections::HashMap<String, AddRequest> = Default::default();
                for stream in request.streams {
                    let node = ring
                        .get_node(&stream.variable.to_string())
                        .map(|n| n.to_string())
                        .ok_or_else(|| {
                            StoreError::NetworkFailure("no servers configured".into())
                        })?;
                    by_node.entry(node).or_default().streams.push(stream);
                }
                let sends = by_node.iter().map(|(node, request)| async move {
                    self.send::<_, AddResponse>(node, "/add", request).await
                });
                let responses: Vec<Result<AddResponse>> = join_all(sends).await;
                Ok(merge_add(responses))
            }
        }
    }

    pub async fn list(&self, request: ListRequest) -> Result<ListResponse> {
        match &self.mode {
            Mode::Single(address) => self.send(address, "/list", &request).await,
            Mode::Cluster(config) => {
                let targets = Self::fanout_targets(&config.current());
                let request = &request;
                let sends = targets.iter().map(|address| async move {
                    self.send::<_, ListResponse>(address, "/list", request).await
                });
                let responses = join_all(sends).await;
                Ok(merge_list(responses))
            }
        }
    }

    pub async fn get(&self, request: GetRequest) -> Result<GetResponse> {
        match &self.mode {
            Mode::Single(address) => self.send(address, "/get", &request).await,
            Mode::Cluster(config) => {
                let targets = Self::fanout_targets(&config.current());
                let request = &request;
                let sends = targets.iter().map(|address| async move {
                    self.send::<_, GetResponse>(address, "/get", request).await
                });
                let responses = join_all(sends).await;
                Ok(merge_get(responses))
            }
        }
    }

    /// Fetch the active config from a single server.
    pub async fn get_config(&self) -> Result<StoreConfig> {
        let address = match &self.mode {
            Mode::Single(address) => address.clone(),
            Mode::Cluster(config) => Self::fanout_targets(&config.current())
                .into_iter()
                .next()
                .ok_or_else(|| StoreError::NetworkFailure("no servers configured".into()))?,
        };
        let url = format!("http://{address}/get_config");
        let response = self.http.get(&url).send().await?;
        decode_body(&response.text().await?)
    }
}

/// Gather rule shared by the fan-out reads: any success wins, streams
/// concatenate, and only an all-failure response carries an error message.
fn gather<T>(
    responses: Vec<Result<T>>,
    success_of: impl Fn(&T) -> (bool, Option<String>),
    streams_of: impl Fn(T) -> Vec<ValueStream>,
) -> (bool, Option<String>, Vec<ValueStream>) {
    let mut success = false;
    let mut message = Some("no responses".to_string());
    let mut streams = Vec::new();
    for response in responses {
        match response {
            Ok(r) => {
                let (ok, msg) = success_of(&r);
                if ok {
                    success = true;
                } else if let Some(msg) = msg {
                    message = Some(msg);
                }
                streams.extend(streams_of(r));
            }
            Err(e) => {
                warn!(target: "tidemark::client", "peer request failed: {e}");
                message = Some(e.to_string());
            }
        }
    }
    if success {
        message = None;
    }
    (success, message, streams)
}

fn merge_get(responses: Vec<Result<GetResponse>>) -> GetResponse {
    let (success, message, streams) = gather(
        responses,
        |r| (r.success, r.message.clone()),
        |r| r.streams,
    );
    GetResponse {
        success,
        message,
        streams,
    }
}

fn merge_list(responses: Vec<Result<ListResponse>>) -> ListResponse {
    let (success, message, streams) = gather(
        responses,
        |r| (r.success, r.message.clone()),
        |r| r.streams,
    );
    ListResponse {
        success,
        message,
        streams,
    }
}

fn merge_add(responses: Vec<Result<AddResponse>>) -> AddResponse {
    let mut success = !responses.is_empty();
    let mut message = None;
    for response in responses {
        match response {
            Ok(r) if r.success => {}
            Ok(r) => {
                success = false;
                message = r.message.or(message);
            }
            Err(e) => {
                success = false;
                message = Some(e.to_string());
            }
        }
    }
    AddResponse { success, message }
}

/// Redundant JSON-RPC 2.0 daemon client.
///
/// One logical call fans out over every configured upstream endpoint.
/// `execute_any` keeps the first clean response, `execute_all` keeps them
/// all in endpoint order, `execute_batch_any` ships a JSON-RPC batch.
/// Every failure class (connect, timeout, HTTP status, body parse, id
/// mismatch, JSON-RPC error object) is folded into `DaemonResponse::error`
/// so callers treat errors as ordinary data.

pub mod responses;

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use hyper::{Method, Request, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonEndpointConfig;

/// Synthetic error codes for failures below the JSON-RPC layer.
pub const ERR_TRANSPORT: i64 = -32001;
pub const ERR_HTTP_STATUS: i64 = -32002;
pub const ERR_TIMEOUT: i64 = -32003;
pub const ERR_CANCELLED: i64 = -32004;
pub const ERR_ID_MISMATCH: i64 = -32005;
pub const ERR_PARSE: i64 = -32700;

#[derive(Debug, Clone, Error, PartialEq)]
#[error("daemon error {code}: {message}")]
pub struct DaemonError {
    pub code: i64,
    pub message: String,
}

impl DaemonError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn transport(message: impl Into<String>) -> Self {
        Self::new(ERR_TRANSPORT, message)
    }

    fn parse(message: impl Into<String>) -> Self {
        Self::new(ERR_PARSE, message)
    }
}

#[derive(Debug, Clone)]
pub struct DaemonResponse<T> {
    pub result: Option<T>,
    pub error: Option<DaemonError>,
}

impl<T> DaemonResponse<T> {
    pub fn ok(result: T) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: DaemonError) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl DaemonResponse<Value> {
    fn typed<T: DeserializeOwned>(self) -> DaemonResponse<T> {
        if let Some(e) = self.error {
            return DaemonResponse::err(e);
        }
        match self.result {
            None => DaemonResponse {
                result: None,
                error: None,
            },
            Some(v) => match serde_json::from_value(v) {
                Ok(t) => DaemonResponse::ok(t),
                Err(e) => DaemonResponse::err(DaemonError::parse(format!(
                    "result deserialization failed: {}",
                    e
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcErrorObject {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

struct Endpoint {
    uri: Uri,
    label: String,
    auth: Option<String>,
    timeout: Duration,
}

pub struct DaemonClient {
    endpoints: Vec<Endpoint>,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    next_id: AtomicU64,
}

impl DaemonClient {
    pub fn new(configs: &[DaemonEndpointConfig]) -> anyhow::Result<Self> {
        let mut endpoints = Vec::with_capacity(configs.len());
        for cfg in configs {
            let url = cfg.url();
            let uri: Uri = url
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid daemon url '{}': {}", url, e))?;
            let auth = match (&cfg.user, &cfg.password) {
                (Some(user), pass) => {
                    let token = base64::engine::general_purpose::STANDARD.encode(format!(
                        "{}:{}",
                        user,
                        pass.as_deref().unwrap_or("")
                    ));
                    Some(format!("Basic {}", token))
                }
                _ => None,
            };
            endpoints.push(Endpoint {
                uri,
                label: format!("{}:{}", cfg.host, cfg.port),
                auth,
                timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
            });
        }
        if endpoints.is_empty() {
            anyhow::bail!("daemon client needs at least one endpoint");
        }

        let client = Client::builder(TokioExecutor::new()).build(HttpsConnector::new());

        Ok(Self {
            endpoints,
            client,
            next_id: AtomicU64::new(0),
        })
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Issue the call to every endpoint concurrently; first clean response
    /// wins. When every endpoint fails, the first endpoint's error response
    /// is returned rather than raised.
    pub async fn execute_any<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        ct: &CancellationToken,
    ) -> DaemonResponse<T> {
        let id = self.next_request_id();
        let payload = match serde_json::to_vec(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params: &params,
        }) {
            Ok(p) => p,
            Err(e) => return DaemonResponse::err(DaemonError::parse(e.to_string())),
        };

        let mut pending: FuturesUnordered<_> = self
            .endpoints
            .iter()
            .enumerate()
            .map(|(idx, ep)| {
                let payload = payload.clone();
                async move { (idx, self.execute_one(ep, payload, id, ct).await) }
            })
            .collect();

        let mut first_error: Option<(usize, DaemonResponse<Value>)> = None;
        while let Some((idx, resp)) = pending.next().await {
            if resp.is_ok() {
                return resp.typed();
            }
            match &first_error {
                Some((seen, _)) if *seen <= idx => {}
                _ => first_error = Some((idx, resp)),
            }
        }

        match first_error {
            Some((_, resp)) => resp.typed(),
            None => DaemonResponse::err(DaemonError::transport("no endpoints configured")),
        }
    }

    /// Await every endpoint; responses preserve endpoint order.
    pub async fn execute_all<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        ct: &CancellationToken,
    ) -> Vec<DaemonResponse<T>> {
        let id = self.next_request_id();
        let payload = match serde_json::to_vec(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params: &params,
        }) {
            Ok(p) => p,
            Err(e) => {
                let err = DaemonError::parse(e.to_string());
                return self
                    .endpoints
                    .iter()
                    .map(|_| DaemonResponse::err(err.clone()))
                    .collect();
            }
        };

        let futs = self
            .endpoints
            .iter()
            .map(|ep| self.execute_one(ep, payload.clone(), id, ct));
        futures::future::join_all(futs)
            .await
            .into_iter()
            .map(|r| r.typed())
            .collect()
    }

    /// Send one JSON-RPC batch per endpoint; results come from the first
    /// endpoint that returns a parseable batch, ordered like `cmds`.
    /// Sub-errors stay attached to their entries.
    pub async fn execute_batch_any(
        &self,
        cmds: &[(&str, Value)],
        ct: &CancellationToken,
    ) -> Vec<DaemonResponse<Value>> {
        let base_id = self.next_id.fetch_add(cmds.len() as u64, Ordering::Relaxed) + 1;
        let batch: Vec<Value> = cmds
            .iter()
            .enumerate()
            .map(|(i, (method, params))| {
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": base_id + i as u64,
                    "method": method,
                    "params": params,
                })
            })
            .collect();
        let payload = match serde_json::to_vec(&batch) {
            Ok(p) => p,
            Err(e) => {
                let err = DaemonError::parse(e.to_string());
                return cmds.iter().map(|_| DaemonResponse::err(err.clone())).collect();
            }
        };

        let mut first_error: Option<DaemonError> = None;
        for ep in &self.endpoints {
            match self.fetch_body(ep, payload.clone(), ct).await {
                Ok(bytes) => match serde_json::from_slice::<Vec<RpcResponse>>(&bytes) {
                    Ok(entries) => return Self::order_batch(entries, base_id, cmds.len()),
                    Err(e) => {
                        tracing::warn!("daemon {}: batch parse failed: {}", ep.label, e);
                        first_error
                            .get_or_insert_with(|| DaemonError::parse(e.to_string()));
                    }
                },
                Err(e) => {
                    tracing::warn!("daemon {}: batch request failed: {}", ep.label, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        let err = first_error
            .unwrap_or_else(|| DaemonError::transport("no endpoints configured"));
        cmds.iter().map(|_| DaemonResponse::err(err.clone())).collect()
    }

    fn order_batch(
        entries: Vec<RpcResponse>,
        base_id: u64,
        count: usize,
    ) -> Vec<DaemonResponse<Value>> {
        let mut out: Vec<DaemonResponse<Value>> = (0..count)
            .map(|_| {
                DaemonResponse::err(DaemonError::parse("missing batch entry"))
            })
            .collect();
        for entry in entries {
            let Some(id) = entry.id.as_u64() else { continue };
            if id < base_id {
                continue;
            }
            let idx = (id - base_id) as usize;
            if idx >= count {
                continue;
            }
            out[idx] = match entry.error {
                Some(e) => DaemonResponse::err(DaemonError::new(e.code, e.message)),
                None => DaemonResponse {
                    result: entry.result,
                    error: None,
                },
            };
        }
        out
    }

    async fn execute_one(
        &self,
        ep: &Endpoint,
        payload: Vec<u8>,
        expected_id: u64,
        ct: &CancellationToken,
    ) -> DaemonResponse<Value> {
        let bytes = match self.fetch_body(ep, payload, ct).await {
            Ok(b) => b,
            Err(e) => return DaemonResponse::err(e),
        };

        let parsed: RpcResponse = match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(e) => {
                return DaemonResponse::err(DaemonError::parse(format!(
                    "{}: invalid response body: {}",
                    ep.label, e
                )))
            }
        };

        if let Some(e) = parsed.error {
            return DaemonResponse::err(DaemonError::new(e.code, e.message));
        }

        if parsed.id.as_u64() != Some(expected_id) {
            return DaemonResponse::err(DaemonError::new(
                ERR_ID_MISMATCH,
                format!("{}: response id does not match request", ep.label),
            ));
        }

        DaemonResponse {
            result: parsed.result,
            error: None,
        }
    }

    /// One HTTP round-trip: auth, compression negotiation, status check.
    async fn fetch_body(
        &self,
        ep: &Endpoint,
        payload: Vec<u8>,
        ct: &CancellationToken,
    ) -> Result<Vec<u8>, DaemonError> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(ep.uri.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT_ENCODING, "gzip, deflate");
        if let Some(auth) = &ep.auth {
            builder = builder.header(AUTHORIZATION, auth.as_str());
        }
        let request = builder
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| DaemonError::transport(e.to_string()))?;

        let response = tokio::select! {
            _ = ct.cancelled() => {
                return Err(DaemonError::new(ERR_CANCELLED, "call cancelled"));
            }
            r = tokio::time::timeout(ep.timeout, self.client.request(request)) => match r {
                Err(_) => {
                    return Err(DaemonError::new(
                        ERR_TIMEOUT,
                        format!("{}: request timed out", ep.label),
                    ))
                }
                Ok(Err(e)) => {
                    return Err(DaemonError::transport(format!("{}: {}", ep.label, e)))
                }
                Ok(Ok(resp)) => resp,
            },
        };

        let status = response.status();
        let encoding = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase());

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DaemonError::transport(format!("{}: {}", ep.label, e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(DaemonError::new(
                ERR_HTTP_STATUS,
                format!("{}: http status {}", ep.label, status),
            ));
        }

        decode_body(&body, encoding.as_deref())
    }
}

fn decode_body(body: &[u8], encoding: Option<&str>) -> Result<Vec<u8>, DaemonError> {
    match encoding {
        Some("gzip") => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| DaemonError::parse(format!("gzip decode failed: {}", e)))?;
            Ok(out)
        }
        Some("deflate") => {
            // Zlib-wrapped first; fall back to a raw deflate stream.
            let mut out = Vec::new();
            if flate2::read::ZlibDecoder::new(body)
                .read_to_end(&mut out)
                .is_ok()
            {
                return Ok(out);
            }
            let mut out = Vec::new();
            flate2::read::DeflateDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| DaemonError::parse(format!("deflate decode failed: {}", e)))?;
            Ok(out)
        }
        _ => Ok(body.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn endpoint(addr: SocketAddr) -> DaemonEndpointConfig {
        DaemonEndpointConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            http_path: "/".to_string(),
            ssl: false,
            user: None,
            password: None,
            timeout_secs: 2,
        }
    }

    /// Minimal canned-response HTTP server for client tests.
    async fn serve(body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    let mut seen = Vec::new();
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) => return,
                            Ok(n) => {
                                seen.extend_from_slice(&buf[..n]);
                                if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn execute_any_returns_result() {
        let addr = serve(r#"{"jsonrpc":"2.0","id":1,"result":{"blocks":42,"connections":3}}"#)
            .await;
        let client = DaemonClient::new(&[endpoint(addr)]).unwrap();
        let ct = CancellationToken::new();

        let resp: DaemonResponse<responses::GetInfoResponse> = client
            .execute_any(responses::methods::GET_INFO, serde_json::json!([]), &ct)
            .await;
        assert!(resp.is_ok());
        assert_eq!(resp.result.unwrap().blocks, 42);
    }

    #[tokio::test]
    async fn id_mismatch_is_an_error_not_a_panic() {
        let addr = serve(r#"{"jsonrpc":"2.0","id":999,"result":true}"#).await;
        let client = DaemonClient::new(&[endpoint(addr)]).unwrap();
        let ct = CancellationToken::new();

        let resp: DaemonResponse<bool> = client
            .execute_any("getinfo", serde_json::json!([]), &ct)
            .await;
        let err = resp.error.expect("id mismatch should surface as error");
        assert_eq!(err.code, ERR_ID_MISMATCH);
    }

    #[tokio::test]
    async fn rpc_error_object_is_carried() {
        let addr = serve(
            r#"{"jsonrpc":"2.0","id":1,"result":null,"error":{"code":-10,"message":"Bitcoin is downloading blocks..."}}"#,
        )
        .await;
        let client = DaemonClient::new(&[endpoint(addr)]).unwrap();
        let ct = CancellationToken::new();

        let resp: DaemonResponse<Value> = client
            .execute_any("getblocktemplate", serde_json::json!([]), &ct)
            .await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, -10);
    }

    #[tokio::test]
    async fn all_endpoints_down_returns_first_error() {
        // Bind then drop to find a dead port.
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let client = DaemonClient::new(&[endpoint(dead)]).unwrap();
        let ct = CancellationToken::new();

        let resp: DaemonResponse<Value> = client
            .execute_any("getinfo", serde_json::json!([]), &ct)
            .await;
        assert!(resp.error.is_some());
    }

    #[tokio::test]
    async fn execute_all_preserves_endpoint_order() {
        let a = serve(r#"{"jsonrpc":"2.0","id":1,"result":"a"}"#).await;
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let client = DaemonClient::new(&[endpoint(a), endpoint(dead)]).unwrap();
        let ct = CancellationToken::new();

        let resps: Vec<DaemonResponse<String>> = client
            .execute_all("getinfo", serde_json::json!([]), &ct)
            .await;
        assert_eq!(resps.len(), 2);
        assert_eq!(resps[0].result.as_deref(), Some("a"));
        assert!(resps[1].error.is_some());
    }

    #[tokio::test]
    async fn cancelled_call_reports_cancellation() {
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let client = DaemonClient::new(&[endpoint(dead)]).unwrap();
        let ct = CancellationToken::new();
        ct.cancel();

        let resp: DaemonResponse<Value> = client
            .execute_any("getinfo", serde_json::json!([]), &ct)
            .await;
        // Either the cancellation or the refused connection surfaces; both are errors.
        assert!(resp.error.is_some());
    }

    #[tokio::test]
    async fn batch_results_follow_command_order() {
        // Batch entries echoed out of order; sub-error attached to the second.
        let addr = serve(
            r#"[{"jsonrpc":"2.0","id":2,"error":{"code":-8,"message":"bad params"}},{"jsonrpc":"2.0","id":1,"result":"first"}]"#,
        )
        .await;
        let client = DaemonClient::new(&[endpoint(addr)]).unwrap();
        let ct = CancellationToken::new();

        let results = client
            .execute_batch_any(
                &[
                    ("getinfo", serde_json::json!([])),
                    ("getblock", serde_json::json!(["xx"])),
                ],
                &ct,
            )
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0].result.as_ref().and_then(|v| v.as_str()),
            Some("first")
        );
        let err = results[1].error.as_ref().unwrap();
        assert_eq!(err.code, -8);
    }

    #[test]
    fn gzip_body_decodes() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"{\"ok\":true}").unwrap();
        let compressed = enc.finish().unwrap();

        let out = decode_body(&compressed, Some("gzip")).unwrap();
        assert_eq!(out, b"{\"ok\":true}");
    }

    #[test]
    fn monotonic_request_ids() {
        let cfg = DaemonEndpointConfig {
            host: "127.0.0.1".into(),
            port: 1,
            http_path: "/".into(),
            ssl: false,
            user: None,
            password: None,
            timeout_secs: 1,
        };
        let client = DaemonClient::new(&[cfg]).unwrap();
        let a = client.next_request_id();
        let b = client.next_request_id();
        assert!(b > a);
    }
}

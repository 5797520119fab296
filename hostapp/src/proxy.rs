//! Proxy Engine: terminates HTTP/WebSocket/SSE traffic on the Host App
//! surface and relays it into a target inside one cluster. The server-side
//! axum `Router`/`State` wiring follows `meta::server`; the WebSocket upgrade
//! handshake follows `frusta::server::ws_handler`. The reverse-proxy copy
//! loop itself has no teacher counterpart (the corpus has no general-purpose
//! HTTP reverse proxy) and is new, built from `reqwest`'s streaming body and
//! `tokio_tungstenite`'s client, the crate `kube-rs/kube` itself reaches for
//! on the WebSocket side of its own `ws` feature.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use kube::api::ListParams;
use kube::{Api, Client};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use guildnet_types::Cluster;

use crate::error::{Error, Result};
use crate::kube_factory::{KubeClientFactory, ResolutionPath};

const RESOLUTION_TTL: Duration = Duration::from_secs(30);
const MAX_RESPONSE_BYTES: u64 = 10 * 1024 * 1024;
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The path used to reach the target, recorded per request for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    DirectService,
    PodDirect,
    PortForward,
    ApiServerProxy,
}

#[derive(Clone)]
struct ResolvedTarget {
    base_url: String,
    mode: ProxyMode,
    resolved_at: Instant,
}

struct PortForwardHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl Drop for PortForwardHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct ProxyEngine {
    kube: Arc<KubeClientFactory>,
    http: reqwest::Client,
    resolved: Mutex<HashMap<(Uuid, String), ResolvedTarget>>,
    forwards: Mutex<HashMap<(Uuid, String, u16), Arc<PortForwardHandle>>>,
}

impl ProxyEngine {
    pub fn new(kube: Arc<KubeClientFactory>) -> Self {
        Self {
            kube,
            http: reqwest::Client::new(),
            resolved: Mutex::new(HashMap::new()),
            forwards: Mutex::new(HashMap::new()),
        }
    }

    /// Drops a cached resolution, forcing the next request to re-resolve.
    /// Called by the controller when a workspace's status changes.
    pub async fn invalidate(&self, cluster_id: Uuid, workspace: &str) {
        self.resolved
            .lock()
            .await
            .remove(&(cluster_id, workspace.to_string()));
    }

    async fn resolve(&self, cluster: &Cluster, client: &Client, workspace: &str) -> Result<(String, ProxyMode)> {
        let key = (cluster.id, workspace.to_string());
        if let Some(cached) = self.resolved.lock().await.get(&key).cloned()
            && cached.resolved_at.elapsed() < RESOLUTION_TTL
        {
            return Ok((cached.base_url, cached.mode));
        }

        let ns = if cluster.settings.namespace.is_empty() {
            "default".to_string()
        } else {
            cluster.settings.namespace.clone()
        };
        let ws = KubeClientFactory::get_workspace(client, &ns, workspace).await?;
        let port = ws
            .spec
            .ports
            .first()
            .map(|p| p.container_port as u16)
            .ok_or_else(|| Error::ValidationFailed(vec![format!("workspace {workspace} declares no ports")]))?;

        let (base_url, mode) = match KubeClientFactory::resolution_path(&cluster.settings) {
            ResolutionPath::ExplicitProxyUrl => {
                let url = cluster
                    .settings
                    .proxy_url_override
                    .clone()
                    .expect("resolution_path only returns ExplicitProxyUrl when set");
                (url, ProxyMode::DirectService)
            }
            ResolutionPath::ApiServerProxy => (
                format!("/api/v1/namespaces/{ns}/services/{workspace}:{port}/proxy"),
                ProxyMode::ApiServerProxy,
            ),
            ResolutionPath::PortForward => {
                let pod_name = first_pod_name(client, &ns, workspace).await?;
                let handle = self
                    .port_forward(cluster.id, workspace, client.clone(), &ns, &pod_name, port)
                    .await?;
                (format!("http://{}", handle.local_addr), ProxyMode::PortForward)
            }
            ResolutionPath::DirectApiAddress if cluster.settings.prefer_pod_proxy => {
                let pod_name = first_pod_name(client, &ns, workspace).await?;
                let (ip, pod_port) = KubeClientFactory::pod_address(client, &ns, &pod_name).await?;
                (format!("http://{ip}:{pod_port}"), ProxyMode::PodDirect)
            }
            ResolutionPath::DirectApiAddress => {
                let dns = ws
                    .status
                    .as_ref()
                    .and_then(|s| s.service_dns.clone())
                    .ok_or_else(|| Error::Unreachable(format!("workspace {workspace} has no service DNS yet")))?;
                (format!("http://{dns}:{port}"), ProxyMode::DirectService)
            }
        };

        self.resolved.lock().await.insert(
            key,
            ResolvedTarget {
                base_url: base_url.clone(),
                mode,
                resolved_at: Instant::now(),
            },
        );
        Ok((base_url, mode))
    }

    /// Opens a local loopback listener that forwards every accepted
    /// connection through a fresh port-forward session to the pod. One
    /// handle per (cluster, workspace, port); the last `Arc` clone dropping
    /// cancels the background task and closes the listener.
    async fn port_forward(
        &self,
        cluster_id: Uuid,
        workspace: &str,
        client: Client,
        ns: &str,
        pod_name: &str,
        port: u16,
    ) -> Result<Arc<PortForwardHandle>> {
        let fkey = (cluster_id, workspace.to_string(), port);
        if let Some(existing) = self.forwards.lock().await.get(&fkey) {
            return Ok(existing.clone());
        }

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.map_err(Error::Io)?;
        let local_addr = listener.local_addr().map_err(Error::Io)?;
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let pod_name = pod_name.to_string();
        let ns = ns.to_string();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    a = listener.accept() => a,
                    _ = task_cancel.cancelled() => break,
                };
                let Ok((local, _addr)) = accepted else { continue };
                let client = client.clone();
                let pod_name = pod_name.clone();
                let ns = ns.clone();
                tokio::spawn(async move {
                    if let Err(e) = pump_one_forward(client, &ns, &pod_name, port, local).await {
                        warn!(error = %e, pod_name, "port-forward connection ended");
                    }
                });
            }
        });

        let handle = Arc::new(PortForwardHandle { local_addr, cancel });
        self.forwards.lock().await.insert(fkey, handle.clone());
        Ok(handle)
    }

    /// Proxies a plain HTTP request (including SSE/chunked bodies, which are
    /// streamed rather than buffered). Caller is responsible for detecting a
    /// WebSocket upgrade before calling this.
    pub async fn proxy_http(
        &self,
        cluster: &Cluster,
        client: &Client,
        workspace: &str,
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        body: Body,
    ) -> Result<Response> {
        let (base_url, mode) = self.resolve(cluster, client, workspace).await?;
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

        if mode == ProxyMode::ApiServerProxy {
            return self
                .proxy_via_api_server(client, &base_url, method, path_and_query, headers, body)
                .await;
        }

        let url = format!("{}{}", base_url.trim_end_matches('/'), path_and_query);

        let mut builder = self.http.request(method, &url);
        for (name, value) in filter_headers(&headers) {
            builder = builder.header(name, value);
        }
        for (name, value) in forwarded_headers(&headers) {
            builder = builder.header(name, value);
        }

        let stream = body.into_data_stream();
        let resp = builder
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| Error::Unreachable(format!("proxy to {workspace} ({mode:?}) failed: {e}")))?;

        if let Some(len) = resp.content_length()
            && len > MAX_RESPONSE_BYTES
        {
            return Err(Error::Upstream(format!("response from {workspace} exceeds size limit")));
        }

        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut out = Response::builder().status(status);
        for (name, value) in resp.headers() {
            if HOP_BY_HOP.contains(&name.as_str().to_ascii_lowercase().as_str()) {
                continue;
            }
            out = out.header(name, value);
        }
        out.body(Body::from_stream(resp.bytes_stream()))
            .map_err(|e| Error::Internal(e.to_string()))
    }

    /// Proxies through the Kubernetes API server's service-proxy subresource
    /// instead of dialing the workspace directly, so the request carries the
    /// kube client's own auth and TLS. The API server's raw-request surface
    /// takes a buffered body and reports no status line of its own on
    /// success, unlike the other modes' direct streaming copy.
    async fn proxy_via_api_server(
        &self,
        client: &Client,
        path_prefix: &str,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Body,
    ) -> Result<Response> {
        let body_bytes = axum::body::to_bytes(body, MAX_RESPONSE_BYTES as usize)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        let mut builder = axum::http::Request::builder().method(method).uri(format!("{path_prefix}{path_and_query}"));
        for (name, value) in filter_headers(&headers) {
            builder = builder.header(name, value);
        }
        for (name, value) in forwarded_headers(&headers) {
            builder = builder.header(name, value);
        }
        let request = builder
            .body(body_bytes.to_vec())
            .map_err(|e| Error::Internal(e.to_string()))?;
        let stream = client.request_stream(request).await.map_err(Error::Kube)?;
        let body = Body::from_stream(ReaderStream::new(stream.compat()));
        Response::builder()
            .status(StatusCode::OK)
            .body(body)
            .map_err(|e| Error::Internal(e.to_string()))
    }

    /// Upgrades the inbound connection and tunnels frames verbatim to/from
    /// the resolved upstream until either side closes.
    pub async fn tunnel_websocket(
        &self,
        ws: WebSocketUpgrade,
        cluster: Cluster,
        client: Client,
        workspace: String,
    ) -> Result<Response> {
        let (base_url, _mode) = self.resolve(&cluster, &client, &workspace).await?;
        let upstream_url = base_url.replacen("http://", "ws://", 1).replacen("https://", "wss://", 1);
        Ok(ws.on_upgrade(move |socket| relay(socket, upstream_url)))
    }
}

async fn relay(socket: WebSocket, upstream_url: String) {
    let upstream = match tokio_tungstenite::connect_async(&upstream_url).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!(error = %e, upstream_url, "websocket upstream connect failed");
            return;
        }
    };

    let (mut down_tx, mut down_rx) = socket.split();
    let (mut up_tx, mut up_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = down_rx.next().await {
            let forwarded = match msg {
                AxumMessage::Text(t) => WsMessage::Text(t.as_str().into()),
                AxumMessage::Binary(b) => WsMessage::Binary(b),
                AxumMessage::Ping(b) => WsMessage::Ping(b),
                AxumMessage::Pong(b) => WsMessage::Pong(b),
                AxumMessage::Close(_) => break,
            };
            if up_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = up_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = up_rx.next().await {
            let forwarded = match msg {
                WsMessage::Text(t) => AxumMessage::Text(t.as_str().into()),
                WsMessage::Binary(b) => AxumMessage::Binary(b),
                WsMessage::Ping(b) => AxumMessage::Ping(b),
                WsMessage::Pong(b) => AxumMessage::Pong(b),
                WsMessage::Close(_) | WsMessage::Frame(_) => break,
            };
            if down_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = down_tx.close().await;
    };

    tokio::join!(client_to_upstream, upstream_to_client);
}

async fn pump_one_forward(
    client: Client,
    ns: &str,
    pod_name: &str,
    port: u16,
    mut local: tokio::net::TcpStream,
) -> Result<()> {
    let mut forwarder = KubeClientFactory::port_forward(&client, ns, pod_name, port).await?;
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| Error::Unreachable(format!("port-forward to {pod_name}:{port} produced no stream")))?;
    tokio::io::copy_bidirectional(&mut local, &mut upstream)
        .await
        .map_err(Error::Io)?;
    Ok(())
}

async fn first_pod_name(client: &Client, ns: &str, workspace: &str) -> Result<String> {
    let pods: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(client.clone(), ns);
    let selector = format!("guildnet.io/workspace={workspace}");
    let list = pods
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::Kube)?;
    list.items
        .into_iter()
        .find(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running"))
        .and_then(|p| p.metadata.name)
        .ok_or_else(|| Error::Unreachable(format!("no running pod for workspace {workspace}")))
}

fn filter_headers(headers: &HeaderMap) -> Vec<(HeaderName, HeaderValue)> {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str().to_ascii_lowercase().as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Builds the `X-Forwarded-*` headers added on top of the copied inbound
/// headers. `Proto` is always `http` (the Engine never terminates TLS
/// itself); `Host` mirrors the inbound `Host` header. `X-Forwarded-For` is
/// left to `filter_headers`'s verbatim copy of any inbound value — the
/// Engine isn't given the peer address at this layer, so it appends nothing
/// rather than fabricate one.
fn forwarded_headers(headers: &HeaderMap) -> Vec<(HeaderName, HeaderValue)> {
    let mut out = vec![(HeaderName::from_static("x-forwarded-proto"), HeaderValue::from_static("http"))];
    if let Some(host) = headers.get(axum::http::header::HOST).cloned() {
        out.push((HeaderName::from_static("x-forwarded-host"), host));
    }
    out
}

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use anyhow::Context as _;
use bytes::Bytes;
use hyper::{
    Request, Response, StatusCode, Uri, Version,
    body::Incoming,
    header::{self, HeaderName},
    service::service_fn,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::Instrument as _;

use crate::{
    body::{ProxyBody, boxed_full, boxed_incoming},
    capture::CaptureMiddleware,
    config::Config,
    hooks::EventBus,
    store::MessageStore,
    tap::TapRegistry,
};

type UpstreamConnector = HttpsConnector<HttpConnector>;
type UpstreamClient = Client<UpstreamConnector, ProxyBody>;

pub struct ServerHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct ServerState {
    capture: CaptureMiddleware,
    upstream: Uri,
    client: UpstreamClient,
}

pub async fn serve(config: &Config) -> anyhow::Result<ServerHandle> {
    serve_with_hooks(config, EventBus::new()).await
}

/// Binds the listener and serves an instrumented reverse proxy in front of
/// `server.upstream`, with `hooks` subscribed to capture events.
pub async fn serve_with_hooks(config: &Config, hooks: EventBus) -> anyhow::Result<ServerHandle> {
    ensure_rustls_crypto_provider()?;

    let upstream = parse_upstream(config)?;
    let store = MessageStore::from_config(config)?;
    let seeded = TapRegistry::new(&store)
        .seed_taps(&config.tap_patterns())
        .await
        .context("seed configured taps")?;
    if !seeded.is_empty() {
        tracing::info!(count = seeded.len(), "seeded taps from config");
    }
    let capture = CaptureMiddleware::from_config(config, store, hooks);

    let listener = TcpListener::bind(config.server.listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", config.server.listen))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;
    tracing::info!(listen = %listen_addr, upstream = %upstream, "wiretap listening");

    let state = Arc::new(ServerState {
        capture,
        upstream,
        client: build_upstream_client()?,
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service =
                            service_fn(move |req| handle_request(req, peer, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ServerHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

fn parse_upstream(config: &Config) -> anyhow::Result<Uri> {
    let raw = config
        .server
        .upstream
        .as_deref()
        .context("server.upstream is required to serve")?;
    let upstream: Uri = raw
        .parse()
        .with_context(|| format!("parse server.upstream `{raw}`"))?;
    if !matches!(upstream.scheme_str(), Some("http" | "https")) || upstream.authority().is_none()
    {
        anyhow::bail!("server.upstream `{raw}` must be an absolute http(s) URI");
    }
    Ok(upstream)
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn build_upstream_client() -> anyhow::Result<UpstreamClient> {
    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

async fn handle_request(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<Response<ProxyBody>, Infallible> {
    let req = req.map(boxed_incoming);
    let request_span = tracing::info_span!(
        "wiretap.request",
        method = %req.method(),
        path = %req.uri().path(),
    );

    let response = state
        .capture
        .handle(req, remote_addr, |req| forward_upstream(&state, req))
        .instrument(request_span)
        .await;
    match response {
        Ok(response) => Ok(response),
        Err(err) => {
            tracing::error!("capture pipeline failed: {err:#}");
            Ok(simple_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "capture pipeline failed",
            ))
        }
    }
}

async fn forward_upstream(
    state: &ServerState,
    req: Request<ProxyBody>,
) -> anyhow::Result<Response<ProxyBody>> {
    let (mut parts, body) = req.into_parts();
    parts.uri = match build_upstream_uri(&state.upstream, &parts.uri) {
        Ok(uri) => uri,
        Err(err) => {
            tracing::debug!("failed to build upstream uri: {err}");
            return Ok(simple_response(
                StatusCode::BAD_GATEWAY,
                "failed to build upstream request",
            ));
        }
    };
    parts.version = Version::HTTP_11;
    strip_hop_by_hop_headers(&mut parts.headers);
    parts.headers.remove(header::HOST);

    match state.client.request(Request::from_parts(parts, body)).await {
        Ok(upstream_response) => {
            let (mut parts, body) = upstream_response.into_parts();
            strip_hop_by_hop_headers(&mut parts.headers);
            Ok(Response::from_parts(parts, boxed_incoming(body)))
        }
        Err(err) => {
            tracing::warn!(upstream = %state.upstream, "upstream request failed: {err}");
            Ok(simple_response(
                StatusCode::BAD_GATEWAY,
                "upstream request failed",
            ))
        }
    }
}

fn build_upstream_uri(upstream_base: &Uri, original: &Uri) -> anyhow::Result<Uri> {
    let mut parts = original.clone().into_parts();
    parts.scheme = upstream_base.scheme().cloned();
    parts.authority = upstream_base.authority().cloned();
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some("/".parse()?);
    }
    Uri::from_parts(parts).map_err(|err| anyhow::anyhow!("construct upstream uri: {err}"))
}

fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
        .collect();
    for header_name in listed {
        headers.remove(header_name);
    }

    const STANDARD: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for header_name in STANDARD {
        headers.remove(*header_name);
    }
}

fn simple_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use hyper::{HeaderMap, Uri, header::HeaderValue};

    use super::{build_upstream_uri, parse_upstream, strip_hop_by_hop_headers};
    use crate::config::Config;

    #[test]
    fn upstream_uri_keeps_path_and_query() {
        let base: Uri = "https://api.example.test:8443".parse().unwrap();
        let original: Uri = "/v1/items?page=2".parse().unwrap();
        let upstream = build_upstream_uri(&base, &original).unwrap();
        assert_eq!(
            upstream.to_string(),
            "https://api.example.test:8443/v1/items?page=2"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        strip_hop_by_hop_headers(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-session").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn upstream_must_be_configured_and_absolute() {
        let missing = Config::from_toml_str("").unwrap();
        assert!(
            parse_upstream(&missing)
                .unwrap_err()
                .to_string()
                .contains("server.upstream is required")
        );

        let relative = Config::from_toml_str("[server]\nupstream = \"/relative\"").unwrap();
        assert!(
            parse_upstream(&relative)
                .unwrap_err()
                .to_string()
                .contains("absolute http(s) URI")
        );

        let ok = Config::from_toml_str("[server]\nupstream = \"http://127.0.0.1:3000\"").unwrap();
        assert_eq!(
            parse_upstream(&ok).unwrap().authority().unwrap().as_str(),
            "127.0.0.1:3000"
        );
    }
}

//! The Wormhole Proxy (§4.6): a plain HTTP reverse proxy that connects
//! `iptables`-redirected egress traffic to whatever the `Fence-Orig-Dest`
//! header (or, failing that, the `Host` header) names as the real
//! destination, expanding Kubernetes short names along the way.

use bytes::Bytes;
use fence_core::ClusterInfo;
use fence_k8s_index::SharedServiceNameIndex;
use http::header::HeaderValue;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{info, warn};

const HEADER_SOURCE_NS: &str = "fence-source-ns";
const HEADER_ORIG_DEST: &str = "fence-orig-dest";

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

#[derive(Clone)]
pub struct WormholeProxy {
    wormhole_port: u16,
    services: SharedServiceNameIndex,
    client: Client<HttpConnector, Incoming>,
}

impl WormholeProxy {
    pub fn new(cluster_info: &ClusterInfo, services: SharedServiceNameIndex) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_keepalive(Some(Duration::from_secs(30)));
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);
        Self { wormhole_port: cluster_info.wormhole_port, services, client }
    }

    pub async fn proxy(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let mut req_host = match req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
        {
            Some(host) => host.to_string(),
            None => return bad_request("missing Host header"),
        };
        info!(%method, host = %req_host, "request");

        if let Some(ns) = take_header(&mut req, HEADER_SOURCE_NS) {
            if !ns.is_empty() {
                req_host = self.expand_short_name(&ns, &req_host);
            }
        }

        let mut orig_dest_ip = None;
        let mut orig_dest_port = self.wormhole_port.to_string();
        if let Some(orig_dest) = take_header(&mut req, HEADER_ORIG_DEST) {
            match split_host_port(&orig_dest) {
                Some((ip, port)) => {
                    if port.is_empty() {
                        return bad_request(&format!(
                            "invalid header {HEADER_ORIG_DEST} value: {orig_dest}"
                        ));
                    }
                    orig_dest_port = port;
                    orig_dest_ip = Some(ip);
                }
                None => orig_dest_ip = Some(orig_dest),
            }
        }
        let orig_dest_ip = orig_dest_ip.unwrap_or_else(|| match split_host_port(&req_host) {
            Some((ip, _)) => ip,
            None => req_host.clone(),
        });

        let Ok(host_header) = HeaderValue::from_str(&req_host) else {
            return bad_request("invalid Host header");
        };
        req.headers_mut().insert(http::header::HOST, host_header);

        let authority = format!("{orig_dest_ip}:{orig_dest_port}");
        let path_and_query = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let uri = match Uri::builder()
            .scheme("http")
            .authority(authority.clone())
            .path_and_query(path_and_query)
            .build()
        {
            Ok(uri) => uri,
            Err(error) => return bad_request(&format!("invalid dial target: {error}")),
        };
        *req.uri_mut() = uri;

        match self.client.request(req).await {
            Ok(resp) => resp.map(BodyExt::boxed),
            Err(error) => {
                warn!(%error, %authority, "wormhole dial failed");
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Mirrors the original's ambiguous short-name rule: only a bare
    /// (dot-free) `Host` is a candidate, and it is only rewritten to
    /// `name.namespace` when the service cache is unpopulated (meaning
    /// short-name expansion is not gated by a live watch) or already
    /// knows about the service.
    fn expand_short_name(&self, source_ns: &str, req_host: &str) -> String {
        let (name_part, port) = match split_host_port(req_host) {
            Some((name, port)) => (name, Some(port)),
            None => (req_host.to_string(), None),
        };
        if name_part.contains('.') {
            return req_host.to_string();
        }
        let svc = fence_core::ServiceRef::new(source_ns.to_string(), name_part.clone());
        let services = self.services.read();
        if !services.is_empty() && !services.contains(&svc) {
            return req_host.to_string();
        }
        drop(services);
        match port {
            Some(port) => format!("{}.{}:{}", svc.name, svc.namespace, port),
            None => format!("{}.{}", svc.name, svc.namespace),
        }
    }
}

fn take_header(req: &mut Request<Incoming>, name: &str) -> Option<String> {
    let value = req.headers_mut().remove(name)?;
    value.to_str().ok().map(str::to_string)
}

fn split_host_port(value: &str) -> Option<(String, String)> {
    let idx = value.rfind(':')?;
    Some((value[..idx].to_string(), value[idx + 1..].to_string()))
}

fn bad_request(message: &str) -> Response<ProxyBody> {
    warn!(%message, "rejecting request");
    let body = Full::from(Bytes::copy_from_slice(message.as_bytes()))
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::BAD_REQUEST;
    resp
}

fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let body = Empty::new().map_err(|never: std::convert::Infallible| match never {}).boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}

/// Accepts connections on `listener`, serving each with `proxy` until
/// `shutdown` fires. Mirrors the grpc ingestor's drain/release pattern:
/// stop accepting, then let the release handle track in-flight requests.
pub async fn serve(
    listener: tokio::net::TcpListener,
    proxy: WormholeProxy,
    shutdown: drain::Watch,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
    let accept = async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _peer) = accepted?;
                    let proxy = proxy.clone();
                    tokio::spawn(async move {
                        let io = hyper_util::rt::TokioIo::new(stream);
                        let svc = hyper::service::service_fn(move |req| {
                            let proxy = proxy.clone();
                            async move { Ok::<_, std::convert::Infallible>(proxy.proxy(req).await) }
                        });
                        let conn = hyper_util::server::conn::http1::Builder::new()
                            .serve_connection(io, svc);
                        if let Err(error) = conn.await {
                            warn!(%error, "wormhole connection error");
                        }
                    });
                }
                _ = &mut stop_rx => return Ok::<_, anyhow::Error>(()),
            }
        }
    };

    info!(%local_addr, "wormhole proxy listening");
    tokio::pin!(accept);
    tokio::select! {
        res = &mut accept => res?,
        handle = shutdown.signaled() => {
            let _ = stop_tx.send(());
            handle.release_after(accept).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fence_k8s_index::ServiceNameIndex;

    fn cluster_info() -> ClusterInfo {
        ClusterInfo {
            controller_namespace: "fence".into(),
            mesh_system_namespace: "istio-system".into(),
            auto_fence: true,
            wormhole_port: 80,
            sidecar_container_name: "istio-proxy".into(),
        }
    }

    #[test]
    fn expand_short_name_leaves_dotted_host_alone() {
        let proxy = WormholeProxy::new(&cluster_info(), ServiceNameIndex::shared());
        assert_eq!(proxy.expand_short_name("ops", "cart.ops.svc.cluster.local"), "cart.ops.svc.cluster.local");
    }

    #[test]
    fn expand_short_name_always_expands_when_index_unpopulated() {
        let proxy = WormholeProxy::new(&cluster_info(), ServiceNameIndex::shared());
        assert_eq!(proxy.expand_short_name("ops", "cart"), "cart.ops");
        assert_eq!(proxy.expand_short_name("ops", "cart:8080"), "cart.ops:8080");
    }

    #[test]
    fn expand_short_name_skips_unknown_service_once_index_populated() {
        use kubert::index::IndexNamespacedResource;
        let services = ServiceNameIndex::shared();
        {
            let mut w = services.write();
            w.apply(k8s_service("ops", "cart"));
        }
        let proxy = WormholeProxy::new(&cluster_info(), services);
        assert_eq!(proxy.expand_short_name("ops", "cart"), "cart.ops");
        assert_eq!(proxy.expand_short_name("ops", "unknown"), "unknown");
    }

    fn k8s_service(namespace: &str, name: &str) -> fence_k8s_api::Service {
        fence_k8s_api::Service {
            metadata: fence_k8s_api::ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: None,
            status: None,
        }
    }

    #[test]
    fn split_host_port_splits_on_last_colon() {
        assert_eq!(split_host_port("10.0.0.1:8080"), Some(("10.0.0.1".to_string(), "8080".to_string())));
        assert_eq!(split_host_port("10.0.0.1"), None);
    }
}

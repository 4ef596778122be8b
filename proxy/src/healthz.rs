//! A bare liveness endpoint bound to `PROBE_PORT`: any path, any method,
//! always 200. Deliberately dumber than the admin server the controller
//! binary exposes — this process has nothing worth reporting beyond "up".

use http_body_util::Empty;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::http1;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

async fn respond(_req: Request<Incoming>) -> Result<Response<Empty<Bytes>>, Infallible> {
    let mut resp = Response::new(Empty::new());
    *resp.status_mut() = StatusCode::OK;
    Ok(resp)
}

pub async fn serve(addr: SocketAddr, shutdown: drain::Watch) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "health check listening");
    tokio::pin! {
        let signaled = shutdown.signaled();
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _peer) = accepted?;
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    if let Err(error) = http1::Builder::new()
                        .serve_connection(io, hyper::service::service_fn(respond))
                        .await
                    {
                        warn!(%error, "health check connection error");
                    }
                });
            }
            handle = &mut signaled => {
                drop(handle);
                return Ok(());
            }
        }
    }
}

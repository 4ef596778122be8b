#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The Access-Log Ingestor (§4.7): a gRPC server that receives batches of
//! HTTP access log entries and feeds each one to the Egress Learner
//! sequentially. Never leader-gated — every replica ingests.

use fence_core::AccessLogEntry;
use fence_k8s_index::FenceReconciler;
use std::net::SocketAddr;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, instrument, warn};

pub mod pb {
    tonic::include_proto!("fence.accesslog.v1");
}

use pb::access_log_service_server::{AccessLogService, AccessLogServiceServer};
use pb::{stream_access_logs_message::LogEntries, StreamAccessLogsMessage, StreamAccessLogsResponse};

struct Ingestor {
    reconciler: FenceReconciler,
}

#[tonic::async_trait]
impl AccessLogService for Ingestor {
    async fn stream_access_logs(
        &self,
        request: Request<Streaming<StreamAccessLogsMessage>>,
    ) -> Result<Response<StreamAccessLogsResponse>, Status> {
        let mut stream = request.into_inner();
        loop {
            let message = match stream.message().await {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(Response::new(StreamAccessLogsResponse {})),
                Err(status) => {
                    warn!(%status, "access log stream error");
                    return Err(status);
                }
            };

            let Some(LogEntries::HttpLogs(entries)) = message.log_entries else {
                continue;
            };
            for entry in entries.log_entry {
                let Some(entry) = to_domain(entry) else {
                    continue;
                };
                if let Err(error) = self.reconciler.on_access_log(&entry).await {
                    warn!(%error, "failed to process access log entry");
                }
            }
        }
    }
}

/// Projects the generated protobuf shape down to the resolver's plain
/// domain type, dropping the socket port and any entry missing the fields
/// the resolver needs. A malformed entry is simply skipped, per §7's
/// `Validation` error kind.
fn to_domain(entry: pb::HttpAccessLogEntry) -> Option<AccessLogEntry> {
    let common = entry.common_properties?;
    let downstream_remote_address = common
        .downstream_remote_address
        .and_then(|a| a.socket_address)
        .map(|a| a.address);
    let authority = entry.request.map(|r| r.authority).unwrap_or_default();
    Some(AccessLogEntry {
        downstream_remote_address,
        upstream_cluster: common.upstream_cluster,
        authority,
    })
}

/// Runs the ingestor until `shutdown` fires, then finishes in-flight
/// streams. Mirrors the gRPC server task in the teacher's runtime wiring.
#[instrument(skip_all, fields(port = %addr.port()))]
pub async fn serve(
    addr: SocketAddr,
    reconciler: FenceReconciler,
    shutdown: drain::Watch,
) -> anyhow::Result<()> {
    let svc = AccessLogServiceServer::new(Ingestor { reconciler });

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = tonic::transport::Server::builder()
            .add_service(svc)
            .serve_with_shutdown(addr, async move { let _ = close_rx.await; });
    }

    info!(%addr, "access log ingestor listening");
    tokio::select! {
        res = &mut srv => res?,
        handle = shutdown.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(
        address: Option<&str>,
        upstream_cluster: &str,
        authority: Option<&str>,
    ) -> pb::HttpAccessLogEntry {
        pb::HttpAccessLogEntry {
            common_properties: Some(pb::AccessLogCommon {
                downstream_remote_address: address.map(|a| pb::Address {
                    socket_address: Some(pb::SocketAddress {
                        address: a.to_string(),
                        port_value: 8080,
                    }),
                }),
                upstream_cluster: upstream_cluster.to_string(),
            }),
            request: authority.map(|a| pb::Request { authority: a.to_string() }),
        }
    }

    #[test]
    fn to_domain_drops_port_and_keeps_cluster_and_authority() {
        let got = to_domain(entry(
            Some("10.0.0.5"),
            "inbound|8080||cart.ops.svc.cluster.local",
            Some("payments"),
        ))
        .unwrap();
        assert_eq!(got.downstream_remote_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(got.upstream_cluster, "inbound|8080||cart.ops.svc.cluster.local");
        assert_eq!(got.authority, "payments");
    }

    #[test]
    fn to_domain_tolerates_missing_address_and_request() {
        let got = to_domain(entry(None, "outbound|80||x", None)).unwrap();
        assert_eq!(got.downstream_remote_address, None);
        assert_eq!(got.authority, "");
    }

    #[test]
    fn to_domain_drops_entry_with_no_common_properties() {
        let entry = pb::HttpAccessLogEntry { common_properties: None, request: None };
        assert!(to_domain(entry).is_none());
    }
}

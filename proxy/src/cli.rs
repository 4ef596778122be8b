use crate::wormhole::{self, WormholeProxy};
use crate::{healthz, listen};
use anyhow::{bail, Result};
use clap::Parser;
use fence_core::ClusterInfo;
use fence_k8s_api::{self as k8s};
use fence_k8s_index::ServiceNameIndex;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use tracing::{info_span, Instrument};

/// The Wormhole Proxy: rewrites and forwards `iptables`-redirected egress
/// connections to their real destination, expanding Kubernetes short names.
#[derive(Debug, Parser)]
#[clap(name = "proxy", about = "Lazy-egress wormhole proxy")]
pub struct Args {
    #[clap(long, default_value = "info,warn", env = "FENCE_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "fence", env = "CONTROLLER_NS")]
    controller_namespace: String,

    #[clap(long, default_value = "istio-system", env = "MESH_SYSTEM_NS")]
    mesh_system_namespace: String,

    #[clap(long, default_value = "true", env = "AUTO_FENCE")]
    auto_fence: bool,

    #[clap(long, default_value = "istio-proxy")]
    sidecar_container_name: String,

    #[clap(long, default_value = "80", env = "WORMHOLE_PORT")]
    wormhole_port: u16,

    #[clap(long, default_value = "16021", env = "PROBE_PORT")]
    probe_port: u16,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            controller_namespace,
            mesh_system_namespace,
            auto_fence,
            sidecar_container_name,
            wormhole_port,
            probe_port,
        } = self;

        if probe_port == wormhole_port {
            bail!(
                "probe port {probe_port} conflicts with wormhole port {wormhole_port}, refusing to start"
            );
        }

        let cluster_info = ClusterInfo {
            controller_namespace,
            mesh_system_namespace,
            auto_fence,
            wormhole_port,
            sidecar_container_name,
        };

        let prom = <Registry>::default();
        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let services = ServiceNameIndex::shared();
        let services_watch = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(services.clone(), services_watch)
                .instrument(info_span!("services")),
        );

        let proxy = WormholeProxy::new(&cluster_info, services);
        let wormhole_listener = listen::bind(SocketAddr::from(([0, 0, 0, 0], wormhole_port)))?;
        tokio::spawn(
            wormhole::serve(wormhole_listener, proxy, runtime.shutdown_handle())
                .instrument(info_span!("wormhole")),
        );

        tokio::spawn(
            healthz::serve(
                SocketAddr::from(([0, 0, 0, 0], probe_port)),
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("healthz")),
        );

        if runtime.run().await.is_err() {
            bail!("aborted");
        }

        Ok(())
    }
}

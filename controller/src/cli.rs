use anyhow::{bail, Result};
use clap::Parser;
use fence_core::ClusterInfo;
use fence_k8s_api::{self as k8s, Resource};
use fence_k8s_index::{
    run_namespace_index, EndpointIndex, FenceReconciler, LeaderGate, Metrics, NamespacePolicyIndex,
    ServiceWatchIndex,
};
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{info_span, Instrument};

const LEASE_NAME: &str = "fence-write";
const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// The Egress Learner controller: reconciler loops, the access-log
/// ingestor, and the admin/metrics server.
#[derive(Debug, Parser)]
#[clap(name = "controller", about = "Lazy-egress learner controller")]
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

    #[clap(long, default_value = "80", env = "WORMHOLE_PORT")]
    wormhole_port: u16,

    #[clap(long, default_value = "true", env = "AUTO_FENCE")]
    auto_fence: bool,

    #[clap(long, default_value = "istio-proxy")]
    sidecar_container_name: String,

    #[clap(long, default_value = "0.0.0.0:8082", env = "LOG_SOURCE_PORT")]
    grpc_addr: SocketAddr,

    /// Name of the Deployment that owns the write-lease, used only to set
    /// an owner reference on it; absence is tolerated (the Lease is simply
    /// created without one).
    #[clap(long, default_value = "fence-controller")]
    deployment_name: String,
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
            wormhole_port,
            auto_fence,
            sidecar_container_name,
            grpc_addr,
            deployment_name,
        } = self;

        let cluster_info = ClusterInfo {
            controller_namespace: controller_namespace.clone(),
            mesh_system_namespace,
            auto_fence,
            wormhole_port,
            sidecar_container_name,
        };

        let endpoints = EndpointIndex::shared();
        let namespaces = NamespacePolicyIndex::shared();

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(&mut prom);

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").expect("failed to fetch HOSTNAME environment variable");

        let claims = init_lease(
            &runtime,
            &controller_namespace,
            &deployment_name,
            kubert::LeaseParams {
                name: LEASE_NAME.to_string(),
                namespace: controller_namespace.clone(),
                claimant: hostname.clone(),
                lease_duration: LEASE_DURATION,
                renew_grace_period: RENEW_GRACE_PERIOD,
                field_manager: Some("fence-controller".into()),
            },
        )
        .await?;
        let leader = LeaderGate::new(claims, hostname);

        let reconciler = FenceReconciler::new(
            runtime.client(),
            cluster_info.clone(),
            namespaces.clone(),
            endpoints.clone(),
            leader,
            metrics.clone(),
        );

        endpoints.write().set_reconciler(reconciler.clone());
        endpoints.write().set_metrics(metrics);
        let endpoints_watch = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(endpoints.clone(), endpoints_watch)
                .instrument(info_span!("endpoints")),
        );

        let services_watch = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        let service_watch_index = ServiceWatchIndex::shared(reconciler.clone());
        tokio::spawn(
            kubert::index::namespaced(service_watch_index, services_watch)
                .instrument(info_span!("services")),
        );

        tokio::spawn(
            run_namespace_index(runtime.client(), namespaces.clone(), reconciler.clone())
                .instrument(info_span!("namespaces")),
        );

        tokio::spawn(
            fence_grpc::serve(grpc_addr, reconciler, runtime.shutdown_handle())
                .instrument(info_span!("access_log_ingestor")),
        );

        if runtime.run().await.is_err() {
            bail!("aborted");
        }

        Ok(())
    }
}

async fn init_lease<T>(
    runtime: &kubert::Runtime<T>,
    namespace: &str,
    deployment_name: &str,
    params: kubert::LeaseParams,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::coordination::v1 as coordv1;
    use kube::api::{Api, ObjectMeta, Patch, PatchParams};

    let api = Api::<Deployment>::namespaced(runtime.client(), namespace);
    let owner = api
        .get_opt(deployment_name)
        .await?
        .and_then(|deployment| deployment.controller_owner_ref(&()));

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: Some(params.namespace.clone()),
            // A resource version of "0" means the Lease is only created if
            // it does not already exist; concurrent controllers racing here
            // is expected and benign.
            resource_version: Some("0".to_string()),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        spec: None,
    };

    match Api::<coordv1::Lease>::namespaced(runtime.client(), namespace)
        .patch(
            &params.name,
            &PatchParams {
                field_manager: params.field_manager.clone().map(Into::into),
                ..Default::default()
            },
            &Patch::Apply(lease),
        )
        .await
    {
        Ok(_) => tracing::info!("created fence-write lease"),
        Err(k8s::Error::Api(_)) => tracing::debug!("lease already exists, no need to create it"),
        Err(error) => return Err(error.into()),
    }

    let (claim, _task) = runtime.spawn_lease(params).await?;
    Ok(claim)
}

use crate::metrics::Metrics;
use fence_core::{ClusterInfo, FenceError, ServiceRef};
use fence_k8s_api::{self as k8s, Api, ResourceExt};
use rand::Rng;
use std::time::Duration;

const FENCE_PROXY_SERVICE_NAME: &str = "fence-proxy";
const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Idempotent mutations on the three artifact kinds R1-R3 name, each using
/// compare-and-swap (via resourceVersion-bearing updates) with bounded
/// jittered-backoff retry on conflict, per §4.3.
#[derive(Clone)]
pub struct ResourceMutator {
    client: k8s::Client,
    cluster_info: ClusterInfo,
    metrics: Metrics,
}

impl ResourceMutator {
    pub fn new(client: k8s::Client, cluster_info: ClusterInfo, metrics: Metrics) -> Self {
        Self { client, cluster_info, metrics }
    }

    /// R1 — Port Binding. Ensures every TCP port of `svc` has a matching
    /// entry in the `fence-proxy` Service's port list.
    #[tracing::instrument(skip_all, fields(namespace = %svc.namespace().unwrap_or_default(), name = %svc.name_any()))]
    pub async fn bind_port_to_fence(&self, svc: &k8s::Service) -> Result<(), FenceError> {
        let ports: Vec<k8s::ServicePort> = svc
            .spec
            .as_ref()
            .map(|s| s.ports.clone().unwrap_or_default())
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.protocol.as_deref().unwrap_or("TCP") == "TCP")
            .collect();
        if ports.is_empty() {
            return Ok(());
        }

        retry_on_conflict(&self.metrics, "port_binding", || self.bind_port_to_fence_once(&ports)).await
    }

    async fn bind_port_to_fence_once(&self, ports: &[k8s::ServicePort]) -> Result<(), kube::Error> {
        let api: Api<k8s::Service> =
            Api::namespaced(self.client.clone(), &self.cluster_info.controller_namespace);
        let mut fence_proxy = api.get(FENCE_PROXY_SERVICE_NAME).await?;
        let spec = fence_proxy.spec.get_or_insert_with(Default::default);
        let existing: std::collections::HashSet<i32> = spec
            .ports
            .iter()
            .flatten()
            .map(|p| p.port)
            .collect();

        let mut changed = false;
        for p in ports {
            if existing.contains(&p.port) {
                continue;
            }
            spec.ports.get_or_insert_with(Vec::new).push(k8s::ServicePort {
                name: Some(format!("http-{}", p.port)),
                protocol: Some("TCP".to_string()),
                port: p.port,
                target_port: Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(
                    self.cluster_info.wormhole_port as i32,
                )),
                ..Default::default()
            });
            changed = true;
        }
        if !changed {
            return Ok(());
        }

        api.replace(FENCE_PROXY_SERVICE_NAME, &Default::default(), &fence_proxy)
            .await?;
        Ok(())
    }

    /// R2a — creates the per-workload Sidecar artifact for `svc`. Silently
    /// no-ops when the Service has no selector (not fenceable), matching
    /// `Sidecar.Generate`'s `ErrNoLabelSelector`.
    #[tracing::instrument(skip_all, fields(namespace = %svc.namespace().unwrap_or_default(), name = %svc.name_any()))]
    pub async fn create_sidecar(&self, svc: &k8s::Service) -> Result<(), FenceError> {
        let selector = match svc.spec.as_ref().and_then(|s| s.selector.clone()) {
            Some(s) if !s.is_empty() => s,
            _ => return Ok(()),
        };
        let namespace = svc.namespace().expect("Service must have a namespace");
        let name = svc.name_any();

        let sidecar = k8s::Sidecar {
            metadata: k8s::ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                owner_references: Some(vec![owner_reference(svc)]),
                ..Default::default()
            },
            spec: k8s::SidecarSpec {
                workload_selector: Some(k8s::WorkloadSelector { labels: selector }),
                egress: vec![self.default_egress_listener(&namespace)],
            },
        };

        let api: Api<k8s::Sidecar> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&Default::default(), &sidecar).await {
            Ok(_) => Ok(()),
            Err(k8s::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(FenceError::Transient(e.to_string())),
        }
    }

    fn default_egress_listener(&self, _workload_namespace: &str) -> k8s::IstioEgressListener {
        let [mesh, controller] = self.cluster_info.default_egress_hosts();
        k8s::IstioEgressListener {
            bind: None,
            hosts: vec![mesh, controller],
        }
    }

    /// R2b — unions `learned_fqdn` into the source workload's Sidecar
    /// egress hosts. `NotFound` is not an error: the access-log path
    /// deliberately never creates a Sidecar on miss (a documented
    /// limitation carried over from the original).
    #[tracing::instrument(skip_all, fields(%source, %learned_fqdn))]
    pub async fn add_destination_to_sidecar(
        &self,
        source: &ServiceRef,
        learned_fqdn: &str,
    ) -> Result<(), FenceError> {
        retry_on_conflict(&self.metrics, "sidecar_destination", || {
            self.add_destination_to_sidecar_once(source, learned_fqdn)
        })
        .await
    }

    async fn add_destination_to_sidecar_once(
        &self,
        source: &ServiceRef,
        learned_fqdn: &str,
    ) -> Result<(), kube::Error> {
        let api: Api<k8s::Sidecar> = Api::namespaced(self.client.clone(), &source.namespace);
        let mut sidecar = match api.get(&source.name).await {
            Ok(s) => s,
            Err(k8s::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e),
        };

        if sidecar.spec.egress.is_empty() {
            sidecar.spec.egress.push(self.default_egress_listener(&source.namespace));
        }
        let listener = &mut sidecar.spec.egress[0];
        let learned = format!("*/{learned_fqdn}");
        let mut hosts: std::collections::BTreeSet<String> = listener.hosts.iter().cloned().collect();
        hosts.insert(learned);
        listener.hosts = hosts.into_iter().collect();

        api.replace(&source.name, &Default::default(), &sidecar).await?;
        Ok(())
    }

    /// R3 (service side) — ensures the six per-port config-patch kinds exist
    /// in the shared `fence-proxy` EnvoyFilter for every TCP port of `svc`.
    #[tracing::instrument(skip_all, fields(namespace = %svc.namespace().unwrap_or_default(), name = %svc.name_any()))]
    pub async fn merge_into_envoy_filter(&self, svc: &k8s::Service) -> Result<(), FenceError> {
        let ports: Vec<i32> = svc
            .spec
            .as_ref()
            .map(|s| s.ports.clone().unwrap_or_default())
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.protocol.as_deref().unwrap_or("TCP") == "TCP")
            .map(|p| p.port)
            .collect();
        if ports.is_empty() {
            return Ok(());
        }
        retry_on_conflict(&self.metrics, "envoy_filter_port", || self.merge_into_envoy_filter_once(&ports)).await
    }

    async fn merge_into_envoy_filter_once(&self, ports: &[i32]) -> Result<(), kube::Error> {
        let api: Api<k8s::EnvoyFilter> =
            Api::namespaced(self.client.clone(), &self.cluster_info.mesh_system_namespace);
        let mut filter = api.get(FENCE_PROXY_SERVICE_NAME).await?;

        let mut changed = false;
        for &port in ports {
            changed |= super::envoy_patches::merge_port(&mut filter.spec.config_patches, port);
        }
        if !changed {
            return Ok(());
        }

        api.replace(FENCE_PROXY_SERVICE_NAME, &Default::default(), &filter)
            .await?;
        Ok(())
    }

    /// R3 (access-log side) — appends a virtual host for a learned external
    /// destination, keyed by the destination port's `ROUTE_CONFIGURATION`
    /// patch. Duplicate hosts are detected by walking existing domains.
    #[tracing::instrument(skip_all, fields(%authority))]
    pub async fn add_external_destination(&self, authority: &str) -> Result<(), FenceError> {
        retry_on_conflict(&self.metrics, "envoy_filter_external", || {
            self.add_external_destination_once(authority)
        })
        .await
    }

    async fn add_external_destination_once(&self, authority: &str) -> Result<(), kube::Error> {
        let api: Api<k8s::EnvoyFilter> =
            Api::namespaced(self.client.clone(), &self.cluster_info.mesh_system_namespace);
        let mut filter = match api.get(FENCE_PROXY_SERVICE_NAME).await {
            Ok(f) => f,
            Err(k8s::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e),
        };

        let changed = super::envoy_patches::add_external_host(&mut filter.spec.config_patches, authority);
        if !changed {
            return Ok(());
        }

        api.replace(FENCE_PROXY_SERVICE_NAME, &Default::default(), &filter)
            .await?;
        Ok(())
    }
}

fn owner_reference(svc: &k8s::Service) -> k8s::OwnerReference {
    k8s::OwnerReference {
        api_version: "v1".to_string(),
        kind: "Service".to_string(),
        name: svc.name_any(),
        uid: svc.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Retries `op` up to [`MAX_RETRY_ATTEMPTS`] times with jittered 10-1000ms
/// backoff when it fails with an HTTP 409 Conflict, per §4.3's "bounded
/// retry loop" contract. Any other error, or exhausting the retry budget,
/// surfaces to the caller. Every conflict retry is counted against `artifact`
/// in the mutator's metrics.
async fn retry_on_conflict<F, Fut, T>(metrics: &Metrics, artifact: &'static str, mut op: F) -> Result<T, FenceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, kube::Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(k8s::Error::Api(e)) if e.code == 404 => {
                return Err(FenceError::NotFound(e.message));
            }
            Err(k8s::Error::Api(e)) if e.code == 409 => {
                metrics.record_mutator_retry(artifact);
                attempt += 1;
                if attempt >= MAX_RETRY_ATTEMPTS {
                    return Err(FenceError::Conflict(e.message));
                }
                let jitter_ms = rand::thread_rng().gen_range(10..=1000);
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }
            Err(e) => return Err(FenceError::Transient(e.to_string())),
        }
    }
}

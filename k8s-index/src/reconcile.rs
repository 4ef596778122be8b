use crate::metrics::Metrics;
use crate::mutator::ResourceMutator;
use crate::{EndpointLookup as _, LeaderGate, SharedEndpointIndex, SharedNamespacePolicyIndex};
use fence_core::fence_policy::{fence_is_enabled, Labels};
use fence_core::{AccessLogEntry, ClusterInfo, DestClass, FenceError, ResolveOutcome};
use fence_k8s_api::{self as k8s, Api, ListParams, ResourceExt};
use std::collections::BTreeMap;

/// Level-triggered reconciliation for the three watched resource kinds, plus
/// the access-log entry point. Both paths converge on [`ResourceMutator`],
/// but are kept as two distinct functions (`refresh_by_service` /
/// `refresh_by_access_log`) rather than the original's single
/// type-switching `Resource.Refresh`, per the "explicit dispatch over type
/// assertions" design note.
#[derive(Clone)]
pub struct FenceReconciler {
    client: k8s::Client,
    cluster_info: ClusterInfo,
    mutator: ResourceMutator,
    namespaces: SharedNamespacePolicyIndex,
    endpoints: SharedEndpointIndex,
    leader: LeaderGate,
    metrics: Metrics,
}

impl FenceReconciler {
    pub fn new(
        client: k8s::Client,
        cluster_info: ClusterInfo,
        namespaces: SharedNamespacePolicyIndex,
        endpoints: SharedEndpointIndex,
        leader: LeaderGate,
        metrics: Metrics,
    ) -> Self {
        let mutator = ResourceMutator::new(client.clone(), cluster_info.clone(), metrics.clone());
        Self { client, cluster_info, mutator, namespaces, endpoints, leader, metrics }
    }

    /// Endpoints watch entry point. Mirrors `EndpointsReconciler.Reconcile`:
    /// no-op for system namespaces, Endpoints with no ready subsets, or when
    /// this process is not the reconciliation leader.
    pub async fn on_endpoints(&self, namespace: &str, name: &str, has_addresses: bool) -> Result<(), FenceError> {
        if !self.leader.is_leader() || self.cluster_info.is_system_namespace(namespace) || !has_addresses {
            return Ok(());
        }
        let Some(svc) = self.get_service(namespace, name).await? else {
            return Ok(());
        };
        self.refresh_by_service(&svc).await
    }

    /// Service watch entry point. Mirrors `ServiceReconciler.Reconcile`.
    pub async fn on_service(&self, svc: &k8s::Service) -> Result<(), FenceError> {
        let namespace = svc.namespace().unwrap_or_default();
        if !self.leader.is_leader() || self.cluster_info.is_system_namespace(&namespace) {
            return Ok(());
        }
        self.refresh_by_service(svc).await
    }

    /// Namespace watch entry point. Mirrors `NamespaceReconciler.Reconcile`:
    /// re-evaluates every Service in a namespace whose fence label changed.
    pub async fn on_namespace(&self, namespace: &str) -> Result<(), FenceError> {
        if !self.leader.is_leader()
            || self.cluster_info.is_system_namespace(namespace)
            || self.namespaces.read().is_disabled(namespace)
        {
            return Ok(());
        }
        let api: Api<k8s::Service> = Api::namespaced(self.client.clone(), namespace);
        let services = api
            .list(&ListParams::default())
            .await
            .map_err(|e| FenceError::Transient(e.to_string()))?;
        for svc in services.items {
            self.refresh_by_service(&svc).await?;
        }
        Ok(())
    }

    async fn refresh_by_service(&self, svc: &k8s::Service) -> Result<(), FenceError> {
        let namespace = svc.namespace().unwrap_or_default();
        if !self.is_fenced(&namespace, svc).await? {
            return Ok(());
        }
        self.mutator.bind_port_to_fence(svc).await?;
        self.mutator.create_sidecar(svc).await?;
        self.mutator.merge_into_envoy_filter(svc).await?;
        Ok(())
    }

    /// Access-log ingestion entry point. Mirrors `LogEntry.StreamLogEntry`'s
    /// per-entry body: resolve, skip system-namespace sources, skip
    /// non-fenced sources, then dispatch on internal/external.
    pub async fn on_access_log(&self, entry: &AccessLogEntry) -> Result<(), FenceError> {
        let outcome = {
            let endpoints = self.endpoints.read();
            fence_core::resolve(&*endpoints, entry)
        };

        let (source, dest) = match outcome {
            ResolveOutcome::Dropped(reason) => {
                self.metrics.record_dropped();
                tracing::debug!(%reason, "dropping access log entry");
                return Ok(());
            }
            ResolveOutcome::Resolved { source, dest } => (source, dest),
        };
        match &dest {
            DestClass::Internal(_) => self.metrics.record_resolved_internal(),
            DestClass::External => self.metrics.record_resolved_external(),
        }

        if self.cluster_info.is_system_namespace(&source.namespace) {
            return Ok(());
        }
        let Some(svc) = self.get_service(&source.namespace, &source.name).await? else {
            return Ok(());
        };
        if !self.is_fenced(&source.namespace, &svc).await? {
            return Ok(());
        }

        match dest {
            DestClass::Internal(dest) => {
                self.mutator.add_destination_to_sidecar(&source, &dest.fqdn()).await
            }
            DestClass::External => {
                if entry.authority.is_empty() {
                    return Ok(());
                }
                self.mutator.add_external_destination(&entry.authority).await
            }
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<k8s::Service>, FenceError> {
        let api: Api<k8s::Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(svc) => Ok(Some(svc)),
            Err(k8s::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(FenceError::Transient(e.to_string())),
        }
    }

    /// Whether `svc` participates in fencing, per §4.5: the namespace label
    /// wins when it disables, otherwise either the namespace or one
    /// representative Pod's workload label enables, or `auto_fence` does.
    async fn is_fenced(&self, namespace: &str, svc: &k8s::Service) -> Result<bool, FenceError> {
        let workload_labels = self.fetch_workload_labels(namespace, svc).await?.unwrap_or_default();
        let namespaces = self.namespaces.read();
        let namespace_labels = namespaces.labels_for(namespace);
        Ok(fence_is_enabled(&namespace_labels, &workload_labels, self.cluster_info.auto_fence))
    }

    async fn fetch_workload_labels(
        &self,
        namespace: &str,
        svc: &k8s::Service,
    ) -> Result<Option<BTreeMap<String, String>>, FenceError> {
        let Some(selector) = svc.spec.as_ref().and_then(|s| s.selector.clone()) else {
            return Ok(None);
        };
        if selector.is_empty() {
            return Ok(None);
        }
        let selector_str = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");

        let api: Api<k8s::Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(&selector_str).limit(1))
            .await
            .map_err(|e| FenceError::Transient(e.to_string()))?;
        Ok(pods.items.into_iter().next().map(|p| p.labels().clone()))
    }
}

/// Adapts [`FenceReconciler::on_service`] to `kubert::index::namespaced`,
/// so the Service watch is wired the same way the Endpoints watch is
/// (fire-and-forget per apply, no in-memory state of its own).
pub type SharedServiceWatchIndex = std::sync::Arc<parking_lot::RwLock<ServiceWatchIndex>>;

#[derive(Clone)]
pub struct ServiceWatchIndex(FenceReconciler);

impl ServiceWatchIndex {
    pub fn shared(reconciler: FenceReconciler) -> SharedServiceWatchIndex {
        std::sync::Arc::new(parking_lot::RwLock::new(Self(reconciler)))
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Service> for ServiceWatchIndex {
    fn apply(&mut self, resource: k8s::Service) {
        let reconciler = self.0.clone();
        tokio::spawn(async move {
            if let Err(error) = reconciler.on_service(&resource).await {
                tracing::warn!(%error, "failed to reconcile service");
            }
        });
    }

    fn delete(&mut self, _namespace: String, _name: String) {}
}

use crate::metrics::Metrics;
use fence_core::{EndpointLookup, ServiceRef};
use fence_k8s_api::{self as k8s, ResourceExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

pub type SharedEndpointIndex = Arc<RwLock<EndpointIndex>>;

/// IP <-> ServiceRef, fed by a watch on `Endpoints`. Per §4.1, an IP maps to
/// at most one `ServiceRef` at a time; updating a binding removes the old
/// one before installing the new one so readers never observe a torn
/// update.
#[derive(Default)]
pub struct EndpointIndex {
    ip_to_service: HashMap<IpAddr, ServiceRef>,
    service_to_ips: HashMap<ServiceRef, Vec<IpAddr>>,
    /// Notified on every address-set change, mirroring
    /// `EndpointsReconciler.Reconcile`. `None` in unit tests, where only the
    /// map semantics are under test.
    reconciler: Option<crate::FenceReconciler>,
    /// `None` in unit tests, where only the map semantics are under test.
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for EndpointIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointIndex")
            .field("ip_to_service", &self.ip_to_service)
            .field("service_to_ips", &self.service_to_ips)
            .finish()
    }
}

impl EndpointIndex {
    pub fn shared() -> SharedEndpointIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Wires up the reconciler notified on every Endpoints apply. Call once
    /// at startup before the watch is spawned.
    pub fn set_reconciler(&mut self, reconciler: crate::FenceReconciler) {
        self.reconciler = Some(reconciler);
    }

    /// Wires up the gauge of tracked endpoint addresses. Call once at
    /// startup before the watch is spawned.
    pub fn set_metrics(&mut self, metrics: Metrics) {
        metrics.set_tracked_endpoints(self.ip_to_service.len());
        self.metrics = Some(metrics);
    }

    pub fn lookup_service_by_ip(&self, ip: &IpAddr) -> Option<ServiceRef> {
        self.ip_to_service.get(ip).cloned()
    }

    pub fn list_ips_by_service(&self, svc: &ServiceRef) -> Vec<IpAddr> {
        self.service_to_ips.get(svc).cloned().unwrap_or_default()
    }

    pub fn has_service(&self, svc: &ServiceRef) -> bool {
        self.service_to_ips.contains_key(svc)
    }

    fn install(&mut self, svc: ServiceRef, ips: Vec<IpAddr>) {
        self.remove(&svc);
        for ip in &ips {
            self.ip_to_service.insert(*ip, svc.clone());
        }
        if !ips.is_empty() {
            self.service_to_ips.insert(svc, ips);
        }
        self.report_size();
    }

    fn remove(&mut self, svc: &ServiceRef) {
        if let Some(ips) = self.service_to_ips.remove(svc) {
            for ip in ips {
                self.ip_to_service.remove(&ip);
            }
        }
        self.report_size();
    }

    fn report_size(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_tracked_endpoints(self.ip_to_service.len());
        }
    }
}

impl EndpointLookup for EndpointIndex {
    fn source_service(&self, ip: &str) -> Option<ServiceRef> {
        let ip: IpAddr = ip.parse().ok()?;
        self.lookup_service_by_ip(&ip)
    }

    fn has_service(&self, svc: &ServiceRef) -> bool {
        EndpointIndex::has_service(self, svc)
    }
}

fn flatten_addresses(ep: &k8s::Endpoints) -> Vec<IpAddr> {
    ep.subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .filter_map(|addr| addr.ip.parse().ok())
        .collect()
}

impl kubert::index::IndexNamespacedResource<k8s::Endpoints> for EndpointIndex {
    fn apply(&mut self, resource: k8s::Endpoints) {
        let namespace = resource.namespace().expect("Endpoints must have a namespace");
        let name = resource.name_unchecked();
        let svc = ServiceRef::new(namespace, name);

        let ips = flatten_addresses(&resource);
        let unchanged = self
            .service_to_ips
            .get(&svc)
            .map(|existing| same_members(existing, &ips))
            .unwrap_or(false);
        if unchanged {
            return;
        }

        let has_addresses = !ips.is_empty();
        if has_addresses {
            self.install(svc.clone(), ips);
        } else {
            self.remove(&svc);
        }

        if let Some(reconciler) = self.reconciler.clone() {
            tokio::spawn(async move {
                if let Err(error) = reconciler
                    .on_endpoints(&svc.namespace, &svc.name, has_addresses)
                    .await
                {
                    tracing::warn!(%error, "failed to reconcile endpoints");
                }
            });
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let svc = ServiceRef::new(namespace, name);
        self.remove(&svc);
    }
}

fn same_members(a: &[IpAddr], b: &[IpAddr]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn install_then_lookup_both_directions() {
        let mut idx = EndpointIndex::default();
        let svc = ServiceRef::new("ops", "cart");
        idx.install(svc.clone(), vec![ip("10.0.0.5")]);
        assert_eq!(idx.lookup_service_by_ip(&ip("10.0.0.5")), Some(svc.clone()));
        assert_eq!(idx.list_ips_by_service(&svc), vec![ip("10.0.0.5")]);
        assert!(idx.has_service(&svc));
    }

    #[test]
    fn install_replaces_old_binding_atomically() {
        let mut idx = EndpointIndex::default();
        let svc = ServiceRef::new("ops", "cart");
        idx.install(svc.clone(), vec![ip("10.0.0.5")]);
        idx.install(svc.clone(), vec![ip("10.0.0.6")]);
        assert_eq!(idx.lookup_service_by_ip(&ip("10.0.0.5")), None);
        assert_eq!(idx.lookup_service_by_ip(&ip("10.0.0.6")), Some(svc));
    }

    #[test]
    fn remove_clears_both_directions() {
        let mut idx = EndpointIndex::default();
        let svc = ServiceRef::new("ops", "cart");
        idx.install(svc.clone(), vec![ip("10.0.0.5")]);
        idx.remove(&svc);
        assert_eq!(idx.lookup_service_by_ip(&ip("10.0.0.5")), None);
        assert!(!idx.has_service(&svc));
    }

    #[test]
    fn same_members_ignores_order() {
        assert!(same_members(
            &[ip("10.0.0.1"), ip("10.0.0.2")],
            &[ip("10.0.0.2"), ip("10.0.0.1")]
        ));
    }
}

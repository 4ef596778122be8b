use ahash::AHashSet as HashSet;
use fence_core::ServiceRef;
use fence_k8s_api::{self as k8s, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;

pub type SharedServiceNameIndex = Arc<RwLock<ServiceNameIndex>>;

/// The set of known `ServiceRef`s, used by the Wormhole Proxy for
/// short-name expansion. Per DESIGN NOTES, an *unpopulated* index means
/// short-name expansion is disabled for this process and callers should
/// treat the index as "always expand" rather than "nothing known" — see
/// `ServiceNameIndex::is_empty`.
#[derive(Debug, Default)]
pub struct ServiceNameIndex {
    services: HashSet<ServiceRef>,
}

impl ServiceNameIndex {
    pub fn shared() -> SharedServiceNameIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn contains(&self, svc: &ServiceRef) -> bool {
        self.services.contains(svc)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn service_ref(resource: &k8s::Service) -> ServiceRef {
    ServiceRef::new(
        resource.namespace().expect("Service must have a namespace"),
        resource.name_unchecked(),
    )
}

impl kubert::index::IndexNamespacedResource<k8s::Service> for ServiceNameIndex {
    fn apply(&mut self, resource: k8s::Service) {
        self.services.insert(service_ref(&resource));
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.services.remove(&ServiceRef::new(namespace, name));
    }

    fn reset(
        &mut self,
        resources: Vec<k8s::Service>,
        removed: kubert::index::NamespacedRemoved,
    ) {
        for (namespace, names) in removed {
            for name in names {
                self.services.remove(&ServiceRef::new(namespace.clone(), name));
            }
        }
        for resource in resources {
            self.services.insert(service_ref(&resource));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubert::index::IndexNamespacedResource;

    fn svc(namespace: &str, name: &str) -> k8s::Service {
        k8s::Service {
            metadata: k8s::ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: None,
            status: None,
        }
    }

    #[test]
    fn apply_then_contains() {
        let mut idx = ServiceNameIndex::default();
        idx.apply(svc("ops", "cart"));
        assert!(idx.contains(&ServiceRef::new("ops", "cart")));
        assert!(!idx.is_empty());
    }

    #[test]
    fn delete_removes() {
        let mut idx = ServiceNameIndex::default();
        idx.apply(svc("ops", "cart"));
        idx.delete("ops".into(), "cart".into());
        assert!(!idx.contains(&ServiceRef::new("ops", "cart")));
        assert!(idx.is_empty());
    }
}

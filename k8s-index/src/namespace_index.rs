use fence_core::fence_policy::{Labels, FENCE_LABEL, FENCE_VALUE_DISABLE, FENCE_VALUE_ENABLED};
use fence_k8s_api::{self as k8s, ResourceExt};
use futures::StreamExt;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

pub type SharedNamespacePolicyIndex = Arc<RwLock<NamespacePolicyIndex>>;

/// The set of namespaces labelled `fence=enabled` and `fence=disabled`.
/// `Namespace` is cluster-scoped, so this index is driven directly from a
/// `kube::runtime::reflector` store rather than `kubert::index`'s
/// namespaced-resource helper (which assumes a namespace field on the
/// watched type).
#[derive(Debug, Default, Clone)]
pub struct NamespacePolicyIndex {
    enabled: HashSet<String>,
    disabled: HashSet<String>,
}

impl NamespacePolicyIndex {
    pub fn shared() -> SharedNamespacePolicyIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn is_enabled(&self, namespace: &str) -> bool {
        self.enabled.contains(namespace)
    }

    pub fn is_disabled(&self, namespace: &str) -> bool {
        self.disabled.contains(namespace)
    }

    /// A `Labels` view over just this namespace's fence label, suitable for
    /// `fence_core::fence_policy::fence_is_enabled`.
    pub fn labels_for<'a>(&'a self, namespace: &'a str) -> NamespaceLabelView<'a> {
        NamespaceLabelView { index: self, namespace }
    }

    fn recompute(&mut self, namespaces: impl IntoIterator<Item = Arc<k8s::Namespace>>) {
        let mut enabled = HashSet::new();
        let mut disabled = HashSet::new();
        for ns in namespaces {
            let name = ns.name_any();
            match ns.labels().get(FENCE_LABEL).map(String::as_str) {
                Some(v) if v == FENCE_VALUE_ENABLED => {
                    enabled.insert(name);
                }
                Some(v) if v == FENCE_VALUE_DISABLE => {
                    disabled.insert(name);
                }
                _ => {}
            }
        }
        self.enabled = enabled;
        self.disabled = disabled;
    }
}

pub struct NamespaceLabelView<'a> {
    index: &'a NamespacePolicyIndex,
    namespace: &'a str,
}

impl Labels for NamespaceLabelView<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        if key != FENCE_LABEL {
            return None;
        }
        if self.index.is_disabled(self.namespace) {
            Some(FENCE_VALUE_DISABLE)
        } else if self.index.is_enabled(self.namespace) {
            Some(FENCE_VALUE_ENABLED)
        } else {
            None
        }
    }
}

/// Drives `index` from a watch on all `Namespace` objects until the watch
/// stream ends (normally, only on cancellation). Whenever a namespace is
/// applied (created or updated), re-evaluates every Service in it via
/// `reconciler.on_namespace`, mirroring `NamespaceReconciler.Reconcile`.
pub async fn run(
    client: kube::Client,
    index: SharedNamespacePolicyIndex,
    reconciler: crate::FenceReconciler,
) {
    let api = kube::Api::<k8s::Namespace>::all(client);
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher::Config::default())).default_backoff();
    tokio::pin!(stream);

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(%error, "namespace watch error");
                continue;
            }
        };
        let snapshot: Vec<Arc<k8s::Namespace>> = reader.state();
        index.write().recompute(snapshot);

        if let watcher::Event::Apply(ns) = &event {
            let name = ns.name_any();
            if let Err(error) = reconciler.on_namespace(&name).await {
                tracing::warn!(%error, "failed to reconcile namespace");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(name: &str, label: Option<&str>) -> Arc<k8s::Namespace> {
        let mut meta = k8s::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        };
        if let Some(v) = label {
            let mut labels = std::collections::BTreeMap::new();
            labels.insert(FENCE_LABEL.to_string(), v.to_string());
            meta.labels = Some(labels);
        }
        Arc::new(k8s::Namespace {
            metadata: meta,
            spec: None,
            status: None,
        })
    }

    #[test]
    fn recompute_sorts_namespaces_into_enabled_and_disabled() {
        let mut idx = NamespacePolicyIndex::default();
        idx.recompute(vec![
            ns("a", Some(FENCE_VALUE_ENABLED)),
            ns("b", Some(FENCE_VALUE_DISABLE)),
            ns("c", None),
        ]);
        assert!(idx.is_enabled("a"));
        assert!(idx.is_disabled("b"));
        assert!(!idx.is_enabled("c") && !idx.is_disabled("c"));
    }

    #[test]
    fn labels_for_disabled_wins_view() {
        let mut idx = NamespacePolicyIndex::default();
        idx.recompute(vec![ns("a", Some(FENCE_VALUE_DISABLE))]);
        assert_eq!(idx.labels_for("a").get(FENCE_LABEL), Some(FENCE_VALUE_DISABLE));
        assert_eq!(idx.labels_for("nope").get(FENCE_LABEL), None);
    }
}

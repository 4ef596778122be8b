/// Fixed label controlling fence enrollment, mirroring
/// `iconfig.SidecarFenceLabel` / `SidecarFenceValueEnabled` / `SidecarFenceValueDisable`.
pub const FENCE_LABEL: &str = "fence";
pub const FENCE_VALUE_ENABLED: &str = "enabled";
pub const FENCE_VALUE_DISABLE: &str = "disabled";

/// A minimal read-only view of a label map, so callers can hand in
/// `&BTreeMap`, a `kube` `ObjectMeta.labels`, or a test fixture without this
/// crate depending on any particular map type.
pub trait Labels {
    fn get(&self, key: &str) -> Option<&str>;
}

impl<S: std::hash::BuildHasher> Labels for std::collections::HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        std::collections::HashMap::get(self, key).map(String::as_str)
    }
}

impl Labels for std::collections::BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        std::collections::BTreeMap::get(self, key).map(String::as_str)
    }
}

/// Decides whether a workload should be fenced, following `fenceIsEnabled` in
/// the original: the namespace's label can force enable or force disable,
/// the workload's own label does the same and takes precedence over the
/// namespace's enable (but not over a namespace-level disable, which the
/// original checks first), and `auto_fence` is the fallback when neither
/// label is set.
///
/// Disable always wins, at either level, over `auto_fence` or an enable
/// anywhere else.
pub fn fence_is_enabled(
    namespace_labels: &dyn Labels,
    workload_labels: &dyn Labels,
    auto_fence: bool,
) -> bool {
    if namespace_labels.get(FENCE_LABEL) == Some(FENCE_VALUE_DISABLE) {
        return false;
    }
    if workload_labels.get(FENCE_LABEL) == Some(FENCE_VALUE_DISABLE) {
        return false;
    }

    let ns_enabled = namespace_labels.get(FENCE_LABEL) == Some(FENCE_VALUE_ENABLED);
    let workload_enabled = workload_labels.get(FENCE_LABEL) == Some(FENCE_VALUE_ENABLED);

    auto_fence || ns_enabled || workload_enabled
}

/// Mirrors `isSystemNamespace`: namespaces the controller must never
/// reconcile resources in, regardless of fence labels.
pub fn is_system_namespace(target_ns: &str, controller_ns: &str, mesh_system_ns: &str) -> bool {
    target_ns == controller_ns || target_ns == mesh_system_ns || target_ns == "kube-system"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn namespace_disable_wins_over_auto_fence() {
        let ns = labels(&[(FENCE_LABEL, FENCE_VALUE_DISABLE)]);
        let wl = HashMap::new();
        assert!(!fence_is_enabled(&ns, &wl, true));
    }

    #[test]
    fn workload_disable_wins_over_namespace_enable() {
        let ns = labels(&[(FENCE_LABEL, FENCE_VALUE_ENABLED)]);
        let wl = labels(&[(FENCE_LABEL, FENCE_VALUE_DISABLE)]);
        assert!(!fence_is_enabled(&ns, &wl, false));
    }

    #[test]
    fn auto_fence_enables_by_default() {
        let ns = HashMap::new();
        let wl = HashMap::new();
        assert!(fence_is_enabled(&ns, &wl, true));
        assert!(!fence_is_enabled(&ns, &wl, false));
    }

    #[test]
    fn workload_label_enables_without_auto_fence() {
        let ns = HashMap::new();
        let wl = labels(&[(FENCE_LABEL, FENCE_VALUE_ENABLED)]);
        assert!(fence_is_enabled(&ns, &wl, false));
    }

    #[test]
    fn system_namespace_matches_controller_mesh_or_kube_system() {
        assert!(is_system_namespace("fence-system", "fence-system", "istio-system"));
        assert!(is_system_namespace("istio-system", "fence-system", "istio-system"));
        assert!(is_system_namespace("kube-system", "fence-system", "istio-system"));
        assert!(!is_system_namespace("default", "fence-system", "istio-system"));
    }
}

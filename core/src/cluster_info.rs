/// Cross-cutting configuration threaded explicitly through every component,
/// per the "avoid global singletons" design note — this replaces the shared
/// struct embedded in every component in the original.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    /// The controller's own namespace; always treated as a system namespace.
    pub controller_namespace: String,
    /// The mesh control plane's namespace; always treated as a system
    /// namespace.
    pub mesh_system_namespace: String,
    /// `true` if fence enablement defaults to on absent any label.
    pub auto_fence: bool,
    /// The wormhole proxy's primary port, used as `targetPort` when binding
    /// new ports on the `fence-proxy` Service.
    pub wormhole_port: u16,
    /// The container name the original hard-codes as `istio-proxy`;
    /// configurable here rather than baked in, per SPEC_FULL's supplement.
    pub sidecar_container_name: String,
}

impl ClusterInfo {
    pub fn is_system_namespace(&self, namespace: &str) -> bool {
        crate::fence_policy::is_system_namespace(
            namespace,
            &self.controller_namespace,
            &self.mesh_system_namespace,
        )
    }

    /// The two mesh-system egress defaults every `WorkloadEgressArtifact`
    /// must always contain.
    pub fn default_egress_hosts(&self) -> [String; 2] {
        [
            format!("{}/*", self.mesh_system_namespace),
            format!("{}/*", self.controller_namespace),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ClusterInfo {
        ClusterInfo {
            controller_namespace: "fence".into(),
            mesh_system_namespace: "istio-system".into(),
            auto_fence: true,
            wormhole_port: 80,
            sidecar_container_name: "istio-proxy".into(),
        }
    }

    #[test]
    fn default_egress_hosts_are_mesh_system_then_controller() {
        assert_eq!(
            info().default_egress_hosts(),
            ["istio-system/*".to_string(), "fence/*".to_string()]
        );
    }
}

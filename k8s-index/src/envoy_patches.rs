use fence_k8s_api::{
    ApplyTo, EnvoyFilterConfigPatch, EnvoyFilterMatch, EnvoyFilterPatch, FilterChainMatch,
    FilterMatch, ListenerMatch, PatchOperation, ProxyMatch, RouteConfigurationMatch,
    SubFilterMatch, VirtualHostMatch,
};
use serde_json::json;
use std::collections::BTreeMap;

const ALLOW_ANY_VHOST: &str = "allow_any";
const FENCE_PROXY_VHOST: &str = "fence_proxy";
const ALLOW_ANY_NEW_VHOST: &str = "allow_any_new";
const LUA_FILTER_NAME: &str = "envoy.filters.http.lua";

fn fence_proxy_proxy_match() -> ProxyMatch {
    ProxyMatch {
        metadata: BTreeMap::from([("FENCE_APP".to_string(), "FENCE_PROXY".to_string())]),
    }
}

/// Ensures the six per-port config-patch kinds exist in `patches` for `port`,
/// mirroring `MergeFenceProxyEnvoyFilter`'s per-patch idempotency checks.
/// Returns whether any patch was appended.
pub fn merge_port(patches: &mut Vec<EnvoyFilterConfigPatch>, port: i32) -> bool {
    let mut changed = false;

    if !already_allow_any_virtual_host(patches, port) {
        patches.push(virtual_host_patch(port, None, ALLOW_ANY_VHOST));
        changed = true;
    }
    if !already_virtual_host(patches, port, FENCE_PROXY_VHOST) {
        patches.push(virtual_host_patch(port, Some(fence_proxy_proxy_match()), FENCE_PROXY_VHOST));
        changed = true;
    }
    if !already_route_configuration(patches, port) {
        patches.push(route_configuration_patch(port));
        changed = true;
    }
    if !already_allow_any_new_route_configuration(patches, port) {
        patches.push(route_configuration_allow_any_new_patch(port));
        changed = true;
    }
    if !already_http_filter(patches, port) {
        patches.push(http_filter_patch(port));
        changed = true;
    }
    if !already_http_route(patches, port) {
        patches.push(http_route_patch(port));
        changed = true;
    }

    changed
}

fn virtual_host_patch(port: i32, proxy: Option<ProxyMatch>, vhost_name: &str) -> EnvoyFilterConfigPatch {
    EnvoyFilterConfigPatch {
        apply_to: ApplyTo::VirtualHost,
        object_match: EnvoyFilterMatch {
            context: "SIDECAR_OUTBOUND".to_string(),
            proxy,
            route_configuration: Some(RouteConfigurationMatch {
                name: port.to_string(),
                vhost: Some(VirtualHostMatch { name: vhost_name.to_string() }),
            }),
            listener: None,
        },
        patch: EnvoyFilterPatch {
            operation: PatchOperation::Remove,
            value: None,
        },
    }
}

fn route_configuration_patch(port: i32) -> EnvoyFilterConfigPatch {
    let value = json!({
        "request_headers_to_add": [{
            "append": true,
            "header": {
                "key": "Fence-Orig-Dest",
                "value": "%DOWNSTREAM_LOCAL_ADDRESS%",
            },
        }],
        "virtual_hosts": [{
            "domains": ["*"],
            "name": FENCE_PROXY_VHOST,
            "routes": [
                {
                    "match": {
                        "prefix": "/",
                        "headers": [{
                            "name": ":authority",
                            "string_match": {
                                "safe_regex": {
                                    "regex": IP_LITERAL_AUTHORITY_REGEX,
                                    "google_re2": {},
                                },
                            },
                        }],
                    },
                    "route": { "cluster": "PassthroughCluster", "timeout": "0s" },
                },
                {
                    "match": { "prefix": "/" },
                    "route": {
                        "cluster": "outbound|80||fence-proxy.fence.svc.cluster.local",
                        "timeout": "0s",
                    },
                },
            ],
        }],
    });

    EnvoyFilterConfigPatch {
        apply_to: ApplyTo::RouteConfiguration,
        object_match: EnvoyFilterMatch {
            context: "SIDECAR_OUTBOUND".to_string(),
            proxy: None,
            route_configuration: Some(RouteConfigurationMatch { name: port.to_string(), vhost: None }),
            listener: None,
        },
        patch: EnvoyFilterPatch { operation: PatchOperation::Merge, value: Some(value) },
    }
}

const IP_LITERAL_AUTHORITY_REGEX: &str = r"^(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)(?::([1-9]|[1-9]\d{1,3}|[1-5]\d{4}|6[0-5][0-5][0-3][0-5]))?$";

fn route_configuration_allow_any_new_patch(port: i32) -> EnvoyFilterConfigPatch {
    let value = json!({
        "virtual_hosts": [{
            "domains": ["*"],
            "name": ALLOW_ANY_NEW_VHOST,
            "routes": [{
                "match": { "prefix": "/" },
                "route": { "cluster": "PassthroughCluster", "timeout": "0s" },
            }],
        }],
    });

    EnvoyFilterConfigPatch {
        apply_to: ApplyTo::RouteConfiguration,
        object_match: EnvoyFilterMatch {
            context: "SIDECAR_OUTBOUND".to_string(),
            proxy: Some(fence_proxy_proxy_match()),
            route_configuration: Some(RouteConfigurationMatch { name: port.to_string(), vhost: None }),
            listener: None,
        },
        patch: EnvoyFilterPatch { operation: PatchOperation::Merge, value: Some(value) },
    }
}

fn http_filter_patch(port: i32) -> EnvoyFilterConfigPatch {
    let value = json!({
        "name": LUA_FILTER_NAME,
        "typed_config": {
            "@type": "type.googleapis.com/envoy.extensions.filters.http.lua.v3.Lua",
            "inline_code": "-- place holder",
            "source_codes": {
                "add.lua": {
                    "inline_string": "function envoy_on_request(request_handle) request_handle:headers():replace(\"Fence-Source-Ns\", os.getenv(\"POD_NAMESPACE\")) end",
                },
            },
        },
    });

    EnvoyFilterConfigPatch {
        apply_to: ApplyTo::HttpFilter,
        object_match: EnvoyFilterMatch {
            context: "SIDECAR_OUTBOUND".to_string(),
            proxy: None,
            route_configuration: None,
            listener: Some(ListenerMatch {
                name: format!("0.0.0.0_{port}"),
                filter_chain: Some(FilterChainMatch {
                    filter: FilterMatch {
                        name: "envoy.filters.network.http_connection_manager".to_string(),
                        sub_filter: Some(SubFilterMatch {
                            name: "envoy.filters.http.router".to_string(),
                        }),
                    },
                }),
            }),
        },
        patch: EnvoyFilterPatch { operation: PatchOperation::InsertBefore, value: Some(value) },
    }
}

fn http_route_patch(port: i32) -> EnvoyFilterConfigPatch {
    let value = json!({
        "typed_per_filter_config": {
            (LUA_FILTER_NAME): {
                "@type": "type.googleapis.com/envoy.extensions.filters.http.lua.v3.LuaPerRoute",
                "name": "add.lua",
            },
        },
    });

    EnvoyFilterConfigPatch {
        apply_to: ApplyTo::HttpRoute,
        object_match: EnvoyFilterMatch {
            context: "SIDECAR_OUTBOUND".to_string(),
            proxy: None,
            route_configuration: Some(RouteConfigurationMatch {
                name: port.to_string(),
                vhost: Some(VirtualHostMatch { name: FENCE_PROXY_VHOST.to_string() }),
            }),
            listener: None,
        },
        patch: EnvoyFilterPatch { operation: PatchOperation::Merge, value: Some(value) },
    }
}

fn already_allow_any_virtual_host(patches: &[EnvoyFilterConfigPatch], port: i32) -> bool {
    patches.iter().any(|p| {
        p.apply_to == ApplyTo::VirtualHost
            && route_config_name(p) == Some(port.to_string())
            && vhost_name(p) == Some(ALLOW_ANY_VHOST)
    })
}

fn already_virtual_host(patches: &[EnvoyFilterConfigPatch], port: i32, vhost: &str) -> bool {
    patches.iter().any(|p| {
        p.apply_to == ApplyTo::VirtualHost
            && route_config_name(p) == Some(port.to_string())
            && vhost_name(p) == Some(vhost)
    })
}

fn already_route_configuration(patches: &[EnvoyFilterConfigPatch], port: i32) -> bool {
    patches
        .iter()
        .any(|p| p.apply_to == ApplyTo::RouteConfiguration && route_config_name(p) == Some(port.to_string()))
}

fn already_allow_any_new_route_configuration(patches: &[EnvoyFilterConfigPatch], port: i32) -> bool {
    patches.iter().any(|p| {
        if p.apply_to != ApplyTo::RouteConfiguration || route_config_name(p) != Some(port.to_string()) {
            return false;
        }
        virtual_host_names(p).iter().any(|name| name == ALLOW_ANY_NEW_VHOST)
    })
}

fn already_http_filter(patches: &[EnvoyFilterConfigPatch], port: i32) -> bool {
    let want = format!("0.0.0.0_{port}");
    patches.iter().any(|p| {
        p.apply_to == ApplyTo::HttpFilter
            && p.object_match
                .listener
                .as_ref()
                .map(|l| l.name == want)
                .unwrap_or(false)
    })
}

fn already_http_route(patches: &[EnvoyFilterConfigPatch], port: i32) -> bool {
    patches
        .iter()
        .any(|p| p.apply_to == ApplyTo::HttpRoute && route_config_name(p) == Some(port.to_string()))
}

fn route_config_name(p: &EnvoyFilterConfigPatch) -> Option<String> {
    p.object_match.route_configuration.as_ref().map(|r| r.name.clone())
}

fn vhost_name(p: &EnvoyFilterConfigPatch) -> Option<&str> {
    p.object_match
        .route_configuration
        .as_ref()
        .and_then(|r| r.vhost.as_ref())
        .map(|v| v.name.as_str())
}

fn virtual_host_names(p: &EnvoyFilterConfigPatch) -> Vec<String> {
    p.patch
        .value
        .as_ref()
        .and_then(|v| v.get("virtual_hosts"))
        .and_then(|vh| vh.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.get("name").and_then(|n| n.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Appends a virtual host for `authority`'s host to the
/// `ROUTE_CONFIGURATION` patch keyed by its port (default `80`), unless a
/// virtual host with that domain already exists. Returns whether a host was
/// appended.
pub fn add_external_host(patches: &mut [EnvoyFilterConfigPatch], authority: &str) -> bool {
    let (dest_host, dest_port) = match authority.split_once(':') {
        Some((host, port)) => (host, port.to_string()),
        None => (authority, "80".to_string()),
    };

    let Some(patch) = patches
        .iter_mut()
        .find(|p| p.apply_to == ApplyTo::RouteConfiguration && route_config_name(p) == Some(dest_port.clone()))
    else {
        return false;
    };

    let Some(value) = patch.patch.value.as_mut() else {
        return false;
    };
    let Some(virtual_hosts) = value.get_mut("virtual_hosts").and_then(|v| v.as_array_mut()) else {
        return false;
    };

    let already_present = virtual_hosts.iter().any(|vh| {
        vh.get("domains")
            .and_then(|d| d.as_array())
            .map(|domains| domains.iter().any(|d| d.as_str() == Some(dest_host)))
            .unwrap_or(false)
    });
    if already_present {
        return false;
    }

    virtual_hosts.push(json!({
        "domains": [dest_host],
        "name": dest_host,
        "routes": [{
            "match": { "prefix": "/" },
            "route": { "cluster": "PassthroughCluster" },
        }],
    }));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_port_appends_all_six_kinds_once() {
        let mut patches = Vec::new();
        assert!(merge_port(&mut patches, 9080));
        assert_eq!(patches.len(), 6);
        assert!(!merge_port(&mut patches, 9080));
        assert_eq!(patches.len(), 6);
    }

    #[test]
    fn merge_port_is_independent_per_port() {
        let mut patches = Vec::new();
        merge_port(&mut patches, 9080);
        merge_port(&mut patches, 9090);
        assert_eq!(patches.len(), 12);
    }

    #[test]
    fn add_external_host_appends_once_then_dedupes() {
        let mut patches = Vec::new();
        merge_port(&mut patches, 80);
        assert!(add_external_host(&mut patches, "example.com:80"));
        assert!(!add_external_host(&mut patches, "example.com:80"));
    }

    #[test]
    fn add_external_host_defaults_to_port_80() {
        let mut patches = Vec::new();
        merge_port(&mut patches, 80);
        assert!(add_external_host(&mut patches, "example.com"));
    }

    #[test]
    fn add_external_host_no_op_when_port_unknown() {
        let mut patches = Vec::new();
        merge_port(&mut patches, 9080);
        assert!(!add_external_host(&mut patches, "example.com:80"));
    }
}

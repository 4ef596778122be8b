use crate::accesslog::AccessLogEntry;
use crate::error::ClassifyError;
use crate::service_ref::ServiceRef;

/// Everything the resolver needs to know about the cluster's current
/// Endpoints state. `fence-k8s-index`'s Endpoint Index implements this; the
/// trait exists so the resolution logic below can be unit tested against a
/// plain `HashMap`-backed fake, independent of any Kubernetes watch machinery.
pub trait EndpointLookup {
    /// The service currently backed by an endpoint at this pod IP, if any.
    fn source_service(&self, ip: &str) -> Option<ServiceRef>;

    /// `true` if `svc` currently has at least one tracked endpoint, i.e. it is
    /// a known in-mesh destination rather than an external host.
    fn has_service(&self, svc: &ServiceRef) -> bool;
}

/// Where an access-log entry's destination authority resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestClass {
    /// A workload inside the mesh, identified by its fully qualified service
    /// reference. `ServiceRef::fqdn()` on this ref is the learned FQDN to
    /// record in the source workload's egress artifact.
    Internal(ServiceRef),
    /// Anything else: a raw IP, an unrecognized name, or a host with no
    /// matching tracked endpoint.
    External,
}

/// The full result of resolving one access-log entry, per §4.2: either it
/// is dropped outright (unknown source IP, malformed authority), or it
/// resolves to a source workload and a destination classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Dropped(String),
    Resolved {
        source: ServiceRef,
        dest: DestClass,
    },
}

/// Recovers the downstream peer's IP address from an access-log entry's
/// common properties. Mirrors `IpService.FetchSourceIp` in the original:
/// the socket address is trusted as-is, the only validation is that it
/// parses as an IP at all.
pub fn resolve_source_ip(entry: &AccessLogEntry) -> Result<std::net::IpAddr, ClassifyError> {
    let addr = entry
        .downstream_remote_address
        .as_deref()
        .ok_or_else(|| ClassifyError("access log entry has no downstream remote address".into()))?;
    addr.parse()
        .map_err(|_| ClassifyError(format!("source ip does not exist: {addr}")))
}

/// Looks up the service that owns `source_ip`, per `IpService.FetchSourceSvc`.
pub fn resolve_source_service(
    lookup: &dyn EndpointLookup,
    source_ip: &std::net::IpAddr,
) -> Result<ServiceRef, ClassifyError> {
    lookup
        .source_service(&source_ip.to_string())
        .ok_or_else(|| ClassifyError(format!("no source service, source ip is {source_ip}")))
}

/// Splits a dotted destination host into its path components, same as
/// Go's `strings.Split(dest, ".")`.
fn split_host(dest: &str) -> Vec<&str> {
    dest.split('.').collect()
}

/// Expands a short or partially-qualified destination host into the
/// fully-qualified in-cluster DNS name, following
/// `IpService.FetchDestinationSvc`'s switch on the number of dot-separated
/// parts:
///
/// - one part (`foo`): always expanded, qualified with the *source*
///   service's namespace (the original assumes same-namespace lookup when no
///   namespace is given).
/// - two parts (`foo.bar`): expanded to `foo.bar.svc.cluster.local` only if
///   `(bar, foo)` is a known tracked service; otherwise left alone, since
///   `foo.bar` could just as well be an external two-label hostname.
/// - three parts ending in `.svc` (`foo.bar.svc`): same check, expanded to
///   `foo.bar.svc.cluster.local`.
/// - anything else (already fully qualified, or not recognized): returned
///   unchanged.
pub fn expand_short_name(
    lookup: &dyn EndpointLookup,
    dest: &str,
    source_namespace: &str,
) -> String {
    let parts = split_host(dest);
    match parts.as_slice() {
        [name] => format!("{name}.{source_namespace}.svc.cluster.local"),
        [name, namespace] => {
            complete_dest_svc_name(lookup, name, namespace, dest, "svc.cluster.local")
        }
        [name, namespace, "svc"] => {
            complete_dest_svc_name(lookup, name, namespace, dest, "cluster.local")
        }
        _ => dest.to_string(),
    }
}

fn complete_dest_svc_name(
    lookup: &dyn EndpointLookup,
    name: &str,
    namespace: &str,
    dest: &str,
    suffix: &str,
) -> String {
    let svc = ServiceRef::new(namespace, name);
    if lookup.has_service(&svc) {
        format!("{dest}.{suffix}")
    } else {
        dest.to_string()
    }
}

/// Recovers the fully-qualified destination service host from an *inbound*
/// access-log entry, per `IpService.FetchDestinationSvc`. Returns `None` when
/// the entry isn't inbound, the authority is an IP literal, or the source
/// side can't be resolved.
pub fn resolve_destination_fqdn(
    lookup: &dyn EndpointLookup,
    entry: &AccessLogEntry,
) -> Result<Option<String>, ClassifyError> {
    if entry.upstream_cluster.split('|').count() != 4 {
        return Err(ClassifyError(format!(
            "upstream cluster does not have 4 parts: {}",
            entry.upstream_cluster
        )));
    }
    if !entry.is_inbound() {
        return Err(ClassifyError("this log is not inbound".into()));
    }

    let dest = entry.authority_host();
    if dest.parse::<std::net::IpAddr>().is_ok() {
        return Err(ClassifyError("destination is ip address".into()));
    }

    let source_ip = resolve_source_ip(entry)?;
    let source_svc = resolve_source_service(lookup, &source_ip)?;

    Ok(Some(expand_short_name(lookup, dest, &source_svc.namespace)))
}

/// Resolves one access-log entry into a source workload and a destination
/// classification, per §4.2. The source workload is always resolved first
/// (from the downstream remote address), since it is both required to
/// attribute the entry to a `WorkloadEgressArtifact` and used as the
/// fallback namespace when the destination authority is a bare short name.
/// Any failure resolving the source is a `Dropped` outcome — the entry is
/// logged and skipped, never retried, following `LogEntry.StreamLogEntry` in
/// the original.
pub fn resolve(lookup: &dyn EndpointLookup, entry: &AccessLogEntry) -> ResolveOutcome {
    let source_ip = match resolve_source_ip(entry) {
        Ok(ip) => ip,
        Err(e) => return ResolveOutcome::Dropped(e.0),
    };
    let source = match resolve_source_service(lookup, &source_ip) {
        Ok(svc) => svc,
        Err(e) => return ResolveOutcome::Dropped(e.0),
    };

    let dest = entry.authority_host();
    if dest.is_empty() || dest.parse::<std::net::IpAddr>().is_ok() {
        return ResolveOutcome::Resolved {
            source,
            dest: DestClass::External,
        };
    }

    let parts = split_host(dest);
    let name = parts[0];
    let namespace = if parts.len() >= 2 {
        parts[1].to_string()
    } else {
        source.namespace.clone()
    };

    let candidate = ServiceRef::new(namespace, name);
    let dest = if lookup.has_service(&candidate) {
        DestClass::Internal(candidate)
    } else {
        DestClass::External
    };
    ResolveOutcome::Resolved { source, dest }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct FakeLookup {
        ip_to_svc: HashMap<String, ServiceRef>,
        services: HashSet<ServiceRef>,
    }

    impl EndpointLookup for FakeLookup {
        fn source_service(&self, ip: &str) -> Option<ServiceRef> {
            self.ip_to_svc.get(ip).cloned()
        }

        fn has_service(&self, svc: &ServiceRef) -> bool {
            self.services.contains(svc)
        }
    }

    fn entry(authority: &str, downstream: &str, cluster: &str) -> AccessLogEntry {
        AccessLogEntry {
            downstream_remote_address: Some(downstream.to_string()),
            upstream_cluster: cluster.to_string(),
            authority: authority.to_string(),
        }
    }

    #[test]
    fn resolve_source_ip_rejects_missing_address() {
        let e = AccessLogEntry {
            downstream_remote_address: None,
            upstream_cluster: "inbound|8080||foo.bar.svc.cluster.local".into(),
            authority: "foo:8080".into(),
        };
        assert!(resolve_source_ip(&e).is_err());
    }

    #[test]
    fn expand_short_name_single_label_always_qualifies() {
        let lookup = FakeLookup::default();
        assert_eq!(
            expand_short_name(&lookup, "foo", "ns1"),
            "foo.ns1.svc.cluster.local"
        );
    }

    #[test]
    fn expand_short_name_two_labels_requires_known_service() {
        let mut lookup = FakeLookup::default();
        assert_eq!(expand_short_name(&lookup, "foo.bar", "ns1"), "foo.bar");
        lookup.services.insert(ServiceRef::new("bar", "foo"));
        assert_eq!(
            expand_short_name(&lookup, "foo.bar", "ns1"),
            "foo.bar.svc.cluster.local"
        );
    }

    #[test]
    fn expand_short_name_three_labels_requires_svc_suffix() {
        let mut lookup = FakeLookup::default();
        lookup.services.insert(ServiceRef::new("bar", "foo"));
        assert_eq!(
            expand_short_name(&lookup, "foo.bar.svc", "ns1"),
            "foo.bar.svc.cluster.local"
        );
        assert_eq!(expand_short_name(&lookup, "foo.bar.baz", "ns1"), "foo.bar.baz");
    }

    #[test]
    fn resolve_destination_fqdn_rejects_malformed_upstream_cluster() {
        let lookup = FakeLookup::default();
        let e = entry("foo:8080", "10.0.0.1", "inbound|8080|foo");
        assert!(resolve_destination_fqdn(&lookup, &e).is_err());
    }

    #[test]
    fn resolve_destination_fqdn_requires_inbound() {
        let lookup = FakeLookup::default();
        let e = entry("foo:8080", "10.0.0.1", "outbound|8080||foo.bar.svc.cluster.local");
        assert!(resolve_destination_fqdn(&lookup, &e).is_err());
    }

    #[test]
    fn resolve_destination_fqdn_rejects_ip_authority() {
        let lookup = FakeLookup::default();
        let e = entry("10.0.0.5:8080", "10.0.0.1", "inbound|8080||foo");
        assert!(resolve_destination_fqdn(&lookup, &e).is_err());
    }

    #[test]
    fn resolve_destination_fqdn_expands_via_source_namespace() {
        let mut lookup = FakeLookup::default();
        lookup
            .ip_to_svc
            .insert("10.0.0.1".into(), ServiceRef::new("ns1", "caller"));
        let e = entry("foo:8080", "10.0.0.1", "inbound|8080||foo");
        assert_eq!(
            resolve_destination_fqdn(&lookup, &e).unwrap(),
            Some("foo.ns1.svc.cluster.local".to_string())
        );
    }

    fn with_caller(lookup: &mut FakeLookup) -> ServiceRef {
        let caller = ServiceRef::new("ns1", "caller");
        lookup.ip_to_svc.insert("10.0.0.1".into(), caller.clone());
        caller
    }

    #[test]
    fn resolve_drops_unknown_source_ip() {
        let lookup = FakeLookup::default();
        let e = entry("10.0.0.5:8080", "10.0.0.1", "outbound|8080||");
        assert!(matches!(resolve(&lookup, &e), ResolveOutcome::Dropped(_)));
    }

    #[test]
    fn resolve_external_for_ip_literal() {
        let mut lookup = FakeLookup::default();
        let caller = with_caller(&mut lookup);
        let e = entry("10.0.0.5:8080", "10.0.0.1", "outbound|8080||");
        assert_eq!(
            resolve(&lookup, &e),
            ResolveOutcome::Resolved {
                source: caller,
                dest: DestClass::External,
            }
        );
    }

    #[test]
    fn resolve_internal_for_known_two_label_host() {
        let mut lookup = FakeLookup::default();
        let caller = with_caller(&mut lookup);
        lookup.services.insert(ServiceRef::new("bar", "foo"));
        let e = entry("foo.bar:8080", "10.0.0.1", "outbound|8080||");
        assert_eq!(
            resolve(&lookup, &e),
            ResolveOutcome::Resolved {
                source: caller,
                dest: DestClass::Internal(ServiceRef::new("bar", "foo")),
            }
        );
    }

    #[test]
    fn resolve_internal_for_known_single_label_host_in_source_namespace() {
        let mut lookup = FakeLookup::default();
        let caller = with_caller(&mut lookup);
        lookup.services.insert(ServiceRef::new("ns1", "payments"));
        let e = entry("payments:8080", "10.0.0.1", "inbound|8080||x");
        assert_eq!(
            resolve(&lookup, &e),
            ResolveOutcome::Resolved {
                source: caller,
                dest: DestClass::Internal(ServiceRef::new("ns1", "payments")),
            }
        );
    }

    #[test]
    fn resolve_external_for_unknown_host() {
        let mut lookup = FakeLookup::default();
        let caller = with_caller(&mut lookup);
        let e = entry("example.com:443", "10.0.0.1", "outbound|443||");
        assert_eq!(
            resolve(&lookup, &e),
            ResolveOutcome::Resolved {
                source: caller,
                dest: DestClass::External,
            }
        );
    }
}

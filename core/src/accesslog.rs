/// A flattened view of the fields of an Envoy `HTTPAccessLogEntry` this crate
/// actually cares about. The gRPC ingestor is responsible for projecting the
/// generated protobuf type down to this shape before handing it to the
/// resolver; keeping the resolver free of protobuf types keeps it unit
/// testable without a tonic dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogEntry {
    /// `CommonProperties.DownstreamRemoteAddress`'s socket address, if the
    /// entry carries one.
    pub downstream_remote_address: Option<String>,
    /// `CommonProperties.UpstreamCluster`, of the form
    /// `direction|port|subset|fqdn` (e.g. `inbound|8080||foo.bar.svc.cluster.local`).
    pub upstream_cluster: String,
    /// `Request.Authority`, the HTTP/2 `:authority` pseudo-header (or `Host`).
    pub authority: String,
}

impl AccessLogEntry {
    /// The upstream cluster's direction component, before the first `|`.
    pub fn cluster_direction(&self) -> Option<&str> {
        self.upstream_cluster.split('|').next()
    }

    /// `true` if this entry was recorded by an inbound listener, i.e. it
    /// describes traffic some other workload sent to the one emitting the
    /// log, not traffic the emitting workload itself originated.
    pub fn is_inbound(&self) -> bool {
        self.cluster_direction() == Some("inbound")
    }

    /// The authority host, with any `:port` suffix stripped.
    pub fn authority_host(&self) -> &str {
        self.authority.split(':').next().unwrap_or("")
    }
}

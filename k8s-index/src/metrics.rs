use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct AccessLogLabels {
    outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct MutatorRetryLabels {
    artifact: &'static str,
}

/// The ambient observability surface named in the admin server's metrics
/// registry: access-log entries by classification outcome, mutator
/// compare-and-swap conflicts/retries by artifact, and the current size of
/// the Endpoint Index. Mirrors `k8s-index`'s own `IndexMetrics` shape in the
/// teacher repo: a `Family` per labeled counter, a bare `Gauge` for the
/// single-valued size.
#[derive(Clone)]
pub struct Metrics {
    access_log_entries: Family<AccessLogLabels, Counter>,
    mutator_retries: Family<MutatorRetryLabels, Counter>,
    tracked_endpoints: Gauge,
}

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let access_log_entries = Family::default();
        registry.register(
            "access_log_entries",
            "Count of access log entries processed, by classification outcome",
            access_log_entries.clone(),
        );

        let mutator_retries = Family::default();
        registry.register(
            "mutator_retries",
            "Count of resource mutator compare-and-swap conflicts, by artifact",
            mutator_retries.clone(),
        );

        let tracked_endpoints = Gauge::default();
        registry.register(
            "tracked_endpoints",
            "Gauge of endpoint addresses currently tracked by the endpoint index",
            tracked_endpoints.clone(),
        );

        Self { access_log_entries, mutator_retries, tracked_endpoints }
    }

    pub fn record_dropped(&self) {
        self.access_log_entries.get_or_create(&AccessLogLabels { outcome: "dropped" }).inc();
    }

    pub fn record_resolved_internal(&self) {
        self.access_log_entries
            .get_or_create(&AccessLogLabels { outcome: "resolved_internal" })
            .inc();
    }

    pub fn record_resolved_external(&self) {
        self.access_log_entries
            .get_or_create(&AccessLogLabels { outcome: "resolved_external" })
            .inc();
    }

    pub fn record_mutator_retry(&self, artifact: &'static str) {
        self.mutator_retries.get_or_create(&MutatorRetryLabels { artifact }).inc();
    }

    pub fn set_tracked_endpoints(&self, count: usize) {
        self.tracked_endpoints.set(count as i64);
    }
}

#[cfg(test)]
impl Default for Metrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

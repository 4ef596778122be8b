use std::sync::Arc;
use tokio::sync::watch;

/// Gates the reconciler loops so they run on exactly one process at a time,
/// per the leader-election contract in §5: "the reconciler loops must be
/// active on exactly one leader at a time. The access-log ingestor and
/// wormhole proxy are *not* leader-gated" — so this is consulted only from
/// the watch-triggered entry points, never from the access-log path.
#[derive(Clone)]
pub struct LeaderGate {
    claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    hostname: Arc<str>,
}

impl LeaderGate {
    pub fn new(claims: watch::Receiver<Arc<kubert::lease::Claim>>, hostname: impl Into<Arc<str>>) -> Self {
        Self { claims, hostname: hostname.into() }
    }

    pub fn is_leader(&self) -> bool {
        self.claims.borrow().holder.as_str() == self.hostname.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn claim(holder: &str) -> Arc<kubert::lease::Claim> {
        Arc::new(kubert::lease::Claim {
            holder: holder.to_string(),
            expiry: DateTime::<Utc>::MAX_UTC,
        })
    }

    #[test]
    fn is_leader_compares_against_claim_holder() {
        let (_tx, rx) = watch::channel(claim("pod-a"));
        let gate = LeaderGate::new(rx, "pod-a");
        assert!(gate.is_leader());
    }

    #[test]
    fn is_not_leader_when_another_holder_claims() {
        let (_tx, rx) = watch::channel(claim("pod-b"));
        let gate = LeaderGate::new(rx, "pod-a");
        assert!(!gate.is_leader());
    }
}

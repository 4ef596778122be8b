#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoint_index;
pub mod envoy_patches;
pub mod leader;
pub mod metrics;
pub mod mutator;
pub mod namespace_index;
pub mod reconcile;
pub mod service_index;

pub use endpoint_index::{EndpointIndex, SharedEndpointIndex};
pub use fence_core::EndpointLookup;
pub use leader::LeaderGate;
pub use metrics::Metrics;
pub use mutator::ResourceMutator;
pub use namespace_index::{run as run_namespace_index, NamespacePolicyIndex, SharedNamespacePolicyIndex};
pub use reconcile::{FenceReconciler, ServiceWatchIndex, SharedServiceWatchIndex};
pub use service_index::{ServiceNameIndex, SharedServiceNameIndex};

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod accesslog;
pub mod cluster_info;
pub mod error;
pub mod fence_policy;
pub mod resolve;
pub mod service_ref;

pub use accesslog::AccessLogEntry;
pub use cluster_info::ClusterInfo;
pub use error::{ClassifyError, FenceError};
pub use resolve::{resolve, DestClass, EndpointLookup, ResolveOutcome};
pub use service_ref::ServiceRef;

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod envoy_filter;
pub mod sidecar;

pub use envoy_filter::{
    ApplyTo, EnvoyFilter, EnvoyFilterConfigPatch, EnvoyFilterMatch, EnvoyFilterPatch,
    EnvoyFilterSpec, FilterChainMatch, FilterMatch, ListenerMatch, PatchOperation, ProxyMatch,
    RouteConfigurationMatch, SubFilterMatch, VirtualHostMatch,
};
pub use sidecar::{IstioEgressListener, Sidecar, SidecarSpec, WorkloadSelector};

pub use k8s_openapi::{
    api::core::v1::{Endpoints, Namespace, Pod, Service, ServicePort, ServiceSpec},
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    error::ErrorResponse,
    runtime::watcher::Event as WatchEvent,
    Client, Error,
};

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod policy;

pub use self::labels::{Labels, Selector};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            Container, ContainerPort, EnvVar, Namespace, NamespaceStatus, Pod, PodSpec, Service,
            ServiceSpec,
        },
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
pub use kube::api::{Api, ObjectMeta, ResourceExt};
pub use kube::{Client, Error, Resource};

/// Pod labels that change on every rollout and never identify a workload.
pub const VOLATILE_LABELS: &[&str] = &["pod-template-hash"];

/// The phase reported by a namespace that accepts new resources.
pub const NAMESPACE_ACTIVE: &str = "Active";

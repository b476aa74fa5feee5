#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod topology;

#[cfg(any(test, feature = "test-util"))]
pub use self::memory::InMemoryCluster;
pub use self::{
    client::KubeCluster,
    topology::{Plugin, Topology, TopologyError},
};

use intent_policy_controller_core::StructuredPolicy;
use intent_policy_controller_k8s_api::{labels::Map, Namespace, Pod, Service};
use std::sync::Arc;

/// The cluster operations the controller depends on.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync + 'static {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError>;

    /// Lists pods in a namespace, optionally restricted to those carrying all
    /// of the given labels.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&Map>,
    ) -> Result<Vec<Pod>, ClusterError>;

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError>;

    /// Runs a command in a pod's container, capturing its standard output.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[&str],
    ) -> Result<ExecOutput, ClusterError>;

    /// Creates a policy object, failing with [`ClusterError::AlreadyExists`]
    /// when an object of the same kind and name exists.
    async fn create_policy(&self, policy: &StructuredPolicy) -> Result<(), ClusterError>;

    /// Replaces an existing policy object's content.
    async fn replace_policy(&self, policy: &StructuredPolicy) -> Result<(), ClusterError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub success: bool,
    pub stdout: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error(transparent)]
    Api(#[from] kube::Error),

    #[error("{0}")]
    Other(String),
}

// === impl Arc<C> ===

#[async_trait::async_trait]
impl<C: Cluster + ?Sized> Cluster for Arc<C> {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        (**self).get_pod(namespace, name).await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&Map>,
    ) -> Result<Vec<Pod>, ClusterError> {
        (**self).list_pods(namespace, selector).await
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError> {
        (**self).list_services(namespace).await
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError> {
        (**self).get_namespace(name).await
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[&str],
    ) -> Result<ExecOutput, ClusterError> {
        (**self).exec(namespace, pod, container, command).await
    }

    async fn create_policy(&self, policy: &StructuredPolicy) -> Result<(), ClusterError> {
        (**self).create_policy(policy).await
    }

    async fn replace_policy(&self, policy: &StructuredPolicy) -> Result<(), ClusterError> {
        (**self).replace_policy(policy).await
    }
}

use crate::{Cluster, ClusterError};
use intent_policy_controller_core::{
    descriptor::{NetworkDescriptor, Peer, DEFAULT_PROTOCOL},
    policy::PolicyKind,
};
use intent_policy_controller_k8s_api::{labels::Map, Labels, Pod, ResourceExt, Service};
use std::fmt;

/// Reads pods and services into [`NetworkDescriptor`]s.
///
/// Descriptors are built fresh from the cluster on every call.
#[derive(Clone, Debug)]
pub struct Topology<C> {
    cluster: C,
    system_namespace: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },

    #[error("{count} pods in {namespace} match {name:?}")]
    AmbiguousPod {
        namespace: String,
        name: String,
        count: usize,
    },

    #[error("no service found for pod {namespace}/{name}")]
    ServiceNotFound { namespace: String, name: String },

    #[error("failed to read from the cluster: {0}")]
    Cluster(#[from] ClusterError),
}

/// The network plugin installed in the cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Plugin {
    Cilium,
    Calico,
    Antrea,
    Weave,
    Unknown,
}

/// Pod name fragments identifying each plugin, in detection order.
const PLUGINS: &[(&str, Plugin)] = &[
    ("cilium", Plugin::Cilium),
    ("calico", Plugin::Calico),
    ("antrea", Plugin::Antrea),
    ("weave", Plugin::Weave),
];

/// Env vars carrying a service address end with this suffix.
const ADDR_SUFFIX: &str = "_ADDR";

// === impl Topology ===

impl<C: Cluster> Topology<C> {
    pub fn new(cluster: C, system_namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            system_namespace: system_namespace.into(),
        }
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    pub async fn describe(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<NetworkDescriptor, TopologyError> {
        let pod = self
            .cluster
            .get_pod(namespace, name)
            .await?
            .ok_or_else(|| TopologyError::PodNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        let services = self.cluster.list_services(namespace).await?;
        Ok(descriptor(&pod, &services))
    }

    /// Describes the single pod whose name starts with `short_name`.
    pub async fn describe_by_short_name(
        &self,
        namespace: &str,
        short_name: &str,
    ) -> Result<NetworkDescriptor, TopologyError> {
        let mut pods = self
            .cluster
            .list_pods(namespace, None)
            .await?
            .into_iter()
            .filter(|p| p.name_any().starts_with(short_name))
            .collect::<Vec<_>>();
        match pods.len() {
            0 => Err(TopologyError::PodNotFound {
                namespace: namespace.to_string(),
                name: short_name.to_string(),
            }),
            1 => {
                let pod = pods.remove(0);
                let services = self.cluster.list_services(namespace).await?;
                Ok(descriptor(&pod, &services))
            }
            count => Err(TopologyError::AmbiguousPod {
                namespace: namespace.to_string(),
                name: short_name.to_string(),
                count,
            }),
        }
    }

    pub async fn list_by_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<NetworkDescriptor>, TopologyError> {
        let pods = self.cluster.list_pods(namespace, None).await?;
        let services = self.cluster.list_services(namespace).await?;
        Ok(pods.iter().map(|p| descriptor(p, &services)).collect())
    }

    pub async fn list_by_selector(
        &self,
        namespace: &str,
        selector: &Map,
    ) -> Result<Vec<NetworkDescriptor>, TopologyError> {
        let pods = self.cluster.list_pods(namespace, Some(selector)).await?;
        let services = self.cluster.list_services(namespace).await?;
        Ok(pods.iter().map(|p| descriptor(p, &services)).collect())
    }

    pub async fn resolve_service(&self, pod: &Pod) -> Result<Option<String>, TopologyError> {
        let namespace = pod.namespace().unwrap_or_default();
        let services = self.cluster.list_services(&namespace).await?;
        Ok(resolve_service(pod, &services))
    }

    /// The selector of the descriptor's service.
    pub async fn service_selector(
        &self,
        desc: &NetworkDescriptor,
    ) -> Result<Map, TopologyError> {
        let not_found = || TopologyError::ServiceNotFound {
            namespace: desc.namespace.clone(),
            name: desc.name.clone(),
        };
        let service_name = desc.service_name.as_deref().ok_or_else(not_found)?;
        self.cluster
            .list_services(&desc.namespace)
            .await?
            .into_iter()
            .find(|s| s.name_any() == service_name)
            .and_then(|s| s.spec.and_then(|spec| spec.selector))
            .filter(|selector| !selector.is_empty())
            .ok_or_else(not_found)
    }

    /// Identifies the network plugin from the pods running in the system
    /// namespace.
    pub async fn detect_plugin(&self) -> Result<Plugin, TopologyError> {
        let pods = self.cluster.list_pods(&self.system_namespace, None).await?;
        let plugin = pods
            .iter()
            .find_map(|pod| {
                let name = pod.name_any();
                PLUGINS
                    .iter()
                    .find(|(fragment, _)| name.contains(fragment))
                    .map(|(_, plugin)| *plugin)
            })
            .unwrap_or(Plugin::Unknown);
        tracing::debug!(?plugin, "Detected network plugin");
        Ok(plugin)
    }
}

/// Builds a pod's descriptor, resolving its service from `services`.
pub fn descriptor(pod: &Pod, services: &[Service]) -> NetworkDescriptor {
    let mut ports = Vec::new();
    let mut protocols = Vec::new();
    for port in pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
    {
        if let Ok(p) = u16::try_from(port.container_port) {
            ports.push(p);
            protocols.push(
                port.protocol
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            );
        }
    }

    NetworkDescriptor {
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_default(),
        labels: Labels::from(pod.metadata.labels.clone()).without_volatile(),
        ports,
        protocols,
        service_name: resolve_service(pod, services),
        related_peers: related_peers(pod),
    }
}

/// Resolves the service fronting a pod: the host of the first `*_ADDR` env
/// var, otherwise the first service (by name) whose selector matches the
/// pod's labels.
pub fn resolve_service(pod: &Pod, services: &[Service]) -> Option<String> {
    let addr = env_vars(pod)
        .find(|(name, value)| name.ends_with(ADDR_SUFFIX) && !value.is_empty())
        .map(|(_, value)| value.split(':').next().unwrap_or(value).to_string());
    if addr.is_some() {
        return addr;
    }

    let labels = Labels::from(pod.metadata.labels.clone());
    let mut services = services.iter().collect::<Vec<_>>();
    services.sort_by_key(|s| s.name_any());
    services
        .into_iter()
        .find(|svc| {
            svc.spec
                .as_ref()
                .and_then(|spec| spec.selector.as_ref())
                .map_or(false, |selector| labels.contains_all(selector))
        })
        .map(|svc| svc.name_any())
}

/// Every `host:port` env value names a peer the pod talks to.
pub fn related_peers(pod: &Pod) -> Vec<Peer> {
    env_vars(pod)
        .filter_map(|(_, value)| Peer::parse(value))
        .collect()
}

fn env_vars(pod: &Pod) -> impl Iterator<Item = (&str, &str)> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.env.iter().flatten())
        .map(|env| (env.name.as_str(), env.value.as_deref().unwrap_or_default()))
}

// === impl Plugin ===

impl Plugin {
    /// The policy object kind named in prompts for this plugin.
    pub fn policy_kind(&self) -> &'static str {
        match self {
            Self::Cilium => PolicyKind::NETWORK,
            Self::Calico => "CalicoNetworkPolicy",
            Self::Antrea => "AntreaNetworkPolicy",
            Self::Weave => "KubernetesNetworkPolicy",
            Self::Unknown => "NetworkPolicy",
        }
    }
}

impl fmt::Display for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.policy_kind())
    }
}

//! An in-memory [`Cluster`] that holds pods, services, namespaces and policy
//! objects, used to exercise the controller without an API server.

use crate::{Cluster, ClusterError, ExecOutput};
use intent_policy_controller_core::StructuredPolicy;
use intent_policy_controller_k8s_api::{
    labels::Map, Labels, Namespace, NamespaceStatus, ObjectMeta, Pod, ResourceExt, Service,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Default)]
pub struct InMemoryCluster {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    pods: Vec<Pod>,
    services: Vec<Service>,
    namespaces: Vec<Namespace>,
    policies: BTreeMap<PolicyKey, StructuredPolicy>,
    processes: HashMap<ContainerKey, Vec<String>>,
    files: HashMap<ContainerKey, HashSet<String>>,
    creates: usize,
    replaces: usize,
    read_failure: Option<String>,
    create_failure: Option<String>,
}

/// `(kind, namespace, name)`
type PolicyKey = (String, String, String);

/// `(namespace, pod, container)`
type ContainerKey = (String, String, String);

// === impl InMemoryCluster ===

impl InMemoryCluster {
    pub fn add_pod(&self, pod: Pod) {
        self.state.write().pods.push(pod);
    }

    pub fn add_service(&self, service: Service) {
        self.state.write().services.push(service);
    }

    pub fn add_namespace(&self, name: &str, phase: &str) {
        self.state.write().namespaces.push(Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NamespaceStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    /// Sets the command lines `ps -ef` reports for a container.
    pub fn set_processes(&self, ns: &str, pod: &str, container: &str, cmds: &[&str]) {
        self.state.write().processes.insert(
            (ns.to_string(), pod.to_string(), container.to_string()),
            cmds.iter().map(|c| c.to_string()).collect(),
        );
    }

    /// Sets the paths `test -e` finds in a container.
    pub fn set_files(&self, ns: &str, pod: &str, container: &str, paths: &[&str]) {
        self.state.write().files.insert(
            (ns.to_string(), pod.to_string(), container.to_string()),
            paths.iter().map(|p| p.to_string()).collect(),
        );
    }

    /// Makes every subsequent read fail with `message`.
    pub fn fail_reads(&self, message: &str) {
        self.state.write().read_failure = Some(message.to_string());
    }

    /// Makes every subsequent create fail with `message`.
    pub fn fail_creates(&self, message: &str) {
        self.state.write().create_failure = Some(message.to_string());
    }

    pub fn reset_failures(&self) {
        let mut state = self.state.write();
        state.read_failure = None;
        state.create_failure = None;
    }

    pub fn policies(&self) -> Vec<StructuredPolicy> {
        self.state.read().policies.values().cloned().collect()
    }

    /// The number of create calls received, including rejected ones.
    pub fn creates(&self) -> usize {
        self.state.read().creates
    }

    pub fn replaces(&self) -> usize {
        self.state.read().replaces
    }

    fn check_reads(&self) -> Result<(), ClusterError> {
        match self.state.read().read_failure.clone() {
            Some(message) => Err(ClusterError::Other(message)),
            None => Ok(()),
        }
    }
}

fn policy_key(policy: &StructuredPolicy) -> PolicyKey {
    (
        policy.kind().to_string(),
        policy.namespace.clone(),
        policy.name.clone(),
    )
}

#[async_trait::async_trait]
impl Cluster for InMemoryCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        self.check_reads()?;
        Ok(self
            .state
            .read()
            .pods
            .iter()
            .find(|p| p.namespace().as_deref() == Some(namespace) && p.name_any() == name)
            .cloned())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&Map>,
    ) -> Result<Vec<Pod>, ClusterError> {
        self.check_reads()?;
        Ok(self
            .state
            .read()
            .pods
            .iter()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .filter(|p| match selector {
                Some(selector) => Labels::from(p.metadata.labels.clone()).contains_all(selector),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError> {
        self.check_reads()?;
        let mut services = self
            .state
            .read()
            .services
            .iter()
            .filter(|s| s.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect::<Vec<_>>();
        services.sort_by_key(|s| s.name_any());
        Ok(services)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError> {
        self.check_reads()?;
        Ok(self
            .state
            .read()
            .namespaces
            .iter()
            .find(|ns| ns.name_any() == name)
            .cloned())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[&str],
    ) -> Result<ExecOutput, ClusterError> {
        let key = (namespace.to_string(), pod.to_string(), container.to_string());
        let state = self.state.read();
        let output = match command {
            ["ps", "-ef"] => ExecOutput {
                success: true,
                stdout: state
                    .processes
                    .get(&key)
                    .map(|cmds| {
                        cmds.iter()
                            .enumerate()
                            .map(|(i, cmd)| format!("root {:>5} 0 0 00:00 ? 00:00:00 {cmd}\n", i + 1))
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            ["test", "-e", path] => ExecOutput {
                success: state.files.get(&key).map_or(false, |f| f.contains(*path)),
                stdout: String::new(),
            },
            _ => ExecOutput::default(),
        };
        Ok(output)
    }

    async fn create_policy(&self, policy: &StructuredPolicy) -> Result<(), ClusterError> {
        let mut state = self.state.write();
        state.creates += 1;
        if let Some(message) = state.create_failure.clone() {
            return Err(ClusterError::Other(message));
        }
        let key = policy_key(policy);
        if state.policies.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(policy.to_string()));
        }
        state.policies.insert(key, policy.clone());
        Ok(())
    }

    async fn replace_policy(&self, policy: &StructuredPolicy) -> Result<(), ClusterError> {
        let mut state = self.state.write();
        state.replaces += 1;
        let key = policy_key(policy);
        match state.policies.get_mut(&key) {
            Some(existing) => {
                *existing = policy.clone();
                Ok(())
            }
            None => Err(ClusterError::Other(format!("{policy} not found"))),
        }
    }
}

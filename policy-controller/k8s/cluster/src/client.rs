use crate::{Cluster, ClusterError, ExecOutput};
use intent_policy_controller_core::StructuredPolicy;
use intent_policy_controller_k8s_api::{
    labels::Map, Api, Client, Namespace, Pod, Resource, ResourceExt, Service,
};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{AttachParams, ListParams, PostParams};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use tokio::io::AsyncReadExt;

/// A [`Cluster`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn create<K>(&self, obj: K) -> Result<(), ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
        K: Clone + Debug + DeserializeOwned + Serialize,
    {
        let ns = obj.namespace().unwrap_or_default();
        let api = Api::<K>::namespaced(self.client.clone(), &ns);
        match api.create(&PostParams::default(), &obj).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(rsp)) if rsp.code == 409 => Err(ClusterError::AlreadyExists(
                format!("{}/{}/{}", K::kind(&()), ns, obj.name_any()),
            )),
            Err(error) => Err(error.into()),
        }
    }

    async fn replace<K>(&self, mut obj: K) -> Result<(), ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
        K: Clone + Debug + DeserializeOwned + Serialize,
    {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let api = Api::<K>::namespaced(self.client.clone(), &ns);
        let live = api.get(&name).await?;
        obj.meta_mut().resource_version = live.resource_version();
        api.replace(&name, &PostParams::default(), &obj).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&Map>,
    ) -> Result<Vec<Pod>, ClusterError> {
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            let labels = selector
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            params = params.labels(&labels);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError> {
        let api = Api::<Service>::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError> {
        let api = Api::<Namespace>::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[&str],
    ) -> Result<ExecOutput, ClusterError> {
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(false);
        let mut attached = api.exec(pod, command.iter().copied(), &params).await?;

        let mut stdout = String::new();
        if let Some(mut out) = attached.stdout() {
            out.read_to_string(&mut stdout)
                .await
                .map_err(|e| ClusterError::Other(format!("failed to read exec output: {e}")))?;
        }
        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        let success = status
            .and_then(|s| s.status)
            .map_or(false, |s| s == "Success");
        tracing::trace!(%namespace, %pod, %container, ?command, success, "Executed command");
        Ok(ExecOutput { success, stdout })
    }

    async fn create_policy(&self, policy: &StructuredPolicy) -> Result<(), ClusterError> {
        if let Some(cnp) = policy.to_cilium() {
            return self.create(cnp).await;
        }
        if let Some(ksp) = policy.to_kubearmor() {
            return self.create(ksp).await;
        }
        Ok(())
    }

    async fn replace_policy(&self, policy: &StructuredPolicy) -> Result<(), ClusterError> {
        if let Some(cnp) = policy.to_cilium() {
            return self.replace(cnp).await;
        }
        if let Some(ksp) = policy.to_kubearmor() {
            return self.replace(ksp).await;
        }
        Ok(())
    }
}

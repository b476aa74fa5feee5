use super::Synthesizer;
use crate::{cluster::Cluster, core::NetworkDescriptor, k8s::ResourceExt, Error};

impl Synthesizer {
    /// Infers prompts from pod configuration: every other pod whose
    /// environment points at this pod's service may reach it.
    pub async fn config(&self, descriptor: &NetworkDescriptor) -> Result<Vec<String>, Error> {
        let NetworkDescriptor {
            name, namespace, ..
        } = descriptor;
        let service = descriptor
            .service_name
            .as_deref()
            .ok_or_else(|| Error::ServiceNotFound(format!("{namespace}/{name}")))?;
        let kind = self.topology.detect_plugin().await?.policy_kind();

        let pods = self
            .topology
            .cluster()
            .list_pods(namespace, None)
            .await
            .map_err(Error::Fetch)?;
        let mut prompts = Vec::new();
        for pod in pods.iter().map(|p| p.name_any()).filter(|p| p != name) {
            let other = match self.topology.describe(namespace, &pod).await {
                Ok(other) => other,
                Err(error) => {
                    tracing::debug!(%pod, %error, "Skipping pod");
                    continue;
                }
            };
            if other.references(service) {
                prompts.push(format!(
                    "Create a {kind} that allows incoming ingress traffic over '{}' from '{}' Pod to the '{name} pod' labeled {}",
                    descriptor.traffic(),
                    other.name,
                    descriptor.labels.quoted(),
                ));
            }
        }
        tracing::debug!(pod = %name, %namespace, ?prompts, "Inferred prompts from configuration");
        Ok(prompts)
    }
}

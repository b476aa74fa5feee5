use crate::{
    cluster::{Cluster, ClusterError},
    core::StructuredPolicy,
    Error, SharedCluster,
};
use tracing::{debug, info};

/// Applies validated policies to the cluster.
#[derive(Clone)]
pub struct Enforcer {
    cluster: SharedCluster,
}

impl Enforcer {
    pub fn new(cluster: SharedCluster) -> Self {
        Self { cluster }
    }

    /// Creates each policy, replacing one that already exists. The first
    /// other failure stops the batch; policies applied before it remain.
    pub async fn apply(&self, policies: &[StructuredPolicy]) -> Result<usize, Error> {
        for policy in policies {
            match self.cluster.create_policy(policy).await {
                Ok(()) => info!(%policy, "Created policy"),
                Err(ClusterError::AlreadyExists(_)) => {
                    debug!(%policy, "Policy exists; replacing");
                    self.cluster
                        .replace_policy(policy)
                        .await
                        .map_err(|source| Error::Enforcement {
                            policy: policy.to_string(),
                            source,
                        })?;
                    info!(%policy, "Replaced policy");
                }
                Err(source) => {
                    return Err(Error::Enforcement {
                        policy: policy.to_string(),
                        source,
                    })
                }
            }
        }
        Ok(policies.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::InMemoryCluster,
        core::PolicySpec,
        k8s::{
            policy::{
                kubearmor::{Action, MatchPaths},
                KubeArmorPolicySpec,
            },
            Selector,
        },
    };
    use std::sync::Arc;

    fn policy(name: &str, action: Action) -> StructuredPolicy {
        StructuredPolicy {
            name: name.to_string(),
            namespace: "default".to_string(),
            spec: PolicySpec::System(KubeArmorPolicySpec {
                selector: Selector::from_iter(Some(("app", "web"))),
                process: MatchPaths::from_paths(vec!["/bin/sh".to_string()]),
                file: None,
                syscalls: None,
                action,
            }),
        }
    }

    #[tokio::test]
    async fn applying_twice_keeps_one_object() {
        let cluster = Arc::new(InMemoryCluster::default());
        let enforcer = Enforcer::new(cluster.clone());

        enforcer.apply(&[policy("ksp-block-web", Action::Audit)]).await.unwrap();
        enforcer.apply(&[policy("ksp-block-web", Action::Block)]).await.unwrap();

        assert_eq!(cluster.creates(), 2);
        assert_eq!(cluster.replaces(), 1);
        assert_eq!(cluster.policies(), [policy("ksp-block-web", Action::Block)]);
    }

    #[tokio::test]
    async fn other_failures_abort_the_batch() {
        let cluster = Arc::new(InMemoryCluster::default());
        cluster.fail_creates("forbidden");
        let enforcer = Enforcer::new(cluster.clone());

        let err = enforcer
            .apply(&[policy("ksp-a", Action::Block), policy("ksp-b", Action::Block)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Enforcement { ref policy, .. } if policy.ends_with("ksp-a")));
        assert_eq!(cluster.creates(), 1);
        assert!(cluster.policies().is_empty());
    }
}

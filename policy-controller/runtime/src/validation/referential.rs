use super::{Stage, ValidationError};
use crate::{
    cluster::Cluster,
    core::{PolicySpec, StructuredPolicy},
    k8s::{labels::Map, Labels, ResourceExt, NAMESPACE_ACTIVE},
};

pub(super) async fn validate(
    cluster: &dyn Cluster,
    policies: &[StructuredPolicy],
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for policy in policies {
        if let Err(message) = check(cluster, policy).await {
            errors.push(Stage::Referential.error(policy, message));
        }
    }
    errors
}

async fn check(cluster: &dyn Cluster, policy: &StructuredPolicy) -> Result<(), String> {
    let ns = policy.namespace.as_str();
    let namespace = cluster
        .get_namespace(ns)
        .await
        .map_err(|error| format!("failed to read namespace {ns}: {error}"))?
        .ok_or_else(|| format!("namespace {ns} does not exist"))?;
    let phase = namespace
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default();
    if phase != NAMESPACE_ACTIVE {
        return Err(format!("namespace {ns} is not active ({phase:?})"));
    }

    let selector = policy
        .selector()
        .match_labels()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| "policy selects no labels".to_string())?;
    let pods = cluster
        .list_pods(ns, Some(selector))
        .await
        .map_err(|error| format!("failed to list pods in {ns}: {error}"))?;
    if pods.is_empty() {
        return Err(format!("no pods in {ns} match {}", Labels::from(selector.clone())));
    }

    // Ingress from outside the namespace reaches pods through a service.
    let exposed = matches!(&policy.spec, PolicySpec::Network(spec) if !spec.ingress.is_empty());
    if exposed {
        let services = cluster
            .list_services(ns)
            .await
            .map_err(|error| format!("failed to list services in {ns}: {error}"))?;
        let pod_labels = pods
            .iter()
            .map(|p| Labels::from(p.metadata.labels.clone()))
            .collect::<Vec<_>>();
        let selects_pod = |selector: &Map| pod_labels.iter().any(|l| l.contains_all(selector));
        let found = services.iter().any(|svc| {
            svc.spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .map_or(false, selects_pod)
        });
        if !found {
            let pods = pods.iter().map(|p| p.name_any()).collect::<Vec<_>>();
            return Err(format!("no service in {ns} selects any of {pods:?}"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::InMemoryCluster,
        k8s::{
            policy::{
                cilium::{PortProtocol, PortRule, Rule},
                kubearmor::{Action, MatchPaths},
                CiliumNetworkPolicySpec, KubeArmorPolicySpec,
            },
            Selector,
        },
        test_util::{mk_pod, mk_service},
    };
    use maplit::btreemap;

    fn ingress(namespace: &str) -> StructuredPolicy {
        StructuredPolicy {
            name: "cnp-allow-db-5432".to_string(),
            namespace: namespace.to_string(),
            spec: PolicySpec::Network(CiliumNetworkPolicySpec {
                endpoint_selector: Selector::from_iter(Some(("app", "db"))),
                ingress: vec![Rule {
                    to_ports: vec![PortRule {
                        ports: vec![PortProtocol {
                            port: "5432".to_string(),
                            protocol: None,
                        }],
                    }],
                }],
                egress: vec![],
            }),
        }
    }

    fn system() -> StructuredPolicy {
        StructuredPolicy {
            name: "ksp-block-db-usrbinsh".to_string(),
            namespace: "default".to_string(),
            spec: PolicySpec::System(KubeArmorPolicySpec {
                selector: Selector::from_iter(Some(("app", "db"))),
                process: MatchPaths::from_paths(vec!["/usr/bin/sh".to_string()]),
                file: None,
                syscalls: None,
                action: Action::Block,
            }),
        }
    }

    fn db_pod(cluster: &InMemoryCluster) {
        cluster.add_pod(mk_pod(
            "default",
            "db-0",
            btreemap! { "app".to_string() => "db".to_string() },
            &[(5432, None)],
            &[],
        ));
    }

    #[tokio::test]
    async fn namespace_must_be_active() {
        let cluster = InMemoryCluster::default();
        let errors = validate(&cluster, &[ingress("missing")]).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("does not exist"), "{errors:?}");

        cluster.add_namespace("ending", "Terminating");
        let errors = validate(&cluster, &[ingress("ending")]).await;
        assert!(errors[0].message.contains("not active"), "{errors:?}");
    }

    #[tokio::test]
    async fn selector_must_match_pods() {
        let cluster = InMemoryCluster::default();
        cluster.add_namespace("default", "Active");
        let errors = validate(&cluster, &[system()]).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].stage, Stage::Referential);

        db_pod(&cluster);
        assert!(validate(&cluster, &[system()]).await.is_empty());
    }

    #[tokio::test]
    async fn ingress_requires_a_service() {
        let cluster = InMemoryCluster::default();
        cluster.add_namespace("default", "Active");
        db_pod(&cluster);
        let errors = validate(&cluster, &[ingress("default")]).await;
        assert_eq!(errors.len(), 1, "{errors:?}");

        cluster.add_service(mk_service(
            "default",
            "db",
            btreemap! { "app".to_string() => "db".to_string() },
        ));
        assert!(validate(&cluster, &[ingress("default")]).await.is_empty());
    }

    #[tokio::test]
    async fn read_failures_are_recorded() {
        let cluster = InMemoryCluster::default();
        cluster.fail_reads("connection refused");
        let errors = validate(&cluster, &[ingress("default"), system()]).await;
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("connection refused"));
    }
}

use super::{Stage, ValidationError};
use crate::{
    cluster::Cluster,
    core::{descriptor::DEFAULT_PROTOCOL, PolicySpec, StructuredPolicy},
    k8s::{
        policy::{
            cilium::{PortProtocol, Protocol},
            CiliumNetworkPolicySpec, KubeArmorPolicySpec,
        },
        Pod, ResourceExt,
    },
};

/// System calls a system policy may name.
const KNOWN_SYSCALLS: &[&str] = &["open", "read", "write", "close", "unlink", "rmdir"];

pub(super) async fn validate(
    cluster: &dyn Cluster,
    policies: &[StructuredPolicy],
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for policy in policies {
        let messages = match &policy.spec {
            PolicySpec::Network(spec) => check_network(cluster, policy, spec).await,
            PolicySpec::System(spec) => check_system(cluster, policy, spec).await,
        };
        errors.extend(
            messages
                .into_iter()
                .map(|message| Stage::Property.error(policy, message)),
        );
    }
    errors
}

async fn selected_pods(cluster: &dyn Cluster, policy: &StructuredPolicy) -> Result<Vec<Pod>, String> {
    let ns = &policy.namespace;
    let Some(selector) = policy.selector().match_labels().filter(|m| !m.is_empty()) else {
        return Ok(Vec::new());
    };
    cluster
        .list_pods(ns, Some(selector))
        .await
        .map_err(|error| format!("failed to list pods in {ns}: {error}"))
}

/// Ingress ports must be exposed by a selected pod. Egress ports must be
/// exposed by some pod in the namespace, since the destination selector is
/// not retained.
async fn check_network(
    cluster: &dyn Cluster,
    policy: &StructuredPolicy,
    spec: &CiliumNetworkPolicySpec,
) -> Vec<String> {
    let mut errors = Vec::new();

    if spec.ingress_ports().next().is_some() {
        match selected_pods(cluster, policy).await {
            Ok(pods) => errors.extend(
                spec.ingress_ports()
                    .filter(|p| !exposed(&pods, p))
                    .map(|p| format!("ingress port {} is not exposed by any selected pod", display(p))),
            ),
            Err(error) => errors.push(error),
        }
    }

    if spec.egress_ports().next().is_some() {
        match cluster.list_pods(&policy.namespace, None).await {
            Ok(pods) => errors.extend(spec.egress_ports().filter(|p| !exposed(&pods, p)).map(|p| {
                format!(
                    "egress port {} is not exposed by any pod in {}",
                    display(p),
                    policy.namespace
                )
            })),
            Err(error) => errors.push(format!(
                "failed to list pods in {}: {error}",
                policy.namespace
            )),
        }
    }

    errors
}

fn exposed(pods: &[Pod], rule: &PortProtocol) -> bool {
    let Ok(port) = rule.port.parse::<i32>() else {
        return false;
    };
    pods.iter()
        .filter_map(|p| p.spec.as_ref())
        .flat_map(|s| s.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .any(|cp| {
            let protocol = cp.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL);
            cp.container_port == port && rule.protocol.map_or(true, |p| p.admits(protocol))
        })
}

fn display(rule: &PortProtocol) -> String {
    format!(
        "{}/{}",
        rule.port,
        rule.protocol.unwrap_or(Protocol::Any)
    )
}

/// Process paths must run in every selected pod, file paths must exist in
/// some selected pod, and syscalls must be known.
async fn check_system(
    cluster: &dyn Cluster,
    policy: &StructuredPolicy,
    spec: &KubeArmorPolicySpec,
) -> Vec<String> {
    let mut errors = spec
        .syscall_names()
        .filter(|s| !KNOWN_SYSCALLS.contains(s))
        .map(|s| format!("unknown syscall {s:?}"))
        .collect::<Vec<_>>();

    let processes = spec.process_paths().collect::<Vec<_>>();
    let files = spec.file_paths().collect::<Vec<_>>();
    if processes.is_empty() && files.is_empty() {
        return errors;
    }

    let pods = match selected_pods(cluster, policy).await {
        Ok(pods) if pods.is_empty() => {
            errors.push("no pods are selected".to_string());
            return errors;
        }
        Ok(pods) => pods,
        Err(error) => {
            errors.push(error);
            return errors;
        }
    };

    if !processes.is_empty() {
        for pod in &pods {
            match process_listings(cluster, pod).await {
                Ok(listings) => errors.extend(
                    processes
                        .iter()
                        .filter(|path| !listings.iter().any(|l| l.contains(**path)))
                        .map(|path| format!("process {path} is not running in pod {}", pod.name_any())),
                ),
                Err(error) => errors.push(error),
            }
        }
    }

    for path in files {
        match file_exists(cluster, &pods, path).await {
            Ok(true) => {}
            Ok(false) => errors.push(format!("file {path} does not exist in any selected pod")),
            Err(error) => errors.push(error),
        }
    }

    errors
}

/// `ps -ef` output of each of the pod's containers.
async fn process_listings(cluster: &dyn Cluster, pod: &Pod) -> Result<Vec<String>, String> {
    let ns = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let mut listings = Vec::new();
    for container in containers(pod) {
        let output = cluster
            .exec(&ns, &name, container, &["ps", "-ef"])
            .await
            .map_err(|error| format!("failed to list processes in {name}/{container}: {error}"))?;
        listings.push(output.stdout);
    }
    Ok(listings)
}

async fn file_exists(cluster: &dyn Cluster, pods: &[Pod], path: &str) -> Result<bool, String> {
    for pod in pods {
        let ns = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        for container in containers(pod) {
            let output = cluster
                .exec(&ns, &name, container, &["test", "-e", path])
                .await
                .map_err(|error| format!("failed to check {path} in {name}/{container}: {error}"))?;
            if output.success {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn containers(pod: &Pod) -> impl Iterator<Item = &str> {
    pod.spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .map(|c| c.name.as_str())
}

//! Turns raw generator output into minimal, well-formed policies.
//!
//! Generator output is noisy: it may echo the prompt, carry terminal banners
//! and `kubectl` table headers, and repeat lines. Each document is cleaned,
//! parsed once into a kind-tagged shape, and reduced to the selector and the
//! port (or path) content the controller enforces.

use crate::{
    descriptor::NetworkDescriptor,
    entity::{Entities, EntityKind},
    policy::{PolicySpec, StructuredPolicy},
};
use intent_policy_controller_k8s_api::{
    labels::Map,
    policy::{
        cilium::{PortProtocol, PortRule, Protocol, Rule},
        kubearmor::{Action, MatchPaths, SyscallMatch, Syscalls},
        CiliumNetworkPolicySpec, KubeArmorPolicySpec,
    },
    Selector,
};
use serde::Deserialize;
use serde_yaml::Value;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("generated document {index} is not a policy: {source}")]
    Parse {
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("generated document {index} is malformed: {reason}")]
    Shape { index: usize, reason: String },
}

/// Lines emitted by terminals and `kubectl` that never belong to a policy.
const NOISE_PREFIXES: &[&str] = &[
    "➜",
    "©",
    "✗",
    "~ kubectl",
    "NAME",
    "AGE",
    "READY",
    "STATUS",
    "RESTARTS",
    "IP",
    "NODE",
];

const ACTIONS: &[&str] = &["Block", "Allow", "Audit"];

const FILE_EXTENSIONS: &[&str] = &[".conf", ".cfg", ".txt", ".log", ".bin", ".json", ".yaml"];

/// The longest name accepted for a namespaced resource.
const MAX_NAME_LEN: usize = 253;

#[derive(Debug, Deserialize)]
#[serde(tag = "kind")]
enum Document {
    CiliumNetworkPolicy {
        #[serde(default)]
        spec: Option<NetworkSpec>,
    },
    KubeArmorPolicy {
        #[serde(default)]
        spec: Option<SystemSpec>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkSpec {
    #[serde(default)]
    endpoint_selector: Option<LabelSelector>,
    #[serde(default)]
    ingress: Option<Vec<NetworkRule>>,
    #[serde(default)]
    egress: Option<Vec<NetworkRule>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkRule {
    #[serde(default)]
    ports: Option<Vec<Value>>,
    #[serde(default)]
    protocol: Option<Value>,
    #[serde(default)]
    to_ports: Option<Vec<ToPorts>>,
}

#[derive(Debug, Default, Deserialize)]
struct ToPorts {
    #[serde(default)]
    ports: Option<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelSelector {
    #[serde(default)]
    match_labels: Option<serde_yaml::Mapping>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemSpec {
    #[serde(default)]
    selector: Option<LabelSelector>,
    #[serde(default)]
    process: Option<PathMatch>,
    #[serde(default)]
    file: Option<PathMatch>,
    #[serde(default)]
    syscalls: Option<SyscallSpec>,
    #[serde(default)]
    action: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathMatch {
    #[serde(default)]
    match_paths: Option<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyscallSpec {
    #[serde(default)]
    match_syscalls: Option<Vec<SyscallEntry>>,
}

#[derive(Debug, Default, Deserialize)]
struct SyscallEntry {
    #[serde(default)]
    syscall: Option<Vec<Value>>,
}

/// Converts each generated document into a policy in the descriptor's
/// namespace. Documents that cannot be converted are reported without
/// affecting the others.
pub fn convert(
    raw: &[String],
    descriptor: &NetworkDescriptor,
    entities: &Entities,
) -> (Vec<StructuredPolicy>, Vec<ConversionError>) {
    let mut policies = Vec::with_capacity(raw.len());
    let mut errors = Vec::new();
    for (index, text) in raw.iter().enumerate() {
        match convert_one(index, text, descriptor, entities) {
            Ok(policy) => {
                tracing::debug!(%policy, "Converted generated policy");
                policies.push(policy);
            }
            Err(error) => errors.push(error),
        }
    }
    (policies, errors)
}

fn convert_one(
    index: usize,
    text: &str,
    descriptor: &NetworkDescriptor,
    entities: &Entities,
) -> Result<StructuredPolicy, ConversionError> {
    let cleaned = clean(text);
    let doc = serde_yaml::from_str::<Document>(&cleaned)
        .map_err(|source| ConversionError::Parse { index, source })?;
    let shape = |reason: String| ConversionError::Shape { index, reason };

    // Names use the pod as the intent called it, so regenerating a policy
    // for a replacement pod replaces the same object. The action and port
    // segments come from the first entity of each kind.
    let pod = entities.pod_name().unwrap_or(&descriptor.name);
    let namespace = descriptor.namespace.clone();
    let action = entities.first(EntityKind::Action).unwrap_or_default();

    match doc {
        Document::CiliumNetworkPolicy { spec } => {
            let spec = network_spec(spec.unwrap_or_default()).map_err(shape)?;
            let port = entities
                .first(EntityKind::Port)
                .map(str::to_string)
                .or_else(|| first_port(&spec))
                .unwrap_or_default();
            Ok(StructuredPolicy {
                name: policy_name(
                    "cnp",
                    &[action.to_ascii_lowercase().as_str(), pod, port.as_str()],
                ),
                namespace,
                spec: PolicySpec::Network(spec),
            })
        }

        Document::KubeArmorPolicy { spec } => {
            let spec = system_spec(spec.unwrap_or_default(), action).map_err(shape)?;
            let action = if action.is_empty() {
                spec.action.as_str().to_string()
            } else {
                action.to_string()
            };
            let path = entities
                .first(EntityKind::Path)
                .map(path_segment)
                .unwrap_or_default();
            Ok(StructuredPolicy {
                name: policy_name("ksp", &[action.as_str(), pod, path.as_str()]),
                namespace,
                spec: PolicySpec::System(spec),
            })
        }
    }
}

/// Strips noise from generator output while preserving YAML indentation.
///
/// Blank lines, banners, table headers, consecutive duplicates and anything
/// before the first `apiVersion:`/`kind:` line are dropped. Output stops
/// after the line declaring the policy action; a value split onto the next
/// line is joined back.
pub fn clean(text: &str) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut indent = None;
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        let line = line.trim_end();
        let trimmed = line.trim_start();
        if trimmed.is_empty() || NOISE_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            continue;
        }

        if indent.is_none() {
            if !(trimmed.starts_with("apiVersion:") || trimmed.starts_with("kind:")) {
                continue;
            }
            indent = Some(line.len() - line.trim_start_matches(' ').len());
        }
        let line = dedent(line, indent.unwrap_or(0));

        if kept.last().map(String::as_str) == Some(line) {
            continue;
        }

        if let Some(value) = trimmed.strip_prefix("action:").map(str::trim) {
            if ACTIONS.contains(&value) {
                kept.push(line.to_string());
                break;
            }
            if value.is_empty() {
                let next = lines.peek().map(|l| l.trim()).unwrap_or_default();
                if ACTIONS.contains(&next) {
                    kept.push(format!("{line} {next}"));
                    break;
                }
            }
        }

        kept.push(line.to_string());
    }

    kept.join("\n")
}

fn dedent(line: &str, indent: usize) -> &str {
    let leading = line.len() - line.trim_start_matches(' ').len();
    &line[leading.min(indent)..]
}

fn network_spec(raw: NetworkSpec) -> Result<CiliumNetworkPolicySpec, String> {
    let endpoint_selector = selector(raw.endpoint_selector, "endpointSelector")?;
    let ingress = network_rules(raw.ingress.unwrap_or_default())?;
    let egress = network_rules(raw.egress.unwrap_or_default())?;
    if ingress.is_empty() && egress.is_empty() {
        return Err("policy declares no ingress or egress rules with ports".to_string());
    }
    Ok(CiliumNetworkPolicySpec {
        endpoint_selector,
        ingress,
        egress,
    })
}

/// Rules that name no ports carry nothing the controller enforces and are
/// dropped.
fn network_rules(raw: Vec<NetworkRule>) -> Result<Vec<Rule>, String> {
    let mut rules = Vec::with_capacity(raw.len());
    for rule in raw {
        match network_rule(rule)? {
            Some(rule) => rules.push(rule),
            None => tracing::debug!("Dropping rule without ports"),
        }
    }
    Ok(rules)
}

fn network_rule(raw: NetworkRule) -> Result<Option<Rule>, String> {
    let default_protocol = raw.protocol.as_ref().map(protocol).transpose()?;

    let mut ports = Vec::new();
    let entries = raw.ports.into_iter().flatten().chain(
        raw.to_ports
            .into_iter()
            .flatten()
            .flat_map(|tp| tp.ports.into_iter().flatten()),
    );
    for entry in entries {
        ports.push(port_protocol(&entry, default_protocol)?);
    }

    if ports.is_empty() {
        return Ok(None);
    }
    Ok(Some(Rule {
        to_ports: vec![PortRule { ports }],
    }))
}

fn port_protocol(entry: &Value, default: Option<Protocol>) -> Result<PortProtocol, String> {
    let (port, proto) = match entry {
        Value::Mapping(map) => (
            map.get("port")
                .ok_or_else(|| "port entry has no port".to_string())?,
            map.get("protocol"),
        ),
        scalar => (scalar, None),
    };
    let port = scalar(port).ok_or_else(|| format!("invalid port: {port:?}"))?;
    match port.parse::<u16>() {
        Ok(p) if p > 0 => {}
        _ => return Err(format!("invalid port: {port}")),
    }
    let protocol = proto.map(protocol).transpose()?.or(default);
    Ok(PortProtocol { port, protocol })
}

fn protocol(value: &Value) -> Result<Protocol, String> {
    scalar(value)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| format!("invalid protocol: {value:?}"))
}

fn selector(raw: Option<LabelSelector>, field: &str) -> Result<Selector, String> {
    let labels = raw
        .and_then(|s| s.match_labels)
        .ok_or_else(|| format!("policy has no {field}.matchLabels"))?;
    let mut map = Map::new();
    for (k, v) in labels.iter() {
        match (scalar(k), scalar(v)) {
            (Some(k), Some(v)) => {
                map.insert(k, v);
            }
            _ => return Err(format!("invalid label in {field}: {k:?}")),
        }
    }
    if map.is_empty() {
        return Err(format!("policy has an empty {field}.matchLabels"));
    }
    Ok(Selector::from_map(map))
}

fn system_spec(raw: SystemSpec, fallback_action: &str) -> Result<KubeArmorPolicySpec, String> {
    let selector = selector(raw.selector, "selector")?;

    let action = match raw.action.as_ref().and_then(scalar) {
        Some(action) => action,
        None if !fallback_action.is_empty() => fallback_action.to_string(),
        None => return Err("policy has no action".to_string()),
    };
    let action = action.parse::<Action>().map_err(|e| e.to_string())?;

    let paths = |m: Option<PathMatch>| -> Result<Vec<String>, String> {
        m.and_then(|m| m.match_paths)
            .unwrap_or_default()
            .iter()
            .map(|entry| {
                let path = match entry {
                    Value::Mapping(map) => map.get("path").and_then(scalar),
                    other => scalar(other),
                };
                path.ok_or_else(|| format!("invalid path entry: {entry:?}"))
            })
            .collect()
    };
    let process = MatchPaths::from_paths(paths(raw.process)?);
    let file = MatchPaths::from_paths(paths(raw.file)?);

    let match_syscalls = raw
        .syscalls
        .and_then(|s| s.match_syscalls)
        .unwrap_or_default()
        .into_iter()
        .map(|entry| {
            let syscall = entry
                .syscall
                .unwrap_or_default()
                .iter()
                .map(|v| scalar(v).ok_or_else(|| format!("invalid syscall: {v:?}")))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SyscallMatch { syscall })
        })
        .collect::<Result<Vec<_>, String>>()?;
    let syscalls = if match_syscalls.is_empty() {
        None
    } else {
        Some(Syscalls { match_syscalls })
    };

    let spec = KubeArmorPolicySpec {
        selector,
        process,
        file,
        syscalls,
        action,
    };
    if spec.is_empty() {
        return Err("policy restricts no processes, files or syscalls".to_string());
    }
    Ok(spec)
}

/// Renders a YAML scalar as a string; collections are not scalars.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn first_port(spec: &CiliumNetworkPolicySpec) -> Option<String> {
    spec.ingress_ports()
        .chain(spec.egress_ports())
        .next()
        .map(|p| p.port.clone())
}

/// Reduces a path to a name segment: extensions of well-known file types
/// are dropped along with separators, e.g. `/etc/app.conf` becomes `etcapp`.
fn path_segment(path: &str) -> String {
    let path = path.trim();
    let path = FILE_EXTENSIONS
        .iter()
        .find_map(|ext| path.strip_suffix(ext))
        .unwrap_or(path);
    path.chars().filter(|c| *c != '/' && *c != '.').collect()
}

/// Joins non-empty segments under `prefix` as a DNS-1123 subdomain name.
fn policy_name(prefix: &str, segments: &[&str]) -> String {
    let mut name = prefix.to_string();
    for segment in segments.iter().map(|s| sanitize(s)) {
        if !segment.is_empty() {
            name.push('-');
            name.push_str(&segment);
        }
    }
    name.truncate(MAX_NAME_LEN);
    name.trim_end_matches('-').to_string()
}

fn sanitize(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for c in segment.trim().chars().map(|c| c.to_ascii_lowercase()) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

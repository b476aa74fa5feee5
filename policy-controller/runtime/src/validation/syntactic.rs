use super::{Stage, ValidationError};
use crate::core::{PolicyKind, StructuredPolicy};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;

const DNS_SUBDOMAIN_REGEX: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";
const DNS_LABEL_REGEX: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$";
const LABEL_NAME_REGEX: &str = r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$";
const LABEL_VALUE_REGEX: &str = r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$";
const SYSCALL_REGEX: &str = r"^[a-z][a-z0-9_]*$";

const MAX_SUBDOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

const PROTOCOLS: &[&str] = &["TCP", "UDP", "SCTP", "ANY"];
const ACTIONS: &[&str] = &["Allow", "Audit", "Block"];

/// Schemas for every policy kind the controller enforces, keyed by `kind`.
pub struct SchemaRegistry {
    patterns: Patterns,
    schemas: HashMap<&'static str, Box<dyn Schema>>,
}

/// Checks a rendered policy document, appending a message per violation.
trait Schema: Send + Sync {
    fn check(&self, doc: &Value, patterns: &Patterns, errors: &mut Vec<String>);
}

struct Patterns {
    subdomain: Regex,
    label: Regex,
    label_name: Regex,
    label_value: Regex,
    syscall: Regex,
}

struct NetworkSchema;

struct SystemSchema;

pub(super) fn validate(
    registry: &SchemaRegistry,
    policies: &[StructuredPolicy],
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for policy in policies {
        let messages = match policy.to_document() {
            Ok(doc) => registry.check_document(&doc),
            Err(error) => vec![format!("failed to render document: {error}")],
        };
        errors.extend(
            messages
                .into_iter()
                .map(|message| Stage::Syntactic.error(policy, message)),
        );
    }
    errors
}

// === impl SchemaRegistry ===

impl SchemaRegistry {
    pub fn new() -> Self {
        let mut schemas = HashMap::<&'static str, Box<dyn Schema>>::new();
        schemas.insert(PolicyKind::NETWORK, Box::new(NetworkSchema));
        schemas.insert(PolicyKind::SYSTEM, Box::new(SystemSchema));
        Self {
            patterns: Patterns::new(),
            schemas,
        }
    }

    /// Checks a document against the schema registered for its `kind`.
    pub fn check_document(&self, doc: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default();
        match self.schemas.get(kind) {
            Some(schema) => schema.check(doc, &self.patterns, &mut errors),
            None => errors.push(format!("no schema for kind {kind:?}")),
        }
        errors
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// === impl Patterns ===

impl Patterns {
    fn new() -> Self {
        Self {
            subdomain: Regex::new(DNS_SUBDOMAIN_REGEX).expect("should_compile"),
            label: Regex::new(DNS_LABEL_REGEX).expect("should_compile"),
            label_name: Regex::new(LABEL_NAME_REGEX).expect("should_compile"),
            label_value: Regex::new(LABEL_VALUE_REGEX).expect("should_compile"),
            syscall: Regex::new(SYSCALL_REGEX).expect("should_compile"),
        }
    }

    fn check_metadata(&self, doc: &Value, kind: PolicyKind, errors: &mut Vec<String>) {
        if doc.get("apiVersion").and_then(Value::as_str) != Some(kind.api_version()) {
            errors.push(format!("apiVersion must be {}", kind.api_version()));
        }

        match doc.pointer("/metadata/name").and_then(Value::as_str) {
            Some(name) if name.len() <= MAX_SUBDOMAIN_LEN && self.subdomain.is_match(name) => {}
            Some(name) => errors.push(format!("metadata.name {name:?} is not a DNS-1123 subdomain")),
            None => errors.push("metadata.name is required".to_string()),
        }

        match doc.pointer("/metadata/namespace").and_then(Value::as_str) {
            Some(ns) if ns.len() <= MAX_LABEL_LEN && self.label.is_match(ns) => {}
            Some(ns) => errors.push(format!("metadata.namespace {ns:?} is not a DNS-1123 label")),
            None => errors.push("metadata.namespace is required".to_string()),
        }
    }

    /// Checks a `{matchLabels: {..}}` selector with at least one valid label.
    fn check_selector(&self, field: &str, selector: Option<&Value>, errors: &mut Vec<String>) {
        let labels = match selector
            .and_then(|s| s.get("matchLabels"))
            .and_then(Value::as_object)
        {
            Some(labels) if !labels.is_empty() => labels,
            _ => {
                errors.push(format!("{field}.matchLabels must be a non-empty map"));
                return;
            }
        };
        for (key, value) in labels {
            if !self.is_label_key(key) {
                errors.push(format!("{field}: invalid label key {key:?}"));
            }
            match value.as_str() {
                Some(v) if v.len() <= MAX_LABEL_LEN && self.label_value.is_match(v) => {}
                _ => errors.push(format!("{field}: invalid value for label {key:?}: {value}")),
            }
        }
    }

    /// A label key is an optional DNS subdomain prefix and a name.
    fn is_label_key(&self, key: &str) -> bool {
        let (prefix, name) = match key.split_once('/') {
            Some((prefix, name)) => (Some(prefix), name),
            None => (None, key),
        };
        let prefix_ok = prefix.map_or(true, |p| {
            p.len() <= MAX_SUBDOMAIN_LEN && self.subdomain.is_match(p)
        });
        prefix_ok && name.len() <= MAX_LABEL_LEN && self.label_name.is_match(name)
    }
}

// === impl NetworkSchema ===

impl Schema for NetworkSchema {
    fn check(&self, doc: &Value, patterns: &Patterns, errors: &mut Vec<String>) {
        patterns.check_metadata(doc, PolicyKind::Network, errors);
        let spec = match doc.get("spec").and_then(Value::as_object) {
            Some(spec) => spec,
            None => {
                errors.push("spec must be a map".to_string());
                return;
            }
        };
        patterns.check_selector("spec.endpointSelector", spec.get("endpointSelector"), errors);

        let mut rules = 0;
        for direction in ["ingress", "egress"] {
            let Some(value) = spec.get(direction) else {
                continue;
            };
            let Some(list) = value.as_array() else {
                errors.push(format!("spec.{direction} must be a list"));
                continue;
            };
            for (i, rule) in list.iter().enumerate() {
                rules += 1;
                check_rule(&format!("spec.{direction}[{i}]"), rule, errors);
            }
        }
        if rules == 0 {
            errors.push("spec must declare at least one ingress or egress rule".to_string());
        }
    }
}

fn check_rule(field: &str, rule: &Value, errors: &mut Vec<String>) {
    let Some(rule) = rule.as_object() else {
        errors.push(format!("{field} must be a map"));
        return;
    };
    only_keys(field, rule, &["toPorts"], errors);
    let Some(to_ports) = rule.get("toPorts").and_then(Value::as_array) else {
        errors.push(format!("{field}.toPorts must be a list"));
        return;
    };
    for (i, port_rule) in to_ports.iter().enumerate() {
        let field = format!("{field}.toPorts[{i}]");
        let Some(ports) = port_rule.get("ports").and_then(Value::as_array) else {
            errors.push(format!("{field}.ports must be a list"));
            continue;
        };
        if ports.is_empty() {
            errors.push(format!("{field}.ports must not be empty"));
        }
        for (j, port) in ports.iter().enumerate() {
            check_port(&format!("{field}.ports[{j}]"), port, errors);
        }
    }
}

fn check_port(field: &str, port: &Value, errors: &mut Vec<String>) {
    let number = port.get("port").and_then(Value::as_str);
    match number.map(str::parse::<u32>) {
        Some(Ok(1..=65535)) => {}
        _ => errors.push(format!(
            "{field}.port must be a number between 1 and 65535: {}",
            port.get("port").unwrap_or(&Value::Null)
        )),
    }
    match port.get("protocol") {
        None => {}
        Some(Value::String(p)) if PROTOCOLS.contains(&p.as_str()) => {}
        Some(p) => errors.push(format!(
            "{field}.protocol must be one of {}: {p}",
            PROTOCOLS.join(", ")
        )),
    }
}

fn only_keys(field: &str, map: &Map<String, Value>, allowed: &[&str], errors: &mut Vec<String>) {
    for key in map.keys().filter(|k| !allowed.contains(&k.as_str())) {
        errors.push(format!("{field}: unexpected field {key:?}"));
    }
}

// === impl SystemSchema ===

impl Schema for SystemSchema {
    fn check(&self, doc: &Value, patterns: &Patterns, errors: &mut Vec<String>) {
        patterns.check_metadata(doc, PolicyKind::System, errors);
        let spec = match doc.get("spec").and_then(Value::as_object) {
            Some(spec) => spec,
            None => {
                errors.push("spec must be a map".to_string());
                return;
            }
        };
        patterns.check_selector("spec.selector", spec.get("selector"), errors);

        match spec.get("action").and_then(Value::as_str) {
            Some(action) if ACTIONS.contains(&action) => {}
            _ => errors.push(format!("spec.action must be one of {}", ACTIONS.join(", "))),
        }

        let mut rules = 0;
        for section in ["process", "file"] {
            let Some(value) = spec.get(section) else {
                continue;
            };
            let paths = value.get("matchPaths").and_then(Value::as_array);
            let Some(paths) = paths.filter(|p| !p.is_empty()) else {
                errors.push(format!("spec.{section}.matchPaths must be a non-empty list"));
                continue;
            };
            for (i, path) in paths.iter().enumerate() {
                rules += 1;
                match path.get("path").and_then(Value::as_str) {
                    Some(p) if p.starts_with('/') => {}
                    _ => errors.push(format!(
                        "spec.{section}.matchPaths[{i}].path must be an absolute path"
                    )),
                }
            }
        }

        if let Some(syscalls) = spec.get("syscalls") {
            let matches = syscalls.get("matchSyscalls").and_then(Value::as_array);
            match matches.filter(|m| !m.is_empty()) {
                Some(matches) => {
                    for (i, m) in matches.iter().enumerate() {
                        let field = format!("spec.syscalls.matchSyscalls[{i}].syscall");
                        let names = m.get("syscall").and_then(Value::as_array);
                        let Some(names) = names.filter(|n| !n.is_empty()) else {
                            errors.push(format!("{field} must be a non-empty list"));
                            continue;
                        };
                        for name in names {
                            rules += 1;
                            match name.as_str() {
                                Some(n) if patterns.syscall.is_match(n) => {}
                                _ => errors.push(format!("{field}: invalid syscall {name}")),
                            }
                        }
                    }
                }
                None => errors.push("spec.syscalls.matchSyscalls must be a non-empty list".to_string()),
            }
        }

        if rules == 0 {
            errors.push("spec must restrict at least one process, file or syscall".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{convert, Entities, Entity, EntityKind, NetworkDescriptor};
    use serde_json::json;

    fn network_doc() -> Value {
        json!({
            "apiVersion": "cilium.io/v2",
            "kind": "CiliumNetworkPolicy",
            "metadata": { "name": "cnp-allow-db-5432", "namespace": "default" },
            "spec": {
                "endpointSelector": { "matchLabels": { "app": "db" } },
                "ingress": [{ "toPorts": [{ "ports": [{ "port": "5432", "protocol": "TCP" }] }] }],
            },
        })
    }

    #[test]
    fn accepts_minimal_network_policy() {
        let registry = SchemaRegistry::new();
        assert_eq!(registry.check_document(&network_doc()), Vec::<String>::new());
    }

    #[test]
    fn rejects_unknown_kind() {
        let registry = SchemaRegistry::new();
        let errors = registry.check_document(&json!({ "kind": "NetworkPolicy" }));
        assert_eq!(errors, ["no schema for kind \"NetworkPolicy\""]);
    }

    #[test]
    fn rejects_malformed_network_policy() {
        let registry = SchemaRegistry::new();
        let mut doc = network_doc();
        doc["apiVersion"] = json!("cilium.io/v1");
        doc["metadata"]["name"] = json!("CNP_allow");
        doc["spec"]["endpointSelector"]["matchLabels"] = json!({ "app": "db!" });
        doc["spec"]["ingress"][0]["toPorts"][0]["ports"][0] =
            json!({ "port": "70000", "protocol": "HTTP" });
        doc["spec"]["ingress"][0]["fromEndpoints"] = json!([]);
        let errors = registry.check_document(&doc);
        assert_eq!(errors.len(), 6, "{errors:#?}");
    }

    #[test]
    fn rejects_rule_free_network_policy() {
        let registry = SchemaRegistry::new();
        let mut doc = network_doc();
        doc["spec"].as_object_mut().unwrap().remove("ingress");
        let errors = registry.check_document(&doc);
        assert_eq!(errors, ["spec must declare at least one ingress or egress rule"]);
    }

    #[test]
    fn checks_system_policy() {
        let registry = SchemaRegistry::new();
        let doc = json!({
            "apiVersion": "security.kubearmor.com/v1",
            "kind": "KubeArmorPolicy",
            "metadata": { "name": "ksp-block-web-usrbinsh", "namespace": "default" },
            "spec": {
                "selector": { "matchLabels": { "app.kubernetes.io/name": "web" } },
                "process": { "matchPaths": [{ "path": "/usr/bin/sh" }] },
                "action": "Block",
            },
        });
        assert_eq!(registry.check_document(&doc), Vec::<String>::new());

        let mut bad = doc.clone();
        bad["spec"]["process"]["matchPaths"][0]["path"] = json!("usr/bin/sh");
        bad["spec"]["action"] = json!("Deny");
        bad["spec"]["syscalls"] = json!({ "matchSyscalls": [{ "syscall": ["Open"] }] });
        assert_eq!(registry.check_document(&bad).len(), 3);
    }

    #[test]
    fn converted_policies_pass() {
        let descriptor = NetworkDescriptor {
            name: "db-5d8f".to_string(),
            namespace: "prod".to_string(),
            ..Default::default()
        };
        let entities = [
            Entity::new(EntityKind::Action, "Allow"),
            Entity::new(EntityKind::PodName, "db pod"),
            Entity::new(EntityKind::Port, "5432"),
            Entity::new(EntityKind::Path, "/etc/nginx/nginx.conf"),
        ]
        .into_iter()
        .collect::<Entities>();
        let raw = vec![
            "Generated text:\n\
             apiVersion: cilium.io/v2\n\
             kind: CiliumNetworkPolicy\n\
             metadata:\n\
             \x20 name: whatever\n\
             spec:\n\
             \x20 endpointSelector:\n\
             \x20   matchLabels:\n\
             \x20     app: db\n\
             \x20 ingress:\n\
             \x20 - fromEndpoints:\n\
             \x20   - matchLabels:\n\
             \x20       app: web\n\
             \x20   toPorts:\n\
             \x20   - ports:\n\
             \x20     - port: \"5432\"\n\
             \x20       protocol: tcp\n"
                .to_string(),
            "apiVersion: security.kubearmor.com/v1\n\
             kind: KubeArmorPolicy\n\
             spec:\n\
             \x20 selector:\n\
             \x20   matchLabels:\n\
             \x20     app: db\n\
             \x20 file:\n\
             \x20   matchPaths:\n\
             \x20   - path: /etc/nginx/nginx.conf\n\
             \x20 action:\n\
             \x20   Allow\n"
                .to_string(),
        ];
        let (policies, errors) = convert(&raw, &descriptor, &entities);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(policies.len(), 2);
        assert_eq!(validate(&SchemaRegistry::new(), &policies), Vec::new());
    }

    #[test]
    fn converted_rules_without_ports_pass() {
        let descriptor = NetworkDescriptor {
            name: "db-5d8f".to_string(),
            namespace: "default".to_string(),
            ..Default::default()
        };
        let entities = [
            Entity::new(EntityKind::Action, "Allow"),
            Entity::new(EntityKind::PodName, "db pod"),
        ]
        .into_iter()
        .collect::<Entities>();
        let raw = vec![
            // Only an endpoint rule: nothing to enforce.
            "kind: CiliumNetworkPolicy\n\
             spec:\n\
             \x20 endpointSelector:\n\
             \x20   matchLabels:\n\
             \x20     app: db\n\
             \x20 ingress:\n\
             \x20 - fromEndpoints:\n\
             \x20   - matchLabels:\n\
             \x20       app: web\n"
                .to_string(),
            // An endpoint rule next to a ported one.
            "kind: CiliumNetworkPolicy\n\
             spec:\n\
             \x20 endpointSelector:\n\
             \x20   matchLabels:\n\
             \x20     app: db\n\
             \x20 ingress:\n\
             \x20 - fromEndpoints:\n\
             \x20   - matchLabels:\n\
             \x20       app: web\n\
             \x20 - toPorts:\n\
             \x20   - ports:\n\
             \x20     - port: \"5432\"\n"
                .to_string(),
        ];
        let (policies, errors) = convert(&raw, &descriptor, &entities);
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert_eq!(policies.len(), 1);
        assert_eq!(validate(&SchemaRegistry::new(), &policies), Vec::new());
    }
}

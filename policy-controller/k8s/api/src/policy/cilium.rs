use crate::labels::Selector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The minimal subset of a Cilium network policy that the controller writes:
/// an endpoint selector plus the ports of each ingress and egress rule.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cilium.io",
    version = "v2",
    kind = "CiliumNetworkPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CiliumNetworkPolicySpec {
    pub endpoint_selector: Selector,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<Rule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<Rule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_ports: Vec<PortRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct PortRule {
    pub ports: Vec<PortProtocol>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct PortProtocol {
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
    Any,
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported protocol: {0}")]
pub struct ProtocolParseError(String);

// === impl CiliumNetworkPolicySpec ===

impl CiliumNetworkPolicySpec {
    /// Iterates over the port/protocol pairs of all ingress rules.
    pub fn ingress_ports(&self) -> impl Iterator<Item = &PortProtocol> {
        Self::ports(&self.ingress)
    }

    /// Iterates over the port/protocol pairs of all egress rules.
    pub fn egress_ports(&self) -> impl Iterator<Item = &PortProtocol> {
        Self::ports(&self.egress)
    }

    fn ports(rules: &[Rule]) -> impl Iterator<Item = &PortProtocol> {
        rules
            .iter()
            .flat_map(|r| r.to_ports.iter())
            .flat_map(|pr| pr.ports.iter())
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Sctp => "SCTP",
            Self::Any => "ANY",
        }
    }

    /// Whether a container port declared with `protocol` satisfies this one.
    pub fn admits(&self, protocol: &str) -> bool {
        matches!(self, Self::Any) || self.as_str().eq_ignore_ascii_case(protocol)
    }
}

impl std::str::FromStr for Protocol {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            "SCTP" => Ok(Self::Sctp),
            "ANY" => Ok(Self::Any),
            _ => Err(ProtocolParseError(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_minimal_shape() {
        let spec = CiliumNetworkPolicySpec {
            endpoint_selector: Selector::from_iter(Some(("app", "db"))),
            ingress: vec![Rule {
                to_ports: vec![PortRule {
                    ports: vec![PortProtocol {
                        port: "5432".to_string(),
                        protocol: Some(Protocol::Tcp),
                    }],
                }],
            }],
            egress: vec![],
        };
        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            serde_json::json!({
                "endpointSelector": { "matchLabels": { "app": "db" } },
                "ingress": [{ "toPorts": [{ "ports": [{ "port": "5432", "protocol": "TCP" }] }] }],
            })
        );
    }

    #[test]
    fn protocol_parsing() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!(" UDP ".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("HTTP".parse::<Protocol>().is_err());
        assert!(Protocol::Any.admits("UDP"));
        assert!(!Protocol::Tcp.admits("UDP"));
    }
}

use intent_policy_controller_k8s_api::{
    policy::{CiliumNetworkPolicy, CiliumNetworkPolicySpec, KubeArmorPolicy, KubeArmorPolicySpec},
    ObjectMeta, Selector,
};
use std::fmt;

/// A converted policy ready for validation and enforcement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructuredPolicy {
    pub name: String,
    pub namespace: String,
    pub spec: PolicySpec,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicySpec {
    Network(CiliumNetworkPolicySpec),
    System(KubeArmorPolicySpec),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    Network,
    System,
}

// === impl StructuredPolicy ===

impl StructuredPolicy {
    pub fn kind(&self) -> PolicyKind {
        match self.spec {
            PolicySpec::Network(_) => PolicyKind::Network,
            PolicySpec::System(_) => PolicyKind::System,
        }
    }

    pub fn selector(&self) -> &Selector {
        match &self.spec {
            PolicySpec::Network(spec) => &spec.endpoint_selector,
            PolicySpec::System(spec) => &spec.selector,
        }
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            ..Default::default()
        }
    }

    pub fn to_cilium(&self) -> Option<CiliumNetworkPolicy> {
        match &self.spec {
            PolicySpec::Network(spec) => Some(CiliumNetworkPolicy {
                metadata: self.metadata(),
                spec: spec.clone(),
            }),
            PolicySpec::System(_) => None,
        }
    }

    pub fn to_kubearmor(&self) -> Option<KubeArmorPolicy> {
        match &self.spec {
            PolicySpec::System(spec) => Some(KubeArmorPolicy {
                metadata: self.metadata(),
                spec: spec.clone(),
            }),
            PolicySpec::Network(_) => None,
        }
    }

    /// Renders the full resource document, including `apiVersion` and
    /// `kind`, as it would be submitted to the API server.
    pub fn to_document(&self) -> serde_json::Result<serde_json::Value> {
        match self.kind() {
            PolicyKind::Network => serde_json::to_value(self.to_cilium()),
            PolicyKind::System => serde_json::to_value(self.to_kubearmor()),
        }
    }
}

impl fmt::Display for StructuredPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind(), self.namespace, self.name)
    }
}

// === impl PolicyKind ===

impl PolicyKind {
    pub const NETWORK: &'static str = "CiliumNetworkPolicy";
    pub const SYSTEM: &'static str = "KubeArmorPolicy";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => Self::NETWORK,
            Self::System => Self::SYSTEM,
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            Self::Network => "cilium.io/v2",
            Self::System => "security.kubearmor.com/v1",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

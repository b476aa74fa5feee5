use crate::labels::Selector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A KubeArmor system policy restricting the processes, files and system
/// calls of the selected pods.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "security.kubearmor.com",
    version = "v1",
    kind = "KubeArmorPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KubeArmorPolicySpec {
    pub selector: Selector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<MatchPaths>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<MatchPaths>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syscalls: Option<Syscalls>,
    pub action: Action,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchPaths {
    pub match_paths: Vec<MatchPath>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct MatchPath {
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Syscalls {
    pub match_syscalls: Vec<SyscallMatch>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SyscallMatch {
    pub syscall: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Action {
    Allow,
    Audit,
    Block,
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported action: {0}")]
pub struct ActionParseError(String);

// === impl KubeArmorPolicySpec ===

impl KubeArmorPolicySpec {
    pub fn process_paths(&self) -> impl Iterator<Item = &str> {
        self.process
            .iter()
            .flat_map(|p| p.match_paths.iter())
            .map(|p| p.path.as_str())
    }

    pub fn file_paths(&self) -> impl Iterator<Item = &str> {
        self.file
            .iter()
            .flat_map(|f| f.match_paths.iter())
            .map(|p| p.path.as_str())
    }

    pub fn syscall_names(&self) -> impl Iterator<Item = &str> {
        self.syscalls
            .iter()
            .flat_map(|s| s.match_syscalls.iter())
            .flat_map(|m| m.syscall.iter())
            .map(String::as_str)
    }

    /// Whether the policy restricts anything at all.
    pub fn is_empty(&self) -> bool {
        self.process_paths().next().is_none()
            && self.file_paths().next().is_none()
            && self.syscall_names().next().is_none()
    }
}

impl MatchPaths {
    pub fn from_paths(paths: impl IntoIterator<Item = String>) -> Option<Self> {
        let match_paths = paths
            .into_iter()
            .map(|path| MatchPath { path })
            .collect::<Vec<_>>();
        if match_paths.is_empty() {
            return None;
        }
        Some(Self { match_paths })
    }
}

// === impl Action ===

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "Allow",
            Self::Audit => "Audit",
            Self::Block => "Block",
        }
    }
}

impl std::str::FromStr for Action {
    type Err = ActionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "audit" => Ok(Self::Audit),
            "block" => Ok(Self::Block),
            _ => Err(ActionParseError(s.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Declarative configuration: a directory of pod descriptions, the first of
//! which is reconciled at startup.

use crate::{
    core::entity::DEFAULT_NAMESPACE,
    k8s::labels::Map,
    queue::Submitter,
    reconcile::Trigger,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PodResource {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub labels: Map,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Reads the first `*.yaml` file in `dir`, in name order.
pub fn load(dir: &Path) -> Result<Option<PodResource>> {
    let mut files = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read resource directory {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<PathBuf>, _>>()
        .with_context(|| format!("failed to list resource directory {}", dir.display()))?;
    files.retain(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "yaml"));
    files.sort();

    let Some(path) = files.into_iter().next() else {
        return Ok(None);
    };
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read resource file {}", path.display()))?;
    let resource = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse resource file {}", path.display()))?;
    Ok(Some(resource))
}

/// Submits a configuration pass for the pod described in `dir`, if any.
pub fn enqueue(dir: &Path, queue: &Submitter) -> Result<()> {
    let Some(PodResource {
        name,
        namespace,
        labels,
    }) = load(dir)?
    else {
        info!(dir = %dir.display(), "No resource file found");
        return Ok(());
    };

    info!(%namespace, %name, ?labels, "Reconciling declared pod");
    queue
        .enqueue(Trigger::Config { namespace, name })
        .context("failed to submit declared pod")
}

//! Synthesizes generator prompts from an intent and the live topology.

mod config;
mod user;

use crate::{
    cluster::Topology,
    core::{Entities, EntityKind, NetworkDescriptor},
    Error, SharedCluster,
};

/// Turns intents into prompts, resolving pods against the cluster.
#[derive(Clone)]
pub struct Synthesizer {
    topology: Topology<SharedCluster>,
}

/// The prompts for one pass, along with the pod they are about.
#[derive(Clone, Debug)]
pub struct Synthesis {
    pub descriptor: NetworkDescriptor,
    pub prompts: Vec<String>,
}

impl Synthesizer {
    pub fn new(topology: Topology<SharedCluster>) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &Topology<SharedCluster> {
        &self.topology
    }

    /// Replaces every `POLICY` entity in the prompts with the object kind of
    /// the cluster's network plugin.
    async fn substitute_policy_kind(
        &self,
        prompts: Vec<String>,
        entities: &Entities,
    ) -> Result<Vec<String>, Error> {
        let mentions = entities
            .all(EntityKind::Policy)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>();
        if mentions.is_empty() || prompts.is_empty() {
            return Ok(prompts);
        }

        let kind = self.topology.detect_plugin().await?.policy_kind();
        Ok(prompts
            .into_iter()
            .map(|prompt| {
                mentions
                    .iter()
                    .fold(prompt, |prompt, mention| prompt.replace(mention, kind))
            })
            .collect())
    }
}

/// Renders a label pair as `key: value`.
fn label_text(label: Option<(&str, &str)>) -> String {
    label.map(|(k, v)| format!("{k}: {v}")).unwrap_or_default()
}

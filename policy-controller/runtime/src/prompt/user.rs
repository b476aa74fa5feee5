use super::{label_text, Synthesis, Synthesizer};
use crate::{
    core::{descriptor::Direction, Entities, EntityKind, NetworkDescriptor},
    k8s::labels::Map,
    Error,
};

impl Synthesizer {
    /// Builds prompts for an operator's intent from its classified entities.
    ///
    /// When the intent names two pods, a single prompt describes the flow
    /// between them. Otherwise one prompt is produced for every other pod
    /// selected by the named pod's service.
    pub async fn user(&self, intent: &str, entities: &Entities) -> Result<Synthesis, Error> {
        let pod_name = entities
            .pod_name()
            .ok_or_else(|| Error::PodNotFound("the intent names no pod".to_string()))?;
        if pod_name.eq_ignore_ascii_case("pod") {
            return Err(Error::AmbiguousPod(format!(
                "{:?} does not identify a pod",
                entities.last(EntityKind::PodName).unwrap_or(pod_name)
            )));
        }
        let namespace = entities.namespace();
        let direction = entities.direction();

        let mut intent = intent.to_string();
        if intent.matches(pod_name).count() == 2 {
            intent = intent.replacen(&format!("{pod_name} pod"), pod_name, 1);
            intent = intent.replacen(pod_name, &format!("{pod_name} pod"), 1);
        }

        let descriptor = self
            .topology
            .describe_by_short_name(namespace, pod_name)
            .await?;
        if let Some((k, v)) = descriptor.labels.first() {
            intent = intent.replace("pod", &format!("pod labeled '{k}: {v}'"));
        }

        let names = entities.pod_names();
        let prompts = match names.iter().find(|name| **name != pod_name) {
            Some(other) if names.len() == 2 => {
                let other = self
                    .topology
                    .describe_by_short_name(namespace, other)
                    .await?;
                vec![two_pod_prompt(&intent, direction, &descriptor, &other)]
            }
            _ => {
                self.sibling_prompts(&intent, entities, direction, &descriptor)
                    .await?
            }
        };
        tracing::debug!(pod = %descriptor.name, %namespace, %direction, ?prompts, "Synthesized prompts");

        let prompts = self.substitute_policy_kind(prompts, entities).await?;
        Ok(Synthesis {
            descriptor,
            prompts,
        })
    }

    /// One prompt per pod sharing the named pod's service, excluding the
    /// named pod itself.
    async fn sibling_prompts(
        &self,
        intent: &str,
        entities: &Entities,
        direction: Direction,
        named: &NetworkDescriptor,
    ) -> Result<Vec<String>, Error> {
        let selector = self.topology.service_selector(named).await?;
        let first = selector
            .into_iter()
            .next()
            .into_iter()
            .collect::<Map>();
        let siblings = self
            .topology
            .list_by_selector(&named.namespace, &first)
            .await?;

        let labels = entities.all(EntityKind::Label).collect::<Vec<_>>();
        let prompts = siblings
            .iter()
            .filter(|sibling| sibling.name != named.name)
            .map(|sibling| {
                let label = label_text(sibling.labels.first());
                let mut prompt = intent.to_string();
                for entity in labels.iter().filter(|l| **l != label) {
                    prompt = prompt.replace(
                        &format!("{entity} pod"),
                        &format!("pod labeled '{label}'"),
                    );
                }
                prompt = prompt.replacen(
                    "traffic",
                    &format!(
                        "traffic {} '{} pod' labeled '{label}'",
                        direction.preposition(),
                        sibling.name
                    ),
                    1,
                );
                with_traffic_over(prompt, named)
            })
            .collect::<Vec<_>>();
        if prompts.is_empty() {
            tracing::info!(pod = %named.name, "No related pods share the pod's service");
        }
        Ok(prompts)
    }
}

fn two_pod_prompt(
    intent: &str,
    direction: Direction,
    named: &NetworkDescriptor,
    other: &NetworkDescriptor,
) -> String {
    let intent = intent
        .replace("from endpoint", "")
        .replace("to endpoint", "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let prompt = intent.replacen(
        "traffic",
        &format!(
            "traffic {} '{} pod' labeled '{}'",
            direction.preposition(),
            other.name,
            label_text(other.identifying_label())
        ),
        1,
    );
    let owner = match direction {
        Direction::Ingress => named,
        Direction::Egress => other,
    };
    with_traffic_over(prompt, owner)
}

/// Adds the owner's ports and protocols to the first mention of traffic
/// unless the prompt already states them.
fn with_traffic_over(prompt: String, owner: &NetworkDescriptor) -> String {
    if prompt.contains("traffic over") {
        return prompt;
    }
    prompt.replacen("traffic", &format!("traffic over {}", owner.traffic()), 1)
}

//! Drives a single reconciliation pass from a trigger to enforced policies.

use crate::{
    core::{convert, Classify, Entities, NetworkDescriptor},
    enforce::Enforcer,
    generate::Orchestrator,
    metrics::ReconcileMetrics,
    prompt::Synthesizer,
    validation::Validator,
    Error,
};
use std::{fmt, sync::Arc};
use tokio::time;
use tracing::{debug, info, info_span, warn, Instrument};

/// What started a pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// An operator's natural-language intent.
    Intent(String),

    /// A pod's configuration, observed by the pod watch or read from a
    /// resource file.
    Config { namespace: String, name: String },
}

/// The pod a pass is about. At most one pass runs per key at a time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub namespace: String,
    pub name: String,
}

/// A trigger that has been resolved to a key and is ready to run.
#[derive(Debug)]
pub struct Plan {
    key: Key,
    trigger: Trigger,
    entities: Entities,
}

#[derive(Debug)]
pub enum Outcome {
    Done(Completion),
    /// The pass hit a transient cluster error and may be retried.
    Requeue(Error),
}

#[derive(Debug)]
pub enum Completion {
    Enforced(usize),
    NoPrompts,
    /// The watched pod no longer exists.
    Deleted,
    Failed(Error),
}

#[derive(Clone)]
pub struct Reconciler {
    classifier: Arc<dyn Classify>,
    synthesizer: Synthesizer,
    orchestrator: Orchestrator,
    validator: Validator,
    enforcer: Enforcer,
    metrics: ReconcileMetrics,
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        classifier: Arc<dyn Classify>,
        synthesizer: Synthesizer,
        orchestrator: Orchestrator,
        validator: Validator,
        enforcer: Enforcer,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            classifier,
            synthesizer,
            orchestrator,
            validator,
            enforcer,
            metrics,
        }
    }

    /// Runs a full pass for a trigger, without coordinating with other
    /// passes.
    pub async fn reconcile(&self, trigger: Trigger) -> Outcome {
        let start = time::Instant::now();
        let label = trigger.label();
        let outcome = match self.plan(trigger).await {
            Ok(plan) => self.run(plan).await,
            Err(error) => Outcome::from(Err::<Completion, _>(error)),
        };
        self.metrics.record(label, &outcome, start);
        outcome
    }

    /// Resolves a trigger to the pod it is about. Intents are classified
    /// here, so that passes can be ordered per pod before any cluster work.
    pub async fn plan(&self, trigger: Trigger) -> Result<Plan, Error> {
        match trigger {
            Trigger::Intent(intent) => {
                let entities = self
                    .classifier
                    .classify(&intent)
                    .await
                    .map_err(Error::Classification)?;
                debug!(?entities, "Classified intent");
                let key = self.intent_key(&entities).await?;
                Ok(Plan {
                    key,
                    trigger: Trigger::Intent(intent),
                    entities,
                })
            }
            Trigger::Config { namespace, name } => Ok(Plan::config(namespace, name)),
        }
    }

    /// Keys an intent on the pod it resolves to, so that it is ordered with
    /// the configuration passes for that pod. Intents that cannot name a pod
    /// keep the classified name and fail when the pass runs.
    async fn intent_key(&self, entities: &Entities) -> Result<Key, Error> {
        let namespace = entities.namespace();
        let name = match entities.pod_name() {
            Some(name) if !name.eq_ignore_ascii_case("pod") => self
                .synthesizer
                .topology()
                .describe_by_short_name(namespace, name)
                .await?
                .name,
            name => name.unwrap_or_default().to_string(),
        };
        Ok(Key {
            namespace: namespace.to_string(),
            name,
        })
    }

    /// Runs a planned pass to completion.
    pub async fn run(&self, plan: Plan) -> Outcome {
        let span = info_span!("reconcile", ns = %plan.key.namespace, pod = %plan.key.name, trigger = plan.trigger.label());
        self.execute(plan).instrument(span).await.into()
    }

    pub(crate) fn record(&self, trigger: &Trigger, outcome: &Outcome, start: time::Instant) {
        self.metrics.record(trigger.label(), outcome, start);
    }

    async fn execute(&self, plan: Plan) -> Result<Completion, Error> {
        let Plan {
            key,
            trigger,
            entities,
        } = plan;

        let (descriptor, prompts) = match trigger {
            Trigger::Intent(intent) => {
                let synthesis = self.synthesizer.user(&intent, &entities).await?;
                (synthesis.descriptor, synthesis.prompts)
            }
            Trigger::Config { .. } => {
                let descriptor = match self.describe(&key).await? {
                    Some(descriptor) => descriptor,
                    None => return Ok(Completion::Deleted),
                };
                let prompts = self.synthesizer.config(&descriptor).await?;
                (descriptor, prompts)
            }
        };
        if prompts.is_empty() {
            info!("No prompts to generate policies from");
            return Ok(Completion::NoPrompts);
        }

        let texts = self.orchestrator.generate_with_retry(&prompts).await?;

        let (policies, errors) = convert(&texts, &descriptor, &entities);
        for error in &errors {
            warn!(%error, "Failed to convert generated policy");
        }
        if policies.is_empty() {
            return Err(Error::Conversion(errors));
        }

        let report = self.validator.validate(&policies).await;
        if !report.is_clean() {
            let errors = report.into_errors();
            for error in &errors {
                info!(%error, "Policy failed validation");
            }
            return Err(Error::Validation(errors));
        }

        let applied = self.enforcer.apply(&policies).await?;
        Ok(Completion::Enforced(applied))
    }

    /// Describes a watched pod, treating a pod that is gone as deleted.
    async fn describe(&self, key: &Key) -> Result<Option<NetworkDescriptor>, Error> {
        match self
            .synthesizer
            .topology()
            .describe(&key.namespace, &key.name)
            .await
            .map_err(Error::from)
        {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(Error::PodNotFound(pod)) => {
                debug!(%pod, "Pod no longer exists");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}

// === impl Plan ===

impl Plan {
    /// Configuration passes need no classification.
    pub fn config(namespace: String, name: String) -> Self {
        Self {
            key: Key {
                namespace: namespace.clone(),
                name: name.clone(),
            },
            trigger: Trigger::Config { namespace, name },
            entities: Entities::default(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }
}

// === impl Trigger ===

impl Trigger {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Intent(_) => "intent",
            Self::Config { .. } => "config",
        }
    }
}

// === impl Key ===

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Outcome ===

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Done(Completion::Enforced(_)) => "enforced",
            Self::Done(Completion::NoPrompts) => "no_prompts",
            Self::Done(Completion::Deleted) => "deleted",
            Self::Done(Completion::Failed(_)) => "failed",
            Self::Requeue(_) => "requeue",
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Done(Completion::Failed(error)) | Self::Requeue(error) => Some(error),
            Self::Done(_) => None,
        }
    }
}

impl From<Result<Completion, Error>> for Outcome {
    fn from(result: Result<Completion, Error>) -> Self {
        match result {
            Ok(completion) => Self::Done(completion),
            Err(error) if error.is_transient() => {
                warn!(%error, "Reconciliation interrupted");
                Self::Requeue(error)
            }
            Err(error) => {
                info!(%error, kind = error.kind(), "Reconciliation failed");
                Self::Done(Completion::Failed(error))
            }
        }
    }
}

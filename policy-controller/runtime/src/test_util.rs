use crate::{
    cluster::{InMemoryCluster, Topology},
    core::{
        generate::{parse_output, Generate, GenerateError},
        Classify, Entities, Entity,
    },
    enforce::Enforcer,
    generate::Orchestrator,
    k8s::{
        labels::Map, Container, ContainerPort, EnvVar, ObjectMeta, Pod, PodSpec, Service,
        ServiceSpec,
    },
    metrics::{GenerationMetrics, ReconcileMetrics},
    prompt::Synthesizer,
    reconcile::Reconciler,
    validation::Validator,
    SharedCluster,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

pub fn mk_pod(
    ns: &str,
    name: &str,
    labels: Map,
    ports: &[(i32, Option<&str>)],
    env: &[(&str, &str)],
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                ports: Some(
                    ports
                        .iter()
                        .map(|(port, proto)| ContainerPort {
                            container_port: *port,
                            protocol: proto.map(str::to_string),
                            ..Default::default()
                        })
                        .collect(),
                ),
                env: Some(
                    env.iter()
                        .map(|(k, v)| EnvVar {
                            name: k.to_string(),
                            value: Some(v.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn mk_service(ns: &str, name: &str, selector: Map) -> Service {
    Service {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn synthesizer() -> (Arc<InMemoryCluster>, Synthesizer) {
    let cluster = Arc::new(InMemoryCluster::default());
    let shared: SharedCluster = cluster.clone();
    (cluster, Synthesizer::new(Topology::new(shared, "kube-system")))
}

/// Builds a reconciler over an in-memory cluster whose classifier always
/// returns `entities`.
pub fn reconciler(
    entities: Vec<Entity>,
    generator: Arc<FakeGenerator>,
) -> (Arc<InMemoryCluster>, Reconciler) {
    let (cluster, synthesizer) = synthesizer();
    let shared: SharedCluster = cluster.clone();
    let orchestrator = Orchestrator::new(
        generator,
        "default",
        Duration::from_secs(90),
        3,
        Duration::from_secs(2),
        GenerationMetrics::default(),
    );
    let reconciler = Reconciler::new(
        Arc::new(FakeClassifier(entities.into_iter().collect())),
        synthesizer,
        orchestrator,
        Validator::new(shared.clone()),
        Enforcer::new(shared),
        ReconcileMetrics::default(),
    );
    (cluster, reconciler)
}

pub struct FakeClassifier(pub Entities);

#[async_trait::async_trait]
impl Classify for FakeClassifier {
    async fn classify(&self, _intent: &str) -> anyhow::Result<Entities> {
        Ok(self.0.clone())
    }
}

/// How a [`FakeGenerator`] answers each prompt.
pub enum Reply {
    /// Returns the prompt itself.
    Echo,
    /// Never returns.
    Hang,
    /// Returns the text after the output marker.
    Fixed(String),
    Delayed(Duration, String),
    /// Answers calls in order, repeating the last answer. Errors are
    /// contract violations.
    Script(Vec<Result<String, String>>),
}

pub struct FakeGenerator {
    reply: Reply,
    prompts: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl FakeGenerator {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            prompts: Default::default(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }

    pub fn models(&self) -> Vec<String> {
        self.prompts.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Generate for FakeGenerator {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, GenerateError> {
        let call = {
            let mut prompts = self.prompts.lock();
            prompts.push((model.to_string(), prompt.to_string()));
            prompts.len() - 1
        };
        let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(n, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match &self.reply {
            Reply::Echo => Ok(prompt.to_string()),
            Reply::Hang => futures::future::pending().await,
            Reply::Fixed(text) => parse_output(text),
            Reply::Delayed(delay, text) => {
                tokio::time::sleep(*delay).await;
                parse_output(text)
            }
            Reply::Script(answers) => match answers.get(call).or_else(|| answers.last()) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(output)) => Err(GenerateError::ContractViolation(output.clone())),
                None => Err(GenerateError::ContractViolation(String::new())),
            },
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

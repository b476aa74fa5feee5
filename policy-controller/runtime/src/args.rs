use crate::{
    classify::ProcessClassifier,
    cluster::{KubeCluster, Topology},
    enforce::Enforcer,
    generate::{Orchestrator, ProcessGenerator},
    intent::{self, IntentService},
    k8s::{self, Time},
    metrics::{GenerationMetrics, ReconcileMetrics},
    prompt::Synthesizer,
    queue,
    reconcile::Reconciler,
    resource,
    validation::Validator,
    watch::PodEvents,
    SharedCluster,
};
use anyhow::{bail, Result};
use clap::Parser;
use k8s_openapi::chrono::Utc;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "intent-policy",
    about = "Generates and enforces network policies from operator intents"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "intent_policy=info,warn",
        env = "INTENT_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the intent server.
    #[clap(long)]
    intent_server_disabled: bool,

    #[clap(long, default_value = "0.0.0.0:9090")]
    intent_addr: SocketAddr,

    /// Disables reconciliation of new and changed pods.
    #[clap(long)]
    pod_watch_disabled: bool,

    /// The generation model, or `default`.
    #[clap(long, default_value = "default", env = "INTENT_POLICY_MODEL")]
    model: String,

    #[clap(long, default_value = "python3")]
    generator_interpreter: PathBuf,

    #[clap(long, default_value = "models/config-policy-generate-pipe.py")]
    generator_script: PathBuf,

    /// Passed to the generator to authenticate with its model registry.
    #[clap(
        long,
        default_value = "",
        env = "INTENT_POLICY_GENERATOR_TOKEN",
        hide_env_values = true
    )]
    generator_token: String,

    #[clap(long, default_value = "python3")]
    classifier_interpreter: PathBuf,

    #[clap(long, default_value = "models/predict.py")]
    classifier_script: PathBuf,

    /// Bounds each generation attempt, across all of its prompts.
    #[clap(long, default_value = "90")]
    generation_deadline_secs: u64,

    #[clap(long, default_value = "3")]
    generation_attempts: usize,

    #[clap(long, default_value = "2000")]
    generation_backoff_ms: u64,

    /// How long a watched pod waits before a pass interrupted by a cluster
    /// error is retried.
    #[clap(long, default_value = "5000")]
    requeue_delay_ms: u64,

    #[clap(long, default_value = "100")]
    queue_capacity: usize,

    /// A directory whose first `*.yaml` file describes a pod to reconcile at
    /// startup.
    #[clap(long)]
    resource_dir: Option<PathBuf>,

    /// Pods in this namespace are never watched or used as peers.
    #[clap(long, default_value = "kube-system")]
    system_namespace: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            intent_server_disabled,
            intent_addr,
            pod_watch_disabled,
            model,
            generator_interpreter,
            generator_script,
            generator_token,
            classifier_interpreter,
            classifier_script,
            generation_deadline_secs,
            generation_attempts,
            generation_backoff_ms,
            requeue_delay_ms,
            queue_capacity,
            resource_dir,
            system_namespace,
        } = self;

        let mut prom = <Registry>::default();
        let reconcile_metrics =
            ReconcileMetrics::register(prom.sub_registry_with_prefix("reconcile"));
        let generation_metrics =
            GenerationMetrics::register(prom.sub_registry_with_prefix("generation"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;
        let started = Time(Utc::now());

        let cluster: SharedCluster = Arc::new(KubeCluster::new(runtime.client()));
        let topology = Topology::new(cluster.clone(), system_namespace.clone());
        let synthesizer = Synthesizer::new(topology);
        let orchestrator = Orchestrator::new(
            Arc::new(ProcessGenerator::new(
                generator_interpreter,
                generator_script,
                generator_token,
            )),
            model,
            Duration::from_secs(generation_deadline_secs),
            generation_attempts,
            Duration::from_millis(generation_backoff_ms),
            generation_metrics,
        );
        let reconciler = Reconciler::new(
            Arc::new(ProcessClassifier::new(
                classifier_interpreter,
                classifier_script,
            )),
            synthesizer,
            orchestrator,
            Validator::new(cluster.clone()),
            Enforcer::new(cluster),
            reconcile_metrics,
        );

        // All passes, whatever triggered them, are ordered by a single queue.
        let (submitter, queue) = queue::channel(
            reconciler,
            queue_capacity,
            Duration::from_millis(requeue_delay_ms),
        );
        tokio::spawn(
            queue
                .run(runtime.shutdown_handle())
                .instrument(info_span!("queue")),
        );

        if pod_watch_disabled {
            info!("Pod watch disabled");
        } else {
            let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
            let events = PodEvents::shared(submitter.clone(), started, system_namespace);
            tokio::spawn(kubert::index::namespaced(events, pods).instrument(info_span!("pods")));
        }

        if let Some(dir) = resource_dir {
            resource::enqueue(&dir, &submitter)?;
        }

        if intent_server_disabled {
            info!("Intent server disabled");
        } else {
            tokio::spawn(intent::serve(
                intent_addr,
                IntentService::new(submitter),
                runtime.shutdown_handle(),
            ));
        }

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

use crate::{
    core::generate::{parse_output, Generate, GenerateError},
    metrics::GenerationMetrics,
    Error,
};
use anyhow::{anyhow, Context};
use futures::{stream::FuturesUnordered, TryStreamExt};
use std::{path::PathBuf, sync::Arc};
use tokio::{process::Command, time};
use tracing::{debug, info, warn};

/// Model ids that select the default network-policy model.
const DEFAULT_MODEL_ALIAS: &str = "default";
pub const DEFAULT_MODEL: &str = "cclabadmin/codegemma-7b-it-network";

/// Runs the policy-text generator as a child process:
/// `<interpreter> <script> --model=<id> --prompt=<prompt> --token=<token>`.
#[derive(Clone, Debug)]
pub struct ProcessGenerator {
    interpreter: PathBuf,
    script: PathBuf,
    token: String,
}

/// Runs a batch of prompts through a generator under a shared deadline,
/// retrying failed batches.
#[derive(Clone)]
pub struct Orchestrator {
    generator: Arc<dyn Generate>,
    model: String,
    deadline: time::Duration,
    attempts: usize,
    backoff: time::Duration,
    metrics: GenerationMetrics,
}

// === impl ProcessGenerator ===

impl ProcessGenerator {
    pub fn new(
        interpreter: impl Into<PathBuf>,
        script: impl Into<PathBuf>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl Generate for ProcessGenerator {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, GenerateError> {
        // The child is killed if this future is dropped, e.g. when the batch
        // deadline expires or a sibling unit fails.
        let output = Command::new(&self.interpreter)
            .arg(&self.script)
            .arg(format!("--model={model}"))
            .arg(format!("--prompt={prompt}"))
            .arg(format!("--token={}", self.token))
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.script.display()))
            .map_err(GenerateError::Failed)?;
        if !output.status.success() {
            return Err(GenerateError::Failed(anyhow!(
                "generator exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}

// === impl Orchestrator ===

impl Orchestrator {
    pub fn new(
        generator: Arc<dyn Generate>,
        model: impl Into<String>,
        deadline: time::Duration,
        attempts: usize,
        backoff: time::Duration,
        metrics: GenerationMetrics,
    ) -> Self {
        let model = match model.into() {
            m if m == DEFAULT_MODEL_ALIAS => DEFAULT_MODEL.to_string(),
            m => m,
        };
        Self {
            generator,
            model,
            deadline,
            attempts: attempts.max(1),
            backoff,
            metrics,
        }
    }

    /// Generates policy text for every prompt, retrying the whole batch up to
    /// the configured number of attempts.
    pub async fn generate_with_retry(&self, prompts: &[String]) -> Result<Vec<String>, Error> {
        let mut attempt = 1;
        loop {
            let result = self.generate(prompts).await;
            self.metrics.record(&result);
            match result {
                Ok(texts) => return Ok(texts),
                Err(error) if attempt < self.attempts => {
                    warn!(%error, attempt, "Policy generation failed; retrying");
                    attempt += 1;
                    time::sleep(self.backoff).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Generates policy text for every prompt concurrently.
    ///
    /// Results are returned in completion order. The first failure, or the
    /// expiry of the deadline, fails the whole batch and cancels the units
    /// still in flight.
    pub async fn generate(&self, prompts: &[String]) -> Result<Vec<String>, Error> {
        debug!(model = %self.model, prompts = prompts.len(), "Generating policies");
        let units = prompts
            .iter()
            .map(|prompt| self.generator.generate(&self.model, prompt))
            .collect::<FuturesUnordered<_>>();
        match time::timeout(self.deadline, units.try_collect::<Vec<_>>()).await {
            Ok(Ok(texts)) => {
                info!(policies = texts.len(), "Generated policies");
                Ok(texts)
            }
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(Error::GenerationTimeout(self.deadline)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeGenerator, Reply};
    use std::time::Duration;

    fn orchestrator(generator: Arc<FakeGenerator>) -> Orchestrator {
        Orchestrator::new(
            generator,
            "default",
            Duration::from_secs(90),
            3,
            Duration::from_secs(2),
            GenerationMetrics::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn collects_every_prompt() {
        let generator = Arc::new(FakeGenerator::new(Reply::Echo));
        let orch = orchestrator(generator.clone());
        let mut texts = orch
            .generate(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        texts.sort();
        assert_eq!(texts, ["a", "b"]);
        assert_eq!(generator.models(), [DEFAULT_MODEL, DEFAULT_MODEL]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_the_batch() {
        let generator = Arc::new(FakeGenerator::new(Reply::Hang));
        let orch = orchestrator(generator.clone());
        let start = time::Instant::now();
        let err = orch.generate(&["a".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::GenerationTimeout(_)), "{err}");
        assert_eq!(start.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn one_failure_fails_the_batch() {
        let generator = Arc::new(FakeGenerator::new(Reply::Script(vec![
            Ok("policy".to_string()),
            Err("no marker".to_string()),
        ])));
        let orch = orchestrator(generator);
        let err = orch
            .generate(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GenerationContractViolation(_)), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff() {
        let generator = Arc::new(FakeGenerator::new(Reply::Script(vec![
            Err("first".to_string()),
            Err("second".to_string()),
            Ok("policy".to_string()),
        ])));
        let orch = orchestrator(generator.clone());
        let start = time::Instant::now();
        let texts = orch.generate_with_retry(&["a".to_string()]).await.unwrap();
        assert_eq!(texts, ["policy"]);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert_eq!(generator.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let generator = Arc::new(FakeGenerator::new(Reply::Hang));
        let orch = orchestrator(generator.clone());
        let err = orch.generate_with_retry(&["a".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::GenerationTimeout(_)), "{err}");
        assert_eq!(generator.calls(), 3);
    }

    #[test]
    fn keeps_explicit_models() {
        let orch = Orchestrator::new(
            Arc::new(FakeGenerator::new(Reply::Echo)),
            "org/other-model",
            Duration::from_secs(1),
            0,
            Duration::ZERO,
            GenerationMetrics::default(),
        );
        assert_eq!(orch.model, "org/other-model");
        assert_eq!(orch.attempts, 1);
    }
}

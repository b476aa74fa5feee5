use crate::core::{Classify, Entities};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;

/// Runs the entity classifier as a child process:
/// `<interpreter> <script> --text <intent>`.
#[derive(Clone, Debug)]
pub struct ProcessClassifier {
    interpreter: PathBuf,
    script: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Output {
    entities: Entities,
}

impl ProcessClassifier {
    pub fn new(interpreter: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
        }
    }
}

#[async_trait::async_trait]
impl Classify for ProcessClassifier {
    async fn classify(&self, intent: &str) -> Result<Entities> {
        let output = Command::new(&self.interpreter)
            .arg(&self.script)
            .arg("--text")
            .arg(intent)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.script.display()))?;
        if !output.status.success() {
            bail!(
                "classifier exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_output(&output.stdout)
    }
}

fn parse_output(stdout: &[u8]) -> Result<Entities> {
    let Output { entities } =
        serde_json::from_slice(stdout).context("classifier output is not valid JSON")?;
    tracing::debug!(?entities, "Classified intent");
    Ok(entities)
}

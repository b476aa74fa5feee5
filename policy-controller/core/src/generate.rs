/// Produces policy text for a single prompt.
#[async_trait::async_trait]
pub trait Generate: Send + Sync + 'static {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, GenerateError>;
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("generator failed: {0:#}")]
    Failed(anyhow::Error),

    #[error("generator output does not begin with `Generated text:`: {0:?}")]
    ContractViolation(String),
}

/// Prefix that precedes generated text on the generator's output.
pub const MARKER: &str = "Generated text:";

/// Progress lines printed by the generator's environment before its output.
const NOISE: &[&str] = &["Requirement already satisfied", "Loading checkpoint shards"];

/// Extracts generated text from the generator's standard output.
pub fn parse_output(stdout: &str) -> Result<String, GenerateError> {
    let output = stdout
        .lines()
        .filter(|l| !NOISE.iter().any(|n| l.contains(n)))
        .collect::<Vec<_>>()
        .join("\n");
    match output.trim_start().strip_prefix(MARKER) {
        Some(text) => Ok(text.trim().to_string()),
        None => {
            let excerpt = output.trim().chars().take(80).collect();
            Err(GenerateError::ContractViolation(excerpt))
        }
    }
}

#[async_trait::async_trait]
impl<G: Generate> Generate for std::sync::Arc<G> {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, GenerateError> {
        (**self).generate(model, prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_marker_and_progress() {
        let stdout = "Requirement already satisfied: torch\n\
                      Loading checkpoint shards: 100%\n\
                      Generated text:\napiVersion: cilium.io/v2\nkind: CiliumNetworkPolicy\n";
        assert_eq!(
            parse_output(stdout).unwrap(),
            "apiVersion: cilium.io/v2\nkind: CiliumNetworkPolicy"
        );
    }

    #[test]
    fn rejects_unmarked_output() {
        let err = parse_output("Traceback (most recent call last):").unwrap_err();
        assert!(matches!(err, GenerateError::ContractViolation(_)));
    }
}

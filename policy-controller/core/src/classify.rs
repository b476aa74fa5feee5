use crate::entity::Entities;
use anyhow::Result;

/// Extracts typed entities from a natural-language intent.
#[async_trait::async_trait]
pub trait Classify: Send + Sync {
    async fn classify(&self, intent: &str) -> Result<Entities>;
}

#[async_trait::async_trait]
impl<C: Classify + ?Sized> Classify for std::sync::Arc<C> {
    async fn classify(&self, intent: &str) -> Result<Entities> {
        (**self).classify(intent).await
    }
}

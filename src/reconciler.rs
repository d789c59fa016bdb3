use crate::model::{Device, ObjectKey};
use async_trait::async_trait;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Retry,
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn changed(&self, device: &Device) -> anyhow::Result<Outcome>;
    async fn missing(&self, device: &ObjectKey) -> anyhow::Result<Outcome>;
}

//! Object store capability consumed by the operator.

mod memory;

pub use memory::MemoryStore;

use crate::model::{Device, Interface, LabelSelector, ObjectKey};
use async_trait::async_trait;
use futures::stream::BoxStream;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(ObjectKey),
    #[error("conflict on {key}: expected version {expected}, got {actual}")]
    Conflict {
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Device,
    Interface,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change<T> {
    Created(T),
    Updated { old: T, new: T },
    Deleted(T),
}

impl<T> Change<T> {
    /// The latest known state of the object.
    pub fn object(&self) -> &T {
        match self {
            Self::Created(object) | Self::Deleted(object) => object,
            Self::Updated { new, .. } => new,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Device(Change<Device>),
    Interface(Change<Interface>),
}

impl Event {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Device(_) => Kind::Device,
            Self::Interface(_) => Kind::Interface,
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            Self::Device(change) => change.object().metadata.key(),
            Self::Interface(change) => change.object().metadata.key(),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_device(&self, key: &ObjectKey) -> Result<Option<Device>, StoreError>;

    /// List devices, of a single namespace or of all namespaces.
    async fn list_devices(&self, namespace: Option<&str>) -> Result<Vec<Device>, StoreError>;

    async fn get_interface(&self, key: &ObjectKey) -> Result<Option<Interface>, StoreError>;

    async fn list_interfaces(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Interface>, StoreError>;

    /// Replace the status of a device.
    ///
    /// Fails with [`StoreError::Conflict`] when the device was written since it was read.
    async fn update_device_status(&self, device: &Device) -> Result<Device, StoreError>;

    fn watch(&self, kind: Kind) -> BoxStream<'static, Event>;
}

//! Reconciles the interfaces attached to a device.

use crate::{
    commit,
    device::DeviceModels,
    diff,
    model::{
        validate_selectors, Condition, Device, DeviceStatus, Interface, InterfaceReference,
        ObjectKey,
    },
    queue::{DeviceQueue, WorkItem},
    reconciler::{Outcome, Reconciler},
    store::{ObjectStore, StoreError},
};
use anyhow::anyhow;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;

pub struct AttachmentReconciler {
    store: Arc<dyn ObjectStore>,
    models: Arc<DeviceModels>,
    queue: Arc<DeviceQueue>,
}

impl AttachmentReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        models: Arc<DeviceModels>,
        queue: Arc<DeviceQueue>,
    ) -> Self {
        Self {
            store,
            models,
            queue,
        }
    }
}

#[async_trait]
impl Reconciler for AttachmentReconciler {
    async fn changed(&self, device: &Device) -> anyhow::Result<Outcome> {
        let key = device.metadata.key();
        let model = self.models.entry(&key);
        let mut model = model.lock().await;

        // work from the latest persisted state, not from what triggered us
        let mut device = match self.store.get_device(&key).await? {
            Some(device) => device,
            None => {
                drop(model);
                return self.missing(&key).await;
            }
        };
        model.set_vendor(&device.spec.vendor);

        let mut status = device.status.clone();

        if let Err(err) = validate_selectors(&device.spec.interface_selectors) {
            log::warn!("Device {key} has malformed selectors: {err}");
            status.set_condition(Condition::selectors_invalid(&err));
            return self.persist(&mut device, status).await;
        }
        status.set_condition(Condition::selectors_valid());

        let desired = self.resolve(&device).await?;
        let references: IndexMap<String, InterfaceReference> = desired
            .iter()
            .map(|(name, interface)| (name.clone(), interface.reference()))
            .collect();

        let diff = diff::diff(&references, &device.status.interfaces);
        log::debug!(
            "Device {key}: {} create, {} update, {} delete, {} unchanged",
            diff.creates.len(),
            diff.updates.len(),
            diff.deletes.len(),
            diff.unchanged.len()
        );
        status.interfaces = commit::plan(diff);

        let outcome = self.persist(&mut device, status).await?;
        if outcome == Outcome::Complete {
            self.queue
                .enqueue(WorkItem::new(key, device.spec.vendor.clone(), desired));
        }

        Ok(outcome)
    }

    async fn missing(&self, device: &ObjectKey) -> anyhow::Result<Outcome> {
        log::info!("Device {device} is gone, discarding its configuration work");

        if self.queue.forget(device).is_some() {
            log::debug!("Dropped queued work for {device}");
        }
        self.models.remove(device);

        Ok(Outcome::Complete)
    }
}

impl AttachmentReconciler {
    /// Union of all interfaces selected by the device, deduplicated by name.
    async fn resolve(&self, device: &Device) -> anyhow::Result<IndexMap<String, Interface>> {
        let mut desired = IndexMap::new();
        for selector in &device.spec.interface_selectors {
            let interfaces = self
                .store
                .list_interfaces(&device.metadata.namespace, selector)
                .await
                .map_err(|err| anyhow!(err).context("list interfaces"))?;
            for interface in interfaces {
                desired
                    .entry(interface.metadata.name.clone())
                    .or_insert(interface);
            }
        }
        Ok(desired)
    }

    /// Write the new status, unless nothing changed.
    async fn persist(
        &self,
        device: &mut Device,
        status: DeviceStatus,
    ) -> anyhow::Result<Outcome> {
        if status == device.status {
            log::debug!("Status of {} is up to date", device.metadata.key());
            return Ok(Outcome::Complete);
        }

        device.status = status;
        match self.store.update_device_status(device).await {
            Ok(updated) => {
                *device = updated;
                Ok(Outcome::Complete)
            }
            Err(StoreError::Conflict { .. }) => Ok(Outcome::Retry),
            Err(StoreError::NotFound(key)) => self.missing(&key).await,
            Err(err) => Err(anyhow!(err).context("update device status")),
        }
    }
}

use crate::model::{Device, Interface, ObjectKey};
use crate::reconciler::{Outcome, Reconciler};
use crate::store::{Change, Event, Kind, ObjectStore};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio::{join, time::Duration};

pub struct Operator<R>
where
    R: Reconciler,
{
    reconciler: R,
    store: Arc<dyn ObjectStore>,
    namespace: Option<String>,
    interval: Duration,
    max_retries: usize,
}

impl<R> Operator<R>
where
    R: Reconciler,
{
    pub fn new(
        reconciler: R,
        store: Arc<dyn ObjectStore>,
        namespace: Option<String>,
        interval: Duration,
        max_retries: usize,
    ) -> Self {
        Self {
            reconciler,
            store,
            namespace,
            interval,
            max_retries,
        }
    }

    pub async fn provision_devices(&self, devices: Vec<Device>) {
        for device in devices {
            let key = device.metadata.key();
            if let Err(err) = self.reconcile(&key).await {
                log::warn!("Failed to reconcile device {key}: {err:#}");
            }
        }
    }

    pub async fn reconcile_devices(&self) {
        log::info!(
            "Reconciling devices with interval {}",
            humantime::format_duration(self.interval)
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            match self.store.list_devices(self.namespace.as_deref()).await {
                Ok(devices) => self.provision_devices(devices).await,
                Err(err) => log::warn!("Failed to list devices: {err}"),
            }
        }
    }

    pub async fn run(&self) -> Result<(), anyhow::Error> {
        let events = stream::select(
            self.store.watch(Kind::Device),
            self.store.watch(Kind::Interface),
        )
        .boxed();

        join!(self.reconcile_devices(), self.process_events(events));
        Ok(())
    }

    pub async fn process_events(&self, mut events: BoxStream<'static, Event>) {
        log::info!("Processing events");
        while let Some(event) = events.next().await {
            if !self.watched(&event.key()) {
                continue;
            }
            if let Err(err) = self.handle_event(event).await {
                log::warn!("Failed to handle event: {err:#}");
            }
        }
        log::info!("Event stream closed");
    }

    fn watched(&self, key: &ObjectKey) -> bool {
        self.namespace
            .as_ref()
            .map_or(true, |namespace| &key.namespace == namespace)
    }

    pub async fn handle_event(&self, event: Event) -> anyhow::Result<()> {
        match event {
            Event::Device(Change::Created(device)) => {
                self.handle_changed_device(&device.metadata.key()).await
            }
            Event::Device(Change::Updated { old, new }) => {
                // our own status writes come back as updates, ignore those
                if old.spec == new.spec && old.metadata.labels == new.metadata.labels {
                    log::trace!("Skipping status update of {}", new.metadata.key());
                    return Ok(());
                }
                self.handle_changed_device(&new.metadata.key()).await
            }
            Event::Device(Change::Deleted(device)) => {
                self.handle_missing_device(&device.metadata.key()).await
            }
            Event::Interface(change) => self.handle_interface(change).await,
        }
    }

    async fn handle_changed_device(&self, device: &ObjectKey) -> anyhow::Result<()> {
        log::info!("Handle changed device: {device}");
        self.reconcile(device).await
    }

    async fn handle_missing_device(&self, device: &ObjectKey) -> anyhow::Result<()> {
        log::info!("Handle missing device: {device}");
        self.reconciler.missing(device).await.map(|_| ())
    }

    /// Re-run every device of the namespace which could care about the interface.
    async fn handle_interface(&self, change: Change<Interface>) -> anyhow::Result<()> {
        let (old, new) = match &change {
            Change::Created(interface) | Change::Deleted(interface) => (None, interface),
            Change::Updated { old, new } => {
                if old.spec == new.spec && old.metadata.labels == new.metadata.labels {
                    return Ok(());
                }
                (Some(old), new)
            }
        };

        let devices = self
            .store
            .list_devices(Some(&new.metadata.namespace))
            .await?;

        for device in devices {
            if interested(&device, old, new) {
                let key = device.metadata.key();
                if let Err(err) = self.reconcile(&key).await {
                    log::warn!("Failed to reconcile device {key}: {err:#}");
                }
            }
        }

        Ok(())
    }

    async fn reconcile(&self, device: &ObjectKey) -> anyhow::Result<()> {
        for _ in 0..=self.max_retries {
            let outcome = if let Some(current) = self.store.get_device(device).await? {
                self.reconciler.changed(&current).await?
            } else {
                self.reconciler.missing(device).await?
            };

            match outcome {
                Outcome::Complete => {
                    log::debug!("Reconciled device {device}");
                    return Ok(());
                }
                Outcome::Retry => {
                    log::info!("Need to retry device {device}");
                    continue;
                }
            }
        }

        anyhow::bail!(
            "device {device} still conflicting after {} attempts",
            self.max_retries + 1
        )
    }
}

/// Whether an interface change may affect a device: it is (or was) selected, or
/// the device still tracks it.
pub fn interested(device: &Device, old: Option<&Interface>, new: &Interface) -> bool {
    device.selects(&new.metadata.labels)
        || old.map_or(false, |old| device.selects(&old.metadata.labels))
        || device.status.interfaces.contains_key(&new.metadata.name)
}

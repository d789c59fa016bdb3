use super::{Change, Event, Kind, ObjectStore, StoreError};
use crate::model::{Device, Interface, LabelSelector, ObjectKey};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::instrument;

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    devices: BTreeMap<ObjectKey, Device>,
    interfaces: BTreeMap<ObjectKey, Interface>,
    version: u64,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// In-process object store, with optimistic concurrency on status updates.
pub struct MemoryStore {
    state: RwLock<State>,
    events: broadcast::Sender<Event>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Default::default(),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: Event) {
        log::debug!("Emit {:?} event for {}", event.kind(), event.key());
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Create or replace a device's metadata and spec, keeping its status.
    pub fn apply_device(&self, mut device: Device) -> Device {
        let key = device.metadata.key();
        let change = {
            let mut state = self.write();
            device.metadata.resource_version = state.next_version();
            let old = state.devices.get(&key).cloned();
            match old {
                Some(old) => {
                    device.status = old.status.clone();
                    state.devices.insert(key, device.clone());
                    Change::Updated {
                        old,
                        new: device.clone(),
                    }
                }
                None => {
                    state.devices.insert(key, device.clone());
                    Change::Created(device.clone())
                }
            }
        };
        self.emit(Event::Device(change));
        device
    }

    pub fn delete_device(&self, key: &ObjectKey) -> Option<Device> {
        let removed = self.write().devices.remove(key);
        if let Some(device) = &removed {
            self.emit(Event::Device(Change::Deleted(device.clone())));
        }
        removed
    }

    pub fn apply_interface(&self, mut interface: Interface) -> Interface {
        let key = interface.metadata.key();
        let change = {
            let mut state = self.write();
            interface.metadata.resource_version = state.next_version();
            match state.interfaces.insert(key, interface.clone()) {
                Some(old) => Change::Updated {
                    old,
                    new: interface.clone(),
                },
                None => Change::Created(interface.clone()),
            }
        };
        self.emit(Event::Interface(change));
        interface
    }

    pub fn delete_interface(&self, key: &ObjectKey) -> Option<Interface> {
        let removed = self.write().interfaces.remove(key);
        if let Some(interface) = &removed {
            self.emit(Event::Interface(Change::Deleted(interface.clone())));
        }
        removed
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_device(&self, key: &ObjectKey) -> Result<Option<Device>, StoreError> {
        Ok(self.read().devices.get(key).cloned())
    }

    async fn list_devices(&self, namespace: Option<&str>) -> Result<Vec<Device>, StoreError> {
        Ok(self
            .read()
            .devices
            .values()
            .filter(|d| namespace.map_or(true, |ns| d.metadata.namespace == ns))
            .cloned()
            .collect())
    }

    async fn get_interface(&self, key: &ObjectKey) -> Result<Option<Interface>, StoreError> {
        Ok(self.read().interfaces.get(key).cloned())
    }

    async fn list_interfaces(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Interface>, StoreError> {
        Ok(self
            .read()
            .interfaces
            .values()
            .filter(|i| i.metadata.namespace == namespace && selector.matches(&i.metadata.labels))
            .cloned()
            .collect())
    }

    #[instrument(skip_all, err, fields(device = %device.metadata.key()))]
    async fn update_device_status(&self, device: &Device) -> Result<Device, StoreError> {
        let key = device.metadata.key();
        let (old, new) = {
            let mut state = self.write();
            let current = state
                .devices
                .get(&key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            if current.metadata.resource_version != device.metadata.resource_version {
                return Err(StoreError::Conflict {
                    key,
                    expected: device.metadata.resource_version,
                    actual: current.metadata.resource_version,
                });
            }

            let mut new = current.clone();
            new.status = device.status.clone();
            new.metadata.resource_version = state.next_version();
            state.devices.insert(key, new.clone());
            (current, new)
        };

        self.emit(Event::Device(Change::Updated {
            old,
            new: new.clone(),
        }));
        Ok(new)
    }

    fn watch(&self, kind: Kind) -> BoxStream<'static, Event> {
        stream::unfold(self.events.subscribe(), move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.kind() == kind => return Some((event, rx)),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        // the periodic resync picks up whatever got lost
                        log::warn!("Watch on {kind:?} lagged, skipped {skipped} events");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

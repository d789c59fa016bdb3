use crate::model::{Interface, ObjectKey};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;

/// A device, and the interfaces actually configured on it.
#[derive(Clone, Debug)]
pub struct DeviceModel {
    key: ObjectKey,
    vendor: String,
    interfaces: IndexMap<String, Interface>,
}

impl DeviceModel {
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            vendor: String::new(),
            interfaces: IndexMap::new(),
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn set_vendor(&mut self, vendor: &str) {
        if self.vendor != vendor {
            if !self.vendor.is_empty() {
                log::info!(
                    "Device {} changed vendor: {} -> {vendor}",
                    self.key,
                    self.vendor
                );
            }
            self.vendor = vendor.to_string();
        }
    }

    /// Record an interface as configured, replacing an earlier version.
    pub fn attach(&mut self, interface: Interface) {
        self.interfaces
            .insert(interface.metadata.name.clone(), interface);
    }

    pub fn detach(&mut self, name: &str) -> Option<Interface> {
        self.interfaces.shift_remove(name)
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.get(name)
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.interfaces.contains_key(name)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.values()
    }
}

/// All known device models. Each sits behind its own lock, which serializes
/// status read-modify-write cycles for that device.
#[derive(Debug, Default)]
pub struct DeviceModels {
    devices: std::sync::Mutex<HashMap<ObjectKey, Arc<Mutex<DeviceModel>>>>,
}

impl DeviceModels {
    pub fn new() -> Self {
        Default::default()
    }

    fn devices(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectKey, Arc<Mutex<DeviceModel>>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the model of a device, creating an empty one on first use.
    pub fn entry(&self, key: &ObjectKey) -> Arc<Mutex<DeviceModel>> {
        self.devices()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceModel::new(key.clone()))))
            .clone()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Mutex<DeviceModel>>> {
        self.devices().get(key).cloned()
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<Mutex<DeviceModel>>> {
        self.devices().remove(key)
    }

    pub fn len(&self) -> usize {
        self.devices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

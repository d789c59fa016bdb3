use crate::model::{Device, Interface};
use crate::store::MemoryStore;
use std::fs::File;
use std::path::Path;

/// Devices and interfaces to seed the store with.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Device>,
}

impl Manifest {
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty() && self.devices.is_empty()
    }

    /// Apply all objects, interfaces first so the first pass of a device
    /// already sees what it selects.
    pub fn apply(self, store: &MemoryStore) {
        log::info!(
            "Applying manifest: {} interfaces, {} devices",
            self.interfaces.len(),
            self.devices.len()
        );
        for interface in self.interfaces {
            store.apply_interface(interface);
        }
        for device in self.devices {
            store.apply_device(device);
        }
    }
}

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Manifest> {
    Ok(serde_yaml::from_reader(File::open(path)?)?)
}

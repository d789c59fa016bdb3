//! Reference driver, rendering set-style configuration lines.

use super::{validate, DriverAdapter, DriverError, UnitAddress};
use crate::model::Interface;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::{Mutex, PoisonError};

pub const VENDOR: &str = "acme";

/// Keeps the rendered configuration per physical port, standing in for the device.
#[derive(Debug, Default)]
pub struct AcmeDriver {
    running: Mutex<IndexMap<String, Vec<String>>>,
}

impl AcmeDriver {
    pub fn new() -> Self {
        Default::default()
    }

    /// The configuration lines currently applied for a port.
    pub fn running_config(&self, identifier: &str) -> Option<Vec<String>> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identifier)
            .cloned()
    }

    fn render(identifier: &str, addresses: &[UnitAddress]) -> Vec<String> {
        addresses
            .iter()
            .map(|a| {
                format!(
                    "set interface {identifier} unit {} family {} address {}",
                    a.unit, a.family, a.address
                )
            })
            .collect()
    }

    fn set(&self, interface: &Interface) -> Result<(), DriverError> {
        let addresses = validate(interface)?;
        let identifier = &interface.spec.interface_identifier;
        let lines = Self::render(identifier, &addresses);
        for line in &lines {
            log::info!("{line}");
        }

        // replacing the whole port config keeps repeated calls idempotent
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identifier.clone(), lines);
        Ok(())
    }
}

#[async_trait]
impl DriverAdapter for AcmeDriver {
    async fn create(&self, interface: &Interface) -> Result<(), DriverError> {
        self.set(interface)
    }

    async fn update(&self, interface: &Interface) -> Result<(), DriverError> {
        self.set(interface)
    }

    async fn delete(&self, interface: &Interface) -> Result<(), DriverError> {
        let identifier = &interface.spec.interface_identifier;
        if identifier.trim().is_empty() {
            return Err(DriverError::MissingIdentifier);
        }

        log::info!("delete interface {identifier}");
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(identifier);
        Ok(())
    }
}

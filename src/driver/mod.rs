//! Vendor drivers, turning interfaces into device configuration.

pub mod acme;
pub mod remote;

use crate::model::{Interface, Operation};
use async_trait::async_trait;
use indexmap::IndexMap;
use ipnet::IpNet;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("invalid address '{address}' on unit {unit}: {reason}")]
    InvalidAddress {
        unit: u32,
        address: String,
        reason: String,
    },
    #[error("interface has no identifier")]
    MissingIdentifier,
    #[error("no driver registered for vendor '{0}'")]
    UnknownVendor(String),
    #[error("device rejected configuration: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("driver call timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl Display for AddressFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet => f.write_str("inet"),
            Self::Inet6 => f.write_str("inet6"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitAddress {
    pub unit: u32,
    pub family: AddressFamily,
    pub address: IpNet,
}

/// Validate all addresses of an interface, classifying their family.
pub fn validate(interface: &Interface) -> Result<Vec<UnitAddress>, DriverError> {
    if interface.spec.interface_identifier.trim().is_empty() {
        return Err(DriverError::MissingIdentifier);
    }

    let mut result = Vec::new();
    for unit in &interface.spec.units {
        for address in &unit.addresses {
            let net: IpNet =
                address
                    .trim()
                    .parse()
                    .map_err(|err: ipnet::AddrParseError| DriverError::InvalidAddress {
                        unit: unit.id,
                        address: address.clone(),
                        reason: err.to_string(),
                    })?;
            let family = match net {
                IpNet::V4(_) => AddressFamily::Inet,
                IpNet::V6(_) => AddressFamily::Inet6,
            };
            result.push(UnitAddress {
                unit: unit.id,
                family,
                address: net,
            });
        }
    }

    Ok(result)
}

/// Configuration backend for one device vendor.
///
/// All calls must be idempotent, a worker may repeat them after a partial failure.
#[async_trait]
pub trait DriverAdapter: Send + Sync {
    async fn create(&self, interface: &Interface) -> Result<(), DriverError>;
    async fn update(&self, interface: &Interface) -> Result<(), DriverError>;
    async fn delete(&self, interface: &Interface) -> Result<(), DriverError>;

    async fn apply(&self, operation: Operation, interface: &Interface) -> Result<(), DriverError> {
        match operation {
            Operation::Create => self.create(interface).await,
            Operation::Update => self.update(interface).await,
            Operation::Delete => self.delete(interface).await,
        }
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum DriverConfig {
    Acme,
    Remote(remote::RemoteConfig),
}

/// Vendor name to driver lookup.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn DriverAdapter>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Build a registry from configuration. The `acme` driver is always available.
    pub fn from_config(config: &IndexMap<String, DriverConfig>) -> anyhow::Result<Self> {
        let registry = Self::new();
        registry.register(acme::VENDOR, Arc::new(acme::AcmeDriver::new()));

        for (vendor, config) in config {
            let driver: Arc<dyn DriverAdapter> = match config {
                DriverConfig::Acme => {
                    log::info!("Registering acme driver for vendor '{vendor}'");
                    Arc::new(acme::AcmeDriver::new())
                }
                DriverConfig::Remote(config) => {
                    log::info!("Registering remote driver for vendor '{vendor}': {}", config.url);
                    Arc::new(remote::RemoteDriver::new(config)?)
                }
            };
            registry.register(vendor, driver);
        }

        Ok(registry)
    }

    pub fn register<V: Into<String>>(&self, vendor: V, driver: Arc<dyn DriverAdapter>) {
        self.drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vendor.into(), driver);
    }

    pub fn resolve(&self, vendor: &str) -> Result<Arc<dyn DriverAdapter>, DriverError> {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vendor)
            .cloned()
            .ok_or_else(|| DriverError::UnknownVendor(vendor.to_string()))
    }

    pub fn vendors(&self) -> Vec<String> {
        let mut vendors: Vec<_> = self
            .drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        vendors.sort();
        vendors
    }
}

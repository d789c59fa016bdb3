pub mod attachment;
pub mod commit;
pub mod config;
pub mod device;
pub mod diff;
pub mod driver;
pub mod hash;
pub mod model;
pub mod operator;
pub mod queue;
pub mod reconciler;
pub mod store;
pub mod worker;

pub use operator::*;

use crate::attachment::AttachmentReconciler;
use crate::device::DeviceModels;
use crate::driver::{DriverConfig, DriverRegistry};
use crate::queue::DeviceQueue;
use crate::store::MemoryStore;
use crate::worker::ConfigWorker;
use anyhow::Context;
use drogue_bazaar::app::{Startup, StartupExt};
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, serde::Deserialize)]
pub struct Config {
    operator: OperatorConfig,
    /// Drivers by vendor, `acme` is always available.
    #[serde(default)]
    drivers: IndexMap<String, DriverConfig>,
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct OperatorConfig {
    /// Only manage devices of this namespace (will use all namespaces by default)
    #[serde(default)]
    namespace: Option<String>,

    /// YAML manifest of devices and interfaces to start with
    #[serde(default)]
    manifest: Option<PathBuf>,

    /// Number of concurrent configuration workers
    #[serde(default = "default_workers")]
    workers: usize,

    /// Interval reconciling devices
    #[serde(default, with = "humantime_serde")]
    interval: Option<Duration>,

    /// Timeout of a single driver call
    #[serde(default, with = "humantime_serde")]
    driver_timeout: Option<Duration>,

    /// Retries of a pass losing a status write race
    #[serde(default = "default_max_retries")]
    max_retries: usize,
}

const fn default_workers() -> usize {
    4
}

const fn default_max_retries() -> usize {
    5
}

pub async fn run(config: Config, startup: &mut dyn Startup) -> anyhow::Result<()> {
    log::info!("Config: {config:#?}");

    let drivers = Arc::new(DriverRegistry::from_config(&config.drivers)?);
    let config = config.operator;

    log::info!("Drivers: {:?}", drivers.vendors());

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &config.manifest {
        crate::config::load(path)
            .with_context(|| format!("Failed to load manifest: {}", path.display()))?
            .apply(&store);
    }

    let models = Arc::new(DeviceModels::new());
    let queue = Arc::new(DeviceQueue::new());

    for _ in 0..config.workers.max(1) {
        let worker = ConfigWorker::new(
            store.clone(),
            models.clone(),
            queue.clone(),
            drivers.clone(),
            config.driver_timeout.unwrap_or(Duration::from_secs(30)),
        );
        startup.spawn(async move { worker.run().await });
    }

    log::info!("Starting operator");

    let app = Operator::new(
        AttachmentReconciler::new(store.clone(), models, queue),
        store,
        config.namespace,
        config.interval.unwrap_or(Duration::from_secs(60)),
        config.max_retries,
    );

    startup.spawn(async move { app.run().await });

    Ok(())
}

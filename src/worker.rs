use crate::commit::{self, Completion};
use crate::device::{DeviceModel, DeviceModels};
use crate::driver::{DriverAdapter, DriverError, DriverRegistry};
use crate::model::{Device, Interface, InterfaceReference, ObjectKey, Operation};
use crate::queue::{DeviceQueue, WorkItem};
use crate::store::{ObjectStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// A driver call owed for one interface.
#[derive(Clone, Debug)]
struct Task {
    name: String,
    operation: Operation,
    /// Status reference the task was planned against.
    reference: InterfaceReference,
    interface: Interface,
    /// Configuration left on a port the interface moved away from.
    previous: Option<Interface>,
}

#[derive(Debug)]
struct Outcome {
    task: Task,
    result: Result<(), DriverError>,
}

/// Drains the device queue, pushing configuration through the vendor drivers.
pub struct ConfigWorker {
    store: Arc<dyn ObjectStore>,
    models: Arc<DeviceModels>,
    queue: Arc<DeviceQueue>,
    drivers: Arc<DriverRegistry>,
    timeout: Duration,
    max_conflicts: usize,
}

impl ConfigWorker {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        models: Arc<DeviceModels>,
        queue: Arc<DeviceQueue>,
        drivers: Arc<DriverRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            models,
            queue,
            drivers,
            timeout,
            max_conflicts: 5,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        log::info!(
            "Config worker started (driver timeout: {})",
            humantime::format_duration(self.timeout)
        );
        while let Some(item) = self.queue.drain().await {
            let device = item.device.clone();
            if let Err(err) = self.process(item).await {
                log::warn!("Failed to apply configuration for {device}: {err:#}");
            }
            self.queue.done(&device);
        }
        log::info!("Config worker stopped");
        Ok(())
    }

    /// Apply one work item, returning the number of status entries it resolved.
    pub async fn process(&self, item: WorkItem) -> anyhow::Result<usize> {
        let device = match self.store.get_device(&item.device).await? {
            Some(device) => device,
            None => {
                log::debug!("Device {} is gone, dropping work", item.device);
                return Ok(0);
            }
        };

        let tasks = self.plan(&device, &item).await;
        if tasks.is_empty() {
            log::debug!("Nothing to apply for {}", item.device);
            return Ok(0);
        }

        log::info!(
            "Applying {} interface(s) to {} (vendor: {})",
            tasks.len(),
            item.device,
            device.spec.vendor
        );

        let driver = self.drivers.resolve(&device.spec.vendor);
        let mut outcomes = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.into_iter().enumerate() {
            if index > 0 && self.store.get_device(&item.device).await?.is_none() {
                log::info!("Device {} is gone, abandoning its push", item.device);
                self.models.remove(&item.device);
                return Ok(0);
            }

            let result = match &driver {
                Ok(driver) => self.invoke(driver.as_ref(), &task).await,
                Err(err) => Err(err.clone()),
            };
            match &result {
                Ok(()) => log::info!("{} {} on {}: ok", task.operation, task.name, item.device),
                Err(err) => log::warn!(
                    "{} {} on {}: {err}",
                    task.operation,
                    task.name,
                    item.device
                ),
            }
            outcomes.push(Outcome { task, result });
        }

        self.record(&item.device, outcomes).await
    }

    /// Collect the pending entries this item can serve.
    async fn plan(&self, device: &Device, item: &WorkItem) -> Vec<Task> {
        let model = self.models.entry(&item.device);
        let model = model.lock().await;

        let mut tasks = Vec::new();
        for (name, entry) in &device.status.interfaces {
            let operation = match entry.commit_status.pending_operation() {
                Some(operation) => operation,
                None => continue,
            };

            let interface = match operation {
                Operation::Delete => model
                    .interface(name)
                    .cloned()
                    .unwrap_or_else(|| Interface::from_reference(&entry.interface_ref)),
                Operation::Create | Operation::Update => match item.interfaces.get(name) {
                    Some(interface) if interface.reference() == entry.interface_ref => {
                        interface.clone()
                    }
                    // a newer item carries the matching payload
                    _ => {
                        log::debug!("Skipping {name} on {}, payload is stale", item.device);
                        continue;
                    }
                },
            };

            let previous = match operation {
                Operation::Delete => None,
                Operation::Create | Operation::Update => model
                    .interface(name)
                    .filter(|attached| {
                        attached.spec.interface_identifier != interface.spec.interface_identifier
                    })
                    .cloned(),
            };

            tasks.push(Task {
                name: name.clone(),
                operation,
                reference: entry.interface_ref.clone(),
                interface,
                previous,
            });
        }
        tasks
    }

    async fn invoke(&self, driver: &dyn DriverAdapter, task: &Task) -> Result<(), DriverError> {
        if let Some(previous) = &task.previous {
            log::info!(
                "{} moved from {} to {}, removing old port",
                task.name,
                previous.spec.interface_identifier,
                task.interface.spec.interface_identifier
            );
            self.call(driver, Operation::Delete, previous).await?;
        }
        self.call(driver, task.operation, &task.interface).await
    }

    async fn call(
        &self,
        driver: &dyn DriverAdapter,
        operation: Operation,
        interface: &Interface,
    ) -> Result<(), DriverError> {
        match tokio::time::timeout(self.timeout, driver.apply(operation, interface)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(self.timeout)),
        }
    }

    /// Write outcomes back, re-reading the device when the write conflicts.
    async fn record(&self, key: &ObjectKey, outcomes: Vec<Outcome>) -> anyhow::Result<usize> {
        let model = self.models.entry(key);
        let mut model = model.lock().await;
        track(&mut model, &outcomes);

        for _ in 0..=self.max_conflicts {
            let mut device = match self.store.get_device(key).await? {
                Some(device) => device,
                None => {
                    self.models.remove(key);
                    return Ok(0);
                }
            };

            let mut resolved = 0;
            for Outcome { task, result } in &outcomes {
                let entry = match device.status.interfaces.get(&task.name) {
                    Some(entry) => entry,
                    None => continue,
                };
                if entry.interface_ref != task.reference {
                    log::debug!("{} on {key} changed meanwhile, dropping outcome", task.name);
                    continue;
                }

                match commit::complete(entry, task.operation, result) {
                    Ok(Completion::Record(status)) => {
                        device.status.interfaces.insert(task.name.clone(), status);
                    }
                    Ok(Completion::Purge) => {
                        device.status.interfaces.shift_remove(&task.name);
                    }
                    Err(err) => {
                        log::debug!("Dropping outcome for {} on {key}: {err}", task.name);
                        continue;
                    }
                }
                resolved += 1;
            }

            if resolved == 0 {
                return Ok(0);
            }

            match self.store.update_device_status(&device).await {
                Ok(_) => return Ok(resolved),
                Err(StoreError::Conflict { .. }) => {
                    log::info!("Conflict writing status of {key}, retrying");
                    continue;
                }
                Err(StoreError::NotFound(_)) => {
                    self.models.remove(key);
                    return Ok(0);
                }
                Err(err) => return Err(anyhow::anyhow!(err).context("record commit status")),
            }
        }

        anyhow::bail!(
            "giving up on status of {key} after {} conflicts",
            self.max_conflicts + 1
        )
    }
}

/// Mirror successful driver calls into the device model.
fn track(model: &mut DeviceModel, outcomes: &[Outcome]) {
    for Outcome { task, result } in outcomes {
        if result.is_err() {
            continue;
        }
        match task.operation {
            Operation::Create | Operation::Update => model.attach(task.interface.clone()),
            Operation::Delete => {
                model.detach(&task.name);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::acme::AcmeDriver;
    use crate::model::{CommitStatus, DeviceSpec, InterfaceRefStatus, InterfaceSpec, Metadata, Unit};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use indexmap::IndexMap;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Slow driver tracking how many calls overlap per device port prefix.
    #[derive(Default)]
    struct SlowDriver {
        active: Mutex<HashMap<String, usize>>,
        max_overlap: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SlowDriver {
        async fn call(&self, interface: &Interface) -> Result<(), DriverError> {
            let device = interface
                .spec
                .interface_identifier
                .split(':')
                .next()
                .unwrap_or_default()
                .to_string();
            {
                let mut active = self.active.lock().unwrap();
                let count = active.entry(device.clone()).or_default();
                *count += 1;
                self.max_overlap.fetch_max(*count, Ordering::SeqCst);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            *self.active.lock().unwrap().get_mut(&device).unwrap() -= 1;
            Ok(())
        }
    }

    #[async_trait]
    impl DriverAdapter for SlowDriver {
        async fn create(&self, interface: &Interface) -> Result<(), DriverError> {
            self.call(interface).await
        }
        async fn update(&self, interface: &Interface) -> Result<(), DriverError> {
            self.call(interface).await
        }
        async fn delete(&self, interface: &Interface) -> Result<(), DriverError> {
            self.call(interface).await
        }
    }

    struct Hanging;

    #[async_trait]
    impl DriverAdapter for Hanging {
        async fn create(&self, _: &Interface) -> Result<(), DriverError> {
            futures::future::pending().await
        }
        async fn update(&self, _: &Interface) -> Result<(), DriverError> {
            futures::future::pending().await
        }
        async fn delete(&self, _: &Interface) -> Result<(), DriverError> {
            futures::future::pending().await
        }
    }

    fn interface(device: &str, name: &str) -> Interface {
        Interface::new(
            Metadata::new("default", name),
            InterfaceSpec {
                interface_identifier: format!("{device}:{name}"),
                units: vec![Unit::new(0, ["10.0.0.1/24"])],
            },
        )
    }

    /// Store a device with the given interfaces pending creation, returning the matching work item.
    async fn pending_device(
        store: &MemoryStore,
        vendor: &str,
        device: &str,
        names: &[&str],
    ) -> WorkItem {
        let stored = store.apply_device(Device::new(
            Metadata::new("default", device),
            DeviceSpec {
                vendor: vendor.into(),
                interface_selectors: vec![],
            },
        ));

        let interfaces: IndexMap<_, _> = names
            .iter()
            .map(|name| (name.to_string(), interface(device, name)))
            .collect();

        let mut with_status = stored;
        for (name, interface) in &interfaces {
            with_status.status.interfaces.insert(
                name.clone(),
                InterfaceRefStatus::new(interface.reference(), CommitStatus::PendingCreate),
            );
        }
        store.update_device_status(&with_status).await.unwrap();

        WorkItem::new(with_status.metadata.key(), vendor.into(), interfaces)
    }

    fn worker(
        store: Arc<MemoryStore>,
        queue: Arc<DeviceQueue>,
        drivers: Arc<DriverRegistry>,
        timeout: Duration,
    ) -> ConfigWorker {
        ConfigWorker::new(store, Arc::new(DeviceModels::new()), queue, drivers, timeout)
    }

    #[tokio::test]
    async fn test_single_push_per_device() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(DeviceQueue::new());
        let driver = Arc::new(SlowDriver::default());
        let drivers = Arc::new(DriverRegistry::new());
        drivers.register("slow", driver.clone());

        let models = Arc::new(DeviceModels::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let worker = ConfigWorker::new(
                store.clone(),
                models.clone(),
                queue.clone(),
                drivers.clone(),
                Duration::from_secs(5),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        let d1 = pending_device(&store, "slow", "d1", &["eth0", "eth1"]).await;
        let d2 = pending_device(&store, "slow", "d2", &["eth0"]).await;

        // keep triggering the same device while its push is running
        for _ in 0..5 {
            queue.enqueue(d1.clone());
            queue.enqueue(d2.clone());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for _ in 0..100 {
            if queue.is_empty()
                && !queue.is_in_flight(&d1.device)
                && !queue.is_in_flight(&d2.device)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        queue.close();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(driver.max_overlap.load(Ordering::SeqCst), 1);
        assert!(driver.calls.load(Ordering::SeqCst) >= 3);

        let d1 = store.get_device(&d1.device).await.unwrap().unwrap();
        assert!(d1
            .status
            .interfaces
            .values()
            .all(|s| s.commit_status == CommitStatus::SuccessCreate));
    }

    #[tokio::test]
    async fn test_unknown_vendor_fails() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(
            store.clone(),
            Arc::new(DeviceQueue::new()),
            Arc::new(DriverRegistry::new()),
            Duration::from_secs(1),
        );

        let item = pending_device(&store, "nobody", "d1", &["eth0"]).await;
        assert_eq!(worker.process(item.clone()).await.unwrap(), 1);

        let device = store.get_device(&item.device).await.unwrap().unwrap();
        let eth0 = &device.status.interfaces["eth0"];
        assert_eq!(eth0.commit_status, CommitStatus::FailCreate);
        assert!(eth0.message.as_deref().unwrap().contains("nobody"));
    }

    #[tokio::test]
    async fn test_timeout_fails() {
        let store = Arc::new(MemoryStore::new());
        let drivers = Arc::new(DriverRegistry::new());
        drivers.register("hanging", Arc::new(Hanging));
        let worker = worker(
            store.clone(),
            Arc::new(DeviceQueue::new()),
            drivers,
            Duration::from_millis(20),
        );

        let item = pending_device(&store, "hanging", "d1", &["eth0"]).await;
        worker.process(item.clone()).await.unwrap();

        let device = store.get_device(&item.device).await.unwrap().unwrap();
        assert_eq!(
            device.status.interfaces["eth0"].commit_status,
            CommitStatus::FailCreate
        );
    }

    #[tokio::test]
    async fn test_stale_payload_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let drivers = Arc::new(DriverRegistry::from_config(&IndexMap::new()).unwrap());
        let worker = worker(
            store.clone(),
            Arc::new(DeviceQueue::new()),
            drivers,
            Duration::from_secs(1),
        );

        let mut item = pending_device(&store, "acme", "d1", &["eth0"]).await;
        item.interfaces["eth0"].spec.units[0].addresses = vec!["10.0.0.9/24".into()];

        assert_eq!(worker.process(item.clone()).await.unwrap(), 0);
        let device = store.get_device(&item.device).await.unwrap().unwrap();
        assert_eq!(
            device.status.interfaces["eth0"].commit_status,
            CommitStatus::PendingCreate
        );
    }

    #[tokio::test]
    async fn test_missing_device_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(
            store.clone(),
            Arc::new(DeviceQueue::new()),
            Arc::new(DriverRegistry::new()),
            Duration::from_secs(1),
        );

        let item = pending_device(&store, "acme", "d1", &["eth0"]).await;
        store.delete_device(&item.device);
        assert_eq!(worker.process(item).await.unwrap(), 0);
    }

    /// Moves the interface to another port while the call is running.
    struct Moving {
        store: Arc<MemoryStore>,
        identifier: String,
    }

    impl Moving {
        async fn call(&self, interface: &Interface) -> Result<(), DriverError> {
            let key = ObjectKey::new("default", "d1");
            let mut device = self.store.get_device(&key).await.unwrap().unwrap();
            let entry = device
                .status
                .interfaces
                .get_mut(&interface.metadata.name)
                .unwrap();
            entry.interface_ref.interface_identifier = self.identifier.clone();
            entry.commit_status = CommitStatus::PendingUpdate;
            self.store.update_device_status(&device).await.unwrap();
            Ok(())
        }
    }

    #[async_trait]
    impl DriverAdapter for Moving {
        async fn create(&self, interface: &Interface) -> Result<(), DriverError> {
            self.call(interface).await
        }
        async fn update(&self, interface: &Interface) -> Result<(), DriverError> {
            self.call(interface).await
        }
        async fn delete(&self, _: &Interface) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_outcome_for_moved_port_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let drivers = Arc::new(DriverRegistry::new());
        drivers.register(
            "moving",
            Arc::new(Moving {
                store: store.clone(),
                identifier: "d1:other".into(),
            }),
        );
        let worker = worker(
            store.clone(),
            Arc::new(DeviceQueue::new()),
            drivers,
            Duration::from_secs(1),
        );

        let item = pending_device(&store, "moving", "d1", &["eth0"]).await;
        assert_eq!(worker.process(item.clone()).await.unwrap(), 0);

        // same hash, but the new port was never configured
        let device = store.get_device(&item.device).await.unwrap().unwrap();
        let eth0 = &device.status.interfaces["eth0"];
        assert_eq!(eth0.commit_status, CommitStatus::PendingUpdate);
        assert_eq!(eth0.interface_ref.interface_identifier, "d1:other");
    }

    #[tokio::test]
    async fn test_moved_port_is_cleaned_up() {
        let store = Arc::new(MemoryStore::new());
        let acme = Arc::new(AcmeDriver::new());
        let drivers = Arc::new(DriverRegistry::new());
        drivers.register("acme", acme.clone());
        let worker = worker(
            store.clone(),
            Arc::new(DeviceQueue::new()),
            drivers,
            Duration::from_secs(1),
        );

        let item = pending_device(&store, "acme", "d1", &["eth0"]).await;
        worker.process(item.clone()).await.unwrap();
        assert!(acme.running_config("d1:eth0").is_some());

        let mut moved = interface("d1", "eth0");
        moved.spec.interface_identifier = "d1:eth9".into();
        let mut device = store.get_device(&item.device).await.unwrap().unwrap();
        device.status.interfaces.insert(
            "eth0".into(),
            InterfaceRefStatus::new(moved.reference(), CommitStatus::PendingUpdate),
        );
        store.update_device_status(&device).await.unwrap();

        let item = WorkItem::new(
            item.device,
            "acme".into(),
            [("eth0".to_string(), moved)].into_iter().collect(),
        );
        assert_eq!(worker.process(item.clone()).await.unwrap(), 1);

        assert_eq!(acme.running_config("d1:eth0"), None);
        assert_eq!(
            acme.running_config("d1:eth9"),
            Some(vec![
                "set interface d1:eth9 unit 0 family inet address 10.0.0.1/24".to_string()
            ])
        );
        let device = store.get_device(&item.device).await.unwrap().unwrap();
        assert_eq!(
            device.status.interfaces["eth0"].commit_status,
            CommitStatus::SuccessUpdate
        );
    }

    /// Deletes the device on its first call.
    struct Deleting {
        store: Arc<MemoryStore>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DriverAdapter for Deleting {
        async fn create(&self, _: &Interface) -> Result<(), DriverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.store.delete_device(&ObjectKey::new("default", "d1"));
            Ok(())
        }
        async fn update(&self, _: &Interface) -> Result<(), DriverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn delete(&self, _: &Interface) -> Result<(), DriverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_device_deleted_mid_push() {
        let store = Arc::new(MemoryStore::new());
        let models = Arc::new(DeviceModels::new());
        let driver = Arc::new(Deleting {
            store: store.clone(),
            calls: AtomicUsize::new(0),
        });
        let drivers = Arc::new(DriverRegistry::new());
        drivers.register("deleting", driver.clone());
        let worker = ConfigWorker::new(
            store.clone(),
            models.clone(),
            Arc::new(DeviceQueue::new()),
            drivers,
            Duration::from_secs(1),
        );

        let item = pending_device(&store, "deleting", "d1", &["eth0", "eth1", "eth2"]).await;
        assert_eq!(worker.process(item.clone()).await.unwrap(), 0);

        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
        assert!(models.get(&item.device).is_none());
    }
}

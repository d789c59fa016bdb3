//! Per-device configuration work queue.
//!
//! Every device has at most one undelivered item; enqueueing again replaces it,
//! so only the latest desired state gets pushed. A device handed out by
//! [`DeviceQueue::drain`] stays in flight, and is not handed out again until the
//! worker reports [`DeviceQueue::done`].

use crate::model::{Interface, ObjectKey};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub device: ObjectKey,
    pub vendor: String,
    /// The full desired interfaces, keyed by name.
    pub interfaces: IndexMap<String, Interface>,
}

impl WorkItem {
    pub fn new(device: ObjectKey, vendor: String, interfaces: IndexMap<String, Interface>) -> Self {
        Self {
            device,
            vendor,
            interfaces,
        }
    }
}

#[derive(Default)]
struct Inner {
    pending: IndexMap<ObjectKey, WorkItem>,
    in_flight: HashSet<ObjectKey>,
    closed: bool,
}

#[derive(Default)]
pub struct DeviceQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl DeviceQueue {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue work for a device, superseding undelivered work for it.
    ///
    /// Returns `true` if an earlier item got replaced.
    pub fn enqueue(&self, item: WorkItem) -> bool {
        let superseded = {
            let mut inner = self.lock();
            if inner.closed {
                log::debug!("Queue closed, dropping work for {}", item.device);
                return false;
            }
            inner.pending.insert(item.device.clone(), item).is_some()
        };
        self.notify.notify_waiters();
        superseded
    }

    fn take(&self) -> Option<Option<WorkItem>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.closed {
            return Some(None);
        }

        let index = inner
            .pending
            .keys()
            .position(|device| !inner.in_flight.contains(device))?;
        let (device, item) = inner.pending.shift_remove_index(index)?;
        inner.in_flight.insert(device);
        Some(Some(item))
    }

    /// Wait for the next item of a device which is not in flight.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn drain(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking, so a concurrent enqueue can't slip through
            notified.as_mut().enable();

            if let Some(item) = self.take() {
                return item;
            }

            notified.await;
        }
    }

    /// Release a device handed out by [`Self::drain`].
    pub fn done(&self, device: &ObjectKey) {
        let has_more = {
            let mut inner = self.lock();
            inner.in_flight.remove(device);
            inner.pending.contains_key(device)
        };
        if has_more {
            self.notify.notify_waiters();
        }
    }

    /// Discard undelivered work of a device.
    pub fn forget(&self, device: &ObjectKey) -> Option<WorkItem> {
        self.lock().pending.shift_remove(device)
    }

    /// Stop handing out work, releasing all waiting workers.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_in_flight(&self, device: &ObjectKey) -> bool {
        self.lock().in_flight.contains(device)
    }

    /// Number of undelivered items.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

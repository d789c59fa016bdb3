//! Desired vs. actual classification of a device's interfaces.

use crate::model::{CommitStatus, InterfaceRefStatus, InterfaceReference};
use indexmap::IndexMap;

/// Result of comparing the desired interface set with the recorded one.
///
/// Each interface name lands in exactly one bucket, carrying its seeded status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diff {
    pub creates: Vec<InterfaceRefStatus>,
    pub updates: Vec<InterfaceRefStatus>,
    pub deletes: Vec<InterfaceRefStatus>,
    pub unchanged: Vec<InterfaceRefStatus>,
}

impl Diff {
    pub fn len(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len() + self.unchanged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.creates
            .iter()
            .chain(&self.updates)
            .chain(&self.deletes)
            .chain(&self.unchanged)
            .map(|status| status.interface_ref.name.as_str())
    }
}

fn drifted(desired: &InterfaceReference, actual: &InterfaceReference) -> bool {
    desired.config_hash != actual.config_hash
        || desired.interface_identifier != actual.interface_identifier
}

pub fn diff(
    desired: &IndexMap<String, InterfaceReference>,
    actual: &IndexMap<String, InterfaceRefStatus>,
) -> Diff {
    let mut result = Diff::default();

    for (name, reference) in desired {
        match actual.get(name) {
            None => result.creates.push(InterfaceRefStatus::new(
                reference.clone(),
                CommitStatus::PendingCreate,
            )),
            // reappeared while its removal was still draining
            Some(current) if current.commit_status.is_deleting() => result.creates.push(
                InterfaceRefStatus::new(reference.clone(), CommitStatus::PendingCreate),
            ),
            Some(current) if drifted(reference, &current.interface_ref) => result.updates.push(
                InterfaceRefStatus::new(reference.clone(), CommitStatus::PendingUpdate),
            ),
            Some(current) => result.unchanged.push(InterfaceRefStatus {
                interface_ref: reference.clone(),
                ..current.clone()
            }),
        }
    }

    for (name, current) in actual {
        if !desired.contains_key(name) {
            result.deletes.push(InterfaceRefStatus::new(
                current.interface_ref.clone(),
                CommitStatus::PendingDelete,
            ));
        }
    }

    for bucket in [
        &mut result.creates,
        &mut result.updates,
        &mut result.deletes,
        &mut result.unchanged,
    ] {
        bucket.sort_by(|a, b| a.interface_ref.name.cmp(&b.interface_ref.name));
    }

    result
}

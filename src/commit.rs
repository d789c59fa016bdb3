//! Per-interface commit status lifecycle.
//!
//! ```text
//! (none) --create--> PendingCreate --ok--> SuccessCreate
//!                                  --err-> FailCreate
//! (none) --update--> PendingUpdate --ok--> SuccessUpdate
//!                                  --err-> FailUpdate
//! any    --delete--> PendingDelete --ok--> SuccessDelete (purged)
//!                                  --err-> FailDelete
//! ```
//!
//! Driver outcomes are only accepted from the matching pending state. Failed
//! creates and updates that are classified as unchanged are re-armed, so the
//! next worker drain retries them.

use crate::diff::Diff;
use crate::driver::DriverError;
use crate::model::{CommitStatus, InterfaceRefStatus, Operation};
use indexmap::IndexMap;
use std::fmt::{self, Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Create,
    Update,
    Delete,
    Unchanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    Classified(Classification),
    Driver { operation: Operation, ok: bool },
}

impl Display for Trigger {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classified(classification) => write!(f, "classified {classification:?}"),
            Self::Driver {
                operation,
                ok: true,
            } => write!(f, "driver {operation} ok"),
            Self::Driver {
                operation,
                ok: false,
            } => write!(f, "driver {operation} error"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("no transition from {from:?} on {trigger}")]
pub struct TransitionError {
    pub from: Option<CommitStatus>,
    pub trigger: Trigger,
}

pub fn transition(
    from: Option<CommitStatus>,
    trigger: Trigger,
) -> Result<CommitStatus, TransitionError> {
    use CommitStatus::*;

    match (from, trigger) {
        (_, Trigger::Classified(Classification::Create)) => Ok(PendingCreate),
        (_, Trigger::Classified(Classification::Update)) => Ok(PendingUpdate),
        (_, Trigger::Classified(Classification::Delete)) => Ok(PendingDelete),
        (Some(FailCreate), Trigger::Classified(Classification::Unchanged)) => Ok(PendingCreate),
        (Some(FailUpdate), Trigger::Classified(Classification::Unchanged)) => Ok(PendingUpdate),
        (Some(current), Trigger::Classified(Classification::Unchanged)) => Ok(current),
        (Some(current), Trigger::Driver { operation, ok })
            if current == CommitStatus::pending(operation) =>
        {
            Ok(if ok {
                CommitStatus::success(operation)
            } else {
                CommitStatus::fail(operation)
            })
        }
        (from, trigger) => Err(TransitionError { from, trigger }),
    }
}

/// Build the next status map of a device from a diff.
pub fn plan(diff: Diff) -> IndexMap<String, InterfaceRefStatus> {
    let Diff {
        creates,
        updates,
        deletes,
        unchanged,
    } = diff;

    let classified = creates
        .into_iter()
        .map(|s| (s, Classification::Create))
        .chain(updates.into_iter().map(|s| (s, Classification::Update)))
        .chain(deletes.into_iter().map(|s| (s, Classification::Delete)))
        .chain(unchanged.into_iter().map(|s| (s, Classification::Unchanged)));

    let mut result = IndexMap::new();
    for (mut status, classification) in classified {
        let from = match classification {
            Classification::Unchanged => Some(status.commit_status),
            _ => None,
        };
        // the catch-all arm is unreachable for classification triggers with a source state
        let next = transition(from, Trigger::Classified(classification))
            .unwrap_or(status.commit_status);
        if next != status.commit_status {
            status.message = None;
        }
        status.commit_status = next;
        result.insert(status.interface_ref.name.clone(), status);
    }
    result.sort_keys();
    result
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Keep the entry with its new status.
    Record(InterfaceRefStatus),
    /// The delete was confirmed, drop the entry.
    Purge,
}

/// Apply a driver outcome to a pending entry.
pub fn complete(
    entry: &InterfaceRefStatus,
    operation: Operation,
    outcome: &Result<(), DriverError>,
) -> Result<Completion, TransitionError> {
    let next = transition(
        Some(entry.commit_status),
        Trigger::Driver {
            operation,
            ok: outcome.is_ok(),
        },
    )?;

    if next == CommitStatus::SuccessDelete {
        return Ok(Completion::Purge);
    }

    Ok(Completion::Record(InterfaceRefStatus {
        interface_ref: entry.interface_ref.clone(),
        commit_status: next,
        message: outcome.as_ref().err().map(ToString::to_string),
    }))
}

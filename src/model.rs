use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Namespace-qualified identity of a stored object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new<N: Into<String>, M: Into<String>>(namespace: N, name: M) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Bumped by the store on every write, used for optimistic concurrency.
    #[serde(default)]
    pub resource_version: u64,
}

impl Metadata {
    pub fn new<N: Into<String>, M: Into<String>>(namespace: N, name: M) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            labels: BTreeMap::new(),
            resource_version: 0,
        }
    }

    pub fn with_label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: DeviceSpec,
    #[serde(default)]
    pub status: DeviceStatus,
}

impl Device {
    pub fn new(metadata: Metadata, spec: DeviceSpec) -> Self {
        Self {
            metadata,
            spec,
            status: Default::default(),
        }
    }

    /// Checks whether any of the device's selectors selects the given labels.
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        self.spec
            .interface_selectors
            .iter()
            .any(|selector| selector.matches(labels))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    /// Vendor identifier, used to look up the driver.
    #[serde(default)]
    pub vendor: String,
    #[serde(default, alias = "interfaceSelector")]
    pub interface_selectors: Vec<LabelSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub interfaces: IndexMap<String, InterfaceRefStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl DeviceStatus {
    pub fn condition(&self, r#type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    /// Set a condition, keeping the transition time unless the status flips.
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

pub const CONDITION_SELECTORS_VALID: &str = "SelectorsValid";

impl Condition {
    pub fn selectors_valid() -> Self {
        Self {
            r#type: CONDITION_SELECTORS_VALID.to_string(),
            status: true,
            reason: String::new(),
            message: String::new(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn selectors_invalid(err: &SelectorError) -> Self {
        Self {
            r#type: CONDITION_SELECTORS_VALID.to_string(),
            status: false,
            reason: "MalformedSelector".to_string(),
            message: err.to_string(),
            last_transition_time: Utc::now(),
        }
    }
}

/// A set of required label key/value pairs. An empty selector selects everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct LabelSelector(pub BTreeMap<String, String>);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("selector #{index}: invalid label key '{key}'")]
    InvalidKey { index: usize, key: String },
    #[error("selector #{index}: invalid value '{value}' for label '{key}'")]
    InvalidValue {
        index: usize,
        key: String,
        value: String,
    },
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
    }

    pub fn validate(&self, index: usize) -> Result<(), SelectorError> {
        for (key, value) in &self.0 {
            if !valid_key(key) {
                return Err(SelectorError::InvalidKey {
                    index,
                    key: key.clone(),
                });
            }
            if !value.is_empty() && !valid_name(value) {
                return Err(SelectorError::InvalidValue {
                    index,
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSelector {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

pub fn validate_selectors(selectors: &[LabelSelector]) -> Result<(), SelectorError> {
    selectors
        .iter()
        .enumerate()
        .try_for_each(|(index, selector)| selector.validate(index))
}

// `[prefix/]name`, with the usual label name rules on each part
fn valid_key(key: &str) -> bool {
    match key.split_once('/') {
        Some((prefix, name)) => {
            !prefix.is_empty()
                && prefix.len() <= 253
                && prefix
                    .split('.')
                    .all(|part| !part.is_empty() && valid_name(part))
                && valid_name(name)
        }
        None => valid_name(key),
    }
}

fn valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            bytes.len() <= 63
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        }
        _ => false,
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: InterfaceSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceSpec {
    /// Vendor-agnostic name of the physical port.
    #[serde(default)]
    pub interface_identifier: String,
    #[serde(default)]
    pub units: Vec<Unit>,
}

/// A logical sub-interface.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    #[serde(default)]
    pub id: u32,
    /// Addresses in CIDR notation.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl Unit {
    pub fn new<I, S>(id: u32, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            addresses: addresses.into_iter().map(Into::into).collect(),
        }
    }
}

impl Interface {
    pub fn new(metadata: Metadata, spec: InterfaceSpec) -> Self {
        Self { metadata, spec }
    }

    pub fn config_hash(&self) -> String {
        crate::hash::config_hash(&self.spec)
    }

    pub fn reference(&self) -> InterfaceReference {
        InterfaceReference {
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
            interface_identifier: self.spec.interface_identifier.clone(),
            config_hash: self.config_hash(),
        }
    }

    /// Reconstruct a unit-less interface from a reference, enough to tear it down.
    pub fn from_reference(reference: &InterfaceReference) -> Self {
        Self {
            metadata: Metadata::new(&reference.namespace, &reference.name),
            spec: InterfaceSpec {
                interface_identifier: reference.interface_identifier.clone(),
                units: Vec::new(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceReference {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub interface_identifier: String,
    #[serde(default)]
    pub config_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceRefStatus {
    pub interface_ref: InterfaceReference,
    pub commit_status: CommitStatus,
    /// Last driver error, for the `Fail*` states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl InterfaceRefStatus {
    pub fn new(interface_ref: InterfaceReference, commit_status: CommitStatus) -> Self {
        Self {
            interface_ref,
            commit_status,
            message: None,
        }
    }
}

/// A configuration action against a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
pub enum CommitStatus {
    PendingCreate,
    PendingUpdate,
    PendingDelete,
    SuccessCreate,
    SuccessUpdate,
    SuccessDelete,
    FailCreate,
    FailUpdate,
    FailDelete,
}

impl CommitStatus {
    pub fn pending(operation: Operation) -> Self {
        match operation {
            Operation::Create => Self::PendingCreate,
            Operation::Update => Self::PendingUpdate,
            Operation::Delete => Self::PendingDelete,
        }
    }

    pub fn success(operation: Operation) -> Self {
        match operation {
            Operation::Create => Self::SuccessCreate,
            Operation::Update => Self::SuccessUpdate,
            Operation::Delete => Self::SuccessDelete,
        }
    }

    pub fn fail(operation: Operation) -> Self {
        match operation {
            Operation::Create => Self::FailCreate,
            Operation::Update => Self::FailUpdate,
            Operation::Delete => Self::FailDelete,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Self::PendingCreate | Self::SuccessCreate | Self::FailCreate => Operation::Create,
            Self::PendingUpdate | Self::SuccessUpdate | Self::FailUpdate => Operation::Update,
            Self::PendingDelete | Self::SuccessDelete | Self::FailDelete => Operation::Delete,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingCreate | Self::PendingUpdate | Self::PendingDelete
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::FailCreate | Self::FailUpdate | Self::FailDelete)
    }

    /// The operation a worker still owes for this status, if any.
    pub fn pending_operation(&self) -> Option<Operation> {
        self.is_pending().then(|| self.operation())
    }

    pub fn is_deleting(&self) -> bool {
        matches!(self, Self::PendingDelete | Self::FailDelete)
    }
}

impl Display for CommitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

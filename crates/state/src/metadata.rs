use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonic per-resource version, bumped by the store on every mutation.
///
/// Version `0` means "never stored".
pub type Version = u64;

/// Identifies a collection of resources: a namespace and a type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Kind {
    /// Namespace of the collection.
    pub namespace: String,
    /// Type of the collection.
    pub type_: String,
}

impl Kind {
    /// Create a new kind.
    pub fn new(namespace: impl Into<String>, type_: impl Into<String>) -> Self {
        Kind {
            namespace: namespace.into(),
            type_: type_.into(),
        }
    }

    /// Points at resource `id` of this kind.
    pub fn pointer(&self, id: impl Into<String>) -> Pointer {
        Pointer {
            namespace: self.namespace.clone(),
            type_: self.type_.clone(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.type_)
    }
}

/// Globally unique address of a resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pointer {
    /// Namespace of the resource.
    pub namespace: String,
    /// Type of the resource.
    pub type_: String,
    /// ID of the resource, unique within namespace and type.
    pub id: String,
}

impl Pointer {
    /// The kind this pointer belongs to.
    pub fn kind(&self) -> Kind {
        Kind::new(self.namespace.clone(), self.type_.clone())
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.type_, self.id)
    }
}

/// Lifecycle phase of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Normal state.
    Running,
    /// Destruction was requested but finalizers are still attached.
    TearingDown,
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Running
    }
}

/// Resource envelope shared by every resource type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pointer: Pointer,
    version: Version,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    owner: String,
    phase: Phase,
    finalizers: Vec<String>,
}

impl Metadata {
    /// Metadata for a resource which hasn't been stored yet.
    pub fn new(pointer: Pointer, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Metadata {
            pointer,
            version: 0,
            created: now,
            updated: now,
            owner: owner.into(),
            phase: Phase::Running,
            finalizers: Vec::new(),
        }
    }

    /// Address of the resource.
    pub fn pointer(&self) -> &Pointer {
        &self.pointer
    }

    /// Namespace of the resource.
    pub fn namespace(&self) -> &str {
        &self.pointer.namespace
    }

    /// Type of the resource.
    pub fn type_(&self) -> &str {
        &self.pointer.type_
    }

    /// ID of the resource.
    pub fn id(&self) -> &str {
        &self.pointer.id
    }

    /// Current version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// When the resource was first stored.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// When the resource was last mutated.
    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    /// Owner of the resource. Only the owner may update or destroy it.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Attached finalizers, in insertion order.
    pub fn finalizers(&self) -> &[String] {
        &self.finalizers
    }

    /// Whether `finalizer` is attached.
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub(crate) fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    pub(crate) fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Stamps a committed mutation. Only the store calls this.
    pub(crate) fn commit(&mut self, version: Version) {
        let now = Utc::now();
        if version == 1 {
            self.created = now;
        }
        self.version = version;
        self.updated = now;
    }

    /// Carries store-managed fields over from the committed copy, so callers
    /// can't forge them through an update.
    pub(crate) fn inherit(&mut self, committed: &Metadata) {
        self.created = committed.created;
        self.phase = committed.phase;
        self.finalizers = committed.finalizers.clone();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finalizers_are_an_ordered_set() {
        let mut md = Metadata::new(Kind::new("ns", "Type").pointer("id"), "owner");
        assert!(md.add_finalizer("b"));
        assert!(md.add_finalizer("a"));
        assert!(!md.add_finalizer("b"));
        assert_eq!(md.finalizers(), &["b".to_string(), "a".to_string()]);
        assert!(md.remove_finalizer("b"));
        assert!(!md.remove_finalizer("b"));
        assert_eq!(md.finalizers(), &["a".to_string()]);
    }

    #[test]
    fn pointer_display() {
        let pointer = Kind::new("controlplane", "Manifests").pointer("00-rbac");
        assert_eq!(pointer.to_string(), "controlplane/Manifests/00-rbac");
        assert_eq!(pointer.kind(), Kind::new("controlplane", "Manifests"));
    }
}

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::metadata::{Kind, Metadata, Pointer};

/// A resource type which can be kept in the [`State`](crate::State).
///
/// The namespace and type name are fixed per spec type.
pub trait Spec: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Namespace resources of this type live in.
    const NAMESPACE: &'static str;
    /// Type name of the resource.
    const TYPE: &'static str;

    /// The kind of this resource type.
    fn kind() -> Kind {
        Kind::new(Self::NAMESPACE, Self::TYPE)
    }

    /// Points at resource `id` of this type.
    fn pointer(id: &str) -> Pointer {
        Self::kind().pointer(id)
    }
}

/// A typed resource: metadata and spec.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource<S> {
    metadata: Metadata,
    spec: S,
}

impl<S: Spec> Resource<S> {
    /// Create a new resource which isn't stored yet.
    pub fn new(id: impl Into<String>, owner: impl Into<String>, spec: S) -> Self {
        Resource {
            metadata: Metadata::new(S::kind().pointer(id), owner),
            spec,
        }
    }

    /// Resource metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Shortcut to the resource ID.
    pub fn id(&self) -> &str {
        self.metadata.id()
    }

    /// Resource spec.
    pub fn spec(&self) -> &S {
        &self.spec
    }

    /// Mutable resource spec.
    pub fn spec_mut(&mut self) -> &mut S {
        &mut self.spec
    }

    /// Consume the resource and return its spec.
    pub fn into_spec(self) -> S {
        self.spec
    }

    pub(crate) fn into_raw(self) -> Result<RawResource> {
        let spec = serde_json::to_value(&self.spec).map_err(|e| Error::Serialization {
            pointer: self.metadata.pointer().clone(),
            message: e.to_string(),
        })?;
        Ok(RawResource {
            metadata: self.metadata,
            spec,
        })
    }

    pub(crate) fn from_raw(raw: RawResource) -> Result<Self> {
        let spec = serde_json::from_value(raw.spec).map_err(|e| Error::Serialization {
            pointer: raw.metadata.pointer().clone(),
            message: e.to_string(),
        })?;
        Ok(Resource {
            metadata: raw.metadata,
            spec,
        })
    }
}

/// Type-erased form of a resource, as kept inside the store.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RawResource {
    pub(crate) metadata: Metadata,
    pub(crate) spec: serde_json::Value,
}

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::metadata::{Kind, Metadata, Phase, Pointer, Version};
use crate::resource::{RawResource, Resource, Spec};
use crate::watch::{typed_stream, EventType, RawEvent, WatchStream};

const DEFAULT_WATCH_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    resources: BTreeMap<Kind, BTreeMap<String, RawResource>>,
    channels: HashMap<Kind, broadcast::Sender<RawEvent>>,
}

impl Inner {
    fn get(&self, pointer: &Pointer) -> Option<&RawResource> {
        self.resources
            .get(&pointer.kind())
            .and_then(|resources| resources.get(&pointer.id))
    }

    fn get_mut(&mut self, pointer: &Pointer) -> Result<&mut RawResource> {
        self.resources
            .get_mut(&pointer.kind())
            .and_then(|resources| resources.get_mut(&pointer.id))
            .ok_or_else(|| Error::NotFound(pointer.clone()))
    }

    /// Publish under the write lock, so that events leave in commit order.
    fn publish(&self, type_: EventType, resource: &RawResource) {
        if let Some(sender) = self.channels.get(&resource.metadata.pointer().kind()) {
            // Sending only fails when nobody is subscribed.
            let _ = sender.send(RawEvent {
                type_,
                resource: resource.clone(),
            });
        }
    }
}

fn check_owner(metadata: &Metadata, owner: &str) -> Result<()> {
    if metadata.owner() != owner {
        return Err(Error::OwnerConflict {
            pointer: metadata.pointer().clone(),
            owner: metadata.owner().to_string(),
            requested: owner.to_string(),
        });
    }
    Ok(())
}

/// The resource store.
///
/// `State` is cheap to clone; clones share the same resources.
#[derive(Clone)]
pub struct State {
    inner: Arc<RwLock<Inner>>,
    watch_capacity: usize,
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

impl State {
    /// Create an empty store.
    pub fn new() -> Self {
        State::with_watch_capacity(DEFAULT_WATCH_CAPACITY)
    }

    /// Create an empty store whose watches buffer at most `capacity` events
    /// per subscriber before overflowing.
    pub fn with_watch_capacity(capacity: usize) -> Self {
        State {
            inner: Arc::new(RwLock::new(Inner::default())),
            watch_capacity: capacity.max(1),
        }
    }

    /// Fetch a resource by ID.
    pub async fn get<S: Spec>(&self, id: &str) -> Result<Resource<S>> {
        let pointer = S::pointer(id);
        let raw = {
            let inner = self.inner.read().await;
            inner
                .get(&pointer)
                .cloned()
                .ok_or(Error::NotFound(pointer))?
        };
        Resource::from_raw(raw)
    }

    /// List all resources of a type, sorted by ID.
    pub async fn list<S: Spec>(&self) -> Result<Vec<Resource<S>>> {
        let raws: Vec<RawResource> = {
            let inner = self.inner.read().await;
            inner
                .resources
                .get(&S::kind())
                .map(|resources| resources.values().cloned().collect())
                .unwrap_or_default()
        };
        raws.into_iter().map(Resource::from_raw).collect()
    }

    /// Store a new resource. Its owner is taken from the resource metadata.
    pub async fn create<S: Spec>(&self, resource: Resource<S>) -> Result<Resource<S>> {
        let mut raw = resource.into_raw()?;
        let pointer = raw.metadata.pointer().clone();
        {
            let mut inner = self.inner.write().await;
            if inner.get(&pointer).is_some() {
                return Err(Error::AlreadyExists(pointer));
            }
            raw.metadata.set_phase(Phase::Running);
            raw.metadata.commit(1);
            inner
                .resources
                .entry(pointer.kind())
                .or_default()
                .insert(pointer.id.clone(), raw.clone());
            inner.publish(EventType::Created, &raw);
        }
        trace!(%pointer, "Created resource");
        Resource::from_raw(raw)
    }

    /// Replace the spec of a resource, provided nobody committed since
    /// `expected` was read.
    ///
    /// Phase and finalizers are kept from the committed copy.
    pub async fn update<S: Spec>(
        &self,
        expected: Version,
        resource: Resource<S>,
    ) -> Result<Resource<S>> {
        let mut raw = resource.into_raw()?;
        let pointer = raw.metadata.pointer().clone();
        {
            let mut inner = self.inner.write().await;
            let current = inner.get_mut(&pointer)?;
            if current.metadata.version() != expected {
                return Err(Error::ConflictVersion {
                    pointer,
                    expected,
                    found: current.metadata.version(),
                });
            }
            check_owner(&current.metadata, raw.metadata.owner())?;
            raw.metadata.inherit(&current.metadata);
            raw.metadata.commit(expected + 1);
            *current = raw.clone();
            inner.publish(EventType::Updated, &raw);
        }
        trace!(%pointer, "Updated resource");
        Resource::from_raw(raw)
    }

    /// Destroy a resource.
    ///
    /// If finalizers are attached the resource moves to
    /// [`Phase::TearingDown`] instead and [`Error::HasFinalizers`] is
    /// returned. `expected`, when set, guards against stale callers.
    pub async fn destroy<S: Spec>(
        &self,
        id: &str,
        owner: &str,
        expected: Option<Version>,
    ) -> Result<()> {
        let pointer = S::pointer(id);
        let mut inner = self.inner.write().await;
        let current = inner.get_mut(&pointer)?;
        if let Some(expected) = expected {
            if current.metadata.version() != expected {
                return Err(Error::ConflictVersion {
                    pointer,
                    expected,
                    found: current.metadata.version(),
                });
            }
        }
        check_owner(&current.metadata, owner)?;

        if !current.metadata.finalizers().is_empty() {
            if current.metadata.phase() == Phase::Running {
                current.metadata.set_phase(Phase::TearingDown);
                let version = current.metadata.version() + 1;
                current.metadata.commit(version);
                let snapshot = current.clone();
                inner.publish(EventType::Updated, &snapshot);
            }
            return Err(Error::HasFinalizers(pointer));
        }

        let removed = inner
            .resources
            .get_mut(&pointer.kind())
            .and_then(|resources| resources.remove(&pointer.id))
            .ok_or_else(|| Error::NotFound(pointer.clone()))?;
        inner.publish(EventType::Destroyed, &removed);
        debug!(%pointer, "Destroyed resource");
        Ok(())
    }

    /// Move a resource to [`Phase::TearingDown`].
    ///
    /// Returns true when no finalizers are left, meaning the resource can be
    /// destroyed right away.
    pub async fn teardown<S: Spec>(&self, id: &str, owner: &str) -> Result<bool> {
        let pointer = S::pointer(id);
        let mut inner = self.inner.write().await;
        let current = inner.get_mut(&pointer)?;
        check_owner(&current.metadata, owner)?;
        let ready = current.metadata.finalizers().is_empty();
        if current.metadata.phase() == Phase::Running {
            current.metadata.set_phase(Phase::TearingDown);
            let version = current.metadata.version() + 1;
            current.metadata.commit(version);
            let snapshot = current.clone();
            inner.publish(EventType::Updated, &snapshot);
        }
        Ok(ready)
    }

    /// Tear a resource down, wait for its finalizers to be released and
    /// destroy it.
    ///
    /// A resource which is already gone is not an error.
    pub async fn teardown_and_destroy<S: Spec>(&self, id: &str, owner: &str) -> Result<()> {
        let mut watch = self.watch::<S>(Some(id)).await;
        let mut ready = match self.teardown::<S>(id, owner).await {
            Ok(ready) => ready,
            Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        loop {
            if ready {
                match self.destroy::<S>(id, owner, None).await {
                    Ok(()) | Err(Error::NotFound(_)) => return Ok(()),
                    // A finalizer was attached in between, keep waiting.
                    Err(Error::HasFinalizers(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            ready = match watch.next().await {
                Some(Ok(event)) if event.type_ == EventType::Destroyed => return Ok(()),
                Some(Ok(event)) => event.resource.metadata().finalizers().is_empty(),
                Some(Err(Error::Overflow(_))) => {
                    watch = self.watch::<S>(Some(id)).await;
                    false
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            };
        }
    }

    /// Attach a finalizer. Attaching an existing finalizer is a no-op.
    ///
    /// Any controller may attach finalizers, not only the owner.
    pub async fn add_finalizer<S: Spec>(&self, id: &str, finalizer: &str) -> Result<()> {
        self.mutate_finalizers::<S, _>(id, |metadata| metadata.add_finalizer(finalizer))
            .await
    }

    /// Release a finalizer. Releasing a missing finalizer is a no-op.
    pub async fn remove_finalizer<S: Spec>(&self, id: &str, finalizer: &str) -> Result<()> {
        self.mutate_finalizers::<S, _>(id, |metadata| metadata.remove_finalizer(finalizer))
            .await
    }

    async fn mutate_finalizers<S: Spec, F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Metadata) -> bool,
    {
        let pointer = S::pointer(id);
        let mut inner = self.inner.write().await;
        let current = inner.get_mut(&pointer)?;
        if f(&mut current.metadata) {
            let version = current.metadata.version() + 1;
            current.metadata.commit(version);
            let snapshot = current.clone();
            inner.publish(EventType::Updated, &snapshot);
        }
        Ok(())
    }

    /// Create or update resource `id` by applying `f` to its spec.
    ///
    /// Missing resources start from `S::default()`. Conflicting concurrent
    /// writes are retried against the fresh copy. When `f` leaves the spec
    /// unchanged nothing is written and the version doesn't move.
    pub async fn modify<S, F>(&self, id: &str, owner: &str, mut f: F) -> Result<Resource<S>>
    where
        S: Spec + Default,
        F: FnMut(&mut S),
    {
        loop {
            match self.get::<S>(id).await {
                Ok(current) => {
                    check_owner(current.metadata(), owner)?;
                    let mut spec = current.spec().clone();
                    f(&mut spec);
                    if &spec == current.spec() {
                        return Ok(current);
                    }
                    let version = current.metadata().version();
                    let mut updated = current;
                    *updated.spec_mut() = spec;
                    match self.update(version, updated).await {
                        Err(Error::ConflictVersion { .. }) | Err(Error::NotFound(_)) => continue,
                        result => return result,
                    }
                }
                Err(Error::NotFound(_)) => {
                    let mut spec = S::default();
                    f(&mut spec);
                    match self.create(Resource::new(id, owner, spec)).await {
                        Err(Error::AlreadyExists(_)) => continue,
                        result => return result,
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Watch resources of type `S`, optionally restricted to a single ID.
    ///
    /// The stream starts with a `Created` event for every existing resource,
    /// followed by live events in commit order.
    pub async fn watch<S: Spec>(&self, id: Option<&str>) -> WatchStream<S> {
        let kind = S::kind();
        let capacity = self.watch_capacity;
        let (snapshot, receiver) = {
            let mut inner = self.inner.write().await;
            let receiver = inner
                .channels
                .entry(kind.clone())
                .or_insert_with(|| broadcast::channel(capacity).0)
                .subscribe();
            let snapshot: Vec<RawResource> = inner
                .resources
                .get(&kind)
                .map(|resources| {
                    resources
                        .values()
                        .filter(|raw| id.map(|id| raw.metadata.id() == id).unwrap_or(true))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (snapshot, receiver)
        };
        typed_stream::<S>(snapshot, receiver, id.map(str::to_string))
    }
}

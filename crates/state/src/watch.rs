use futures::stream::BoxStream;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tracing::warn;

use crate::error::{Error, Result};
use crate::resource::{RawResource, Resource, Spec};

/// What happened to a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// The resource was created, or existed when the watch started.
    Created,
    /// The resource was mutated (spec, phase or finalizers).
    Updated,
    /// The resource was destroyed. The event carries its last state.
    Destroyed,
}

/// A single watch event.
#[derive(Clone, Debug, PartialEq)]
pub struct Event<S> {
    /// Kind of change.
    pub type_: EventType,
    /// Resource state after the change.
    pub resource: Resource<S>,
}

/// Stream of watch events. Ends after yielding [`Error::Overflow`].
pub type WatchStream<S> = BoxStream<'static, Result<Event<S>>>;

#[derive(Clone, Debug)]
pub(crate) struct RawEvent {
    pub(crate) type_: EventType,
    pub(crate) resource: RawResource,
}

pub(crate) fn typed_stream<S: Spec>(
    snapshot: Vec<RawResource>,
    mut receiver: Receiver<RawEvent>,
    id: Option<String>,
) -> WatchStream<S> {
    let stream = async_stream::stream! {
        for raw in snapshot {
            yield Resource::<S>::from_raw(raw).map(|resource| Event {
                type_: EventType::Created,
                resource,
            });
        }

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Some(id) = &id {
                        if event.resource.metadata.id() != id {
                            continue;
                        }
                    }
                    yield Resource::<S>::from_raw(event.resource).map(|resource| Event {
                        type_: event.type_,
                        resource,
                    });
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(kind = %S::kind(), missed, "Watch subscriber overflowed");
                    yield Err(Error::Overflow(missed));
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Box::pin(stream)
}

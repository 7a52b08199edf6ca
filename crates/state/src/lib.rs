//! A process-local resource store for node controllers.
//!
//! Every controller running on a node talks to its peers only through a
//! [`State`]: a typed, versioned key-value store keyed by
//! `(namespace, type, id)` that can be watched for changes.
//!
//! * Specs are stored as JSON values, so any [`Spec`] that serializes can be
//!   kept in the store without the store knowing its schema.
//! * Every accepted mutation bumps the resource [`Version`].
//! * Resources carrying finalizers can't be destroyed; they move to
//!   [`Phase::TearingDown`] until the finalizers are released.
//! * Watches deliver a snapshot of existing resources followed by live events,
//!   in commit order. A subscriber that falls behind receives
//!   [`Error::Overflow`] and the watch ends.
//!
//! ```
//! # use kubenode_state::{Resource, Spec, State};
//! # use serde::{Deserialize, Serialize};
//! #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
//! struct Greeting {
//!     text: String,
//! }
//!
//! impl Spec for Greeting {
//!     const NAMESPACE: &'static str = "example";
//!     const TYPE: &'static str = "Greetings";
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let state = State::new();
//!
//! let greeting = Resource::new("hello", "me", Greeting { text: "hi".into() });
//! state.create(greeting).await?;
//!
//! let stored = state.get::<Greeting>("hello").await?;
//! assert_eq!(stored.metadata().version(), 1);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

mod error;
mod metadata;
mod resource;
mod store;
mod watch;

pub use error::{Error, Result};
pub use metadata::{Kind, Metadata, Phase, Pointer, Version};
pub use resource::{Resource, Spec};
pub use store::State;
pub use watch::{Event, EventType, WatchStream};

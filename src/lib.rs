//! # Fact Store
//!
//! A durable, totally ordered log of immutable facts with subscriptions
//! and aggregate-scoped optimistic locking.
//!
//! ## Core Concepts
//!
//! - **Facts**: Immutable header plus opaque payload, numbered by a serial
//! - **Specs**: Filters over namespace, type, meta, aggregate and payload
//! - **Subscriptions**: Catchup replays, follow keeps streaming new commits
//! - **State tokens**: Conditional publish that fails if matching facts appeared
//! - **Locks**: Retry loop over state tokens, scoped to aggregates
//!
//! ## Example
//!
//! ```ignore
//! use factstore::{FactInput, FactSpec, FactStore, StoreConfig, SubscriptionRequest};
//!
//! let store = FactStore::open_or_create(StoreConfig {
//!     path: "./my-facts".into(),
//!     ..Default::default()
//! })?;
//!
//! store.publish_one(FactInput::json("users", &json!({"name": "Ada"}))?.with_type("created"))?;
//!
//! let sub = store.subscribe(
//!     SubscriptionRequest::follow(FactSpec::ns("users")).from_scratch(),
//!     |fact: Fact| println!("{}", fact.serial),
//! )?;
//! ```

pub mod attempt;
pub mod error;
pub mod lock;
pub mod log;
pub mod notify;
pub mod snapshots;
pub mod spec;
pub mod store;
pub mod subscriptions;
pub mod tokens;
pub mod transform;
pub mod types;

// Re-exports
pub use attempt::{
    Attempt, AttemptAborted, BoxError, LockError, LockedOperationBuilder, OptimisticLock,
    PublishIntent, WithAggregates,
};
pub use error::{Result, StoreError};
pub use lock::{ExclusiveWriteLock, WriteGuard, WriteLock};
pub use log::{FactIndex, FactLog};
pub use notify::{Notification, NotificationBus, Notifications};
pub use snapshots::SnapshotCache;
pub use spec::{FactPredicate, FactSpec, PredicateError};
pub use store::{Collaborators, FactStore, StoreConfig};
pub use subscriptions::{
    CatchupStrategy, EngineConfig, FactObserver, IdObserver, StartPoint, Subscription,
    SubscriptionId, SubscriptionMode, SubscriptionRequest, SubscriptionState,
};
pub use tokens::{State, StateToken};
pub use transform::{FactTransformer, NoTransformation, TransformationError};
pub use types::*;

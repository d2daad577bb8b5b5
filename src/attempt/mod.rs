//! Aggregate-scoped locked publishing.
//!
//! ```ignore
//! let id = store
//!     .lock("orders")?
//!     .on([order_id])?
//!     .optimistic()
//!     .retry(5)?
//!     .attempt(|| {
//!         let order = load(order_id)?;
//!         if order.shipped {
//!             return Ok(Attempt::abort("already shipped"));
//!         }
//!         Ok(Attempt::publish(ship(order_id)))
//!     })?;
//! ```

mod result;
mod runner;

pub use result::{Attempt, AttemptAborted, BoxError, LockError, PublishIntent};
pub use runner::{LockedOperationBuilder, OptimisticLock, WithAggregates};

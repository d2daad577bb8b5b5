//! Catchup and follow subscriptions over the fact log.
//!
//! A subscription replays the committed facts matching its specs in
//! serial order, signals `on_catchup`, and then either completes or keeps
//! following new commits. Following is driven by best-effort commit
//! signals plus a watchdog re-scan, so a lost signal only adds latency.
//!
//! # Example
//!
//! ```ignore
//! let request = SubscriptionRequest::follow(FactSpec::ns("orders").with_type("placed"))
//!     .from_scratch();
//!
//! let sub = store.subscribe(request, |fact: Fact| {
//!     println!("{} {}", fact.serial, fact.id());
//! })?;
//!
//! sub.await_catchup(Duration::from_secs(5))?;
//! ```

mod catchup;
mod engine;
mod subscription;
mod types;

pub use engine::{EngineConfig, SubscriptionEngine};
pub use subscription::Subscription;
pub use types::{
    CatchupStrategy, FactObserver, IdObserver, RequestBuilder, StartPoint, SubscriptionId,
    SubscriptionMode, SubscriptionRequest, SubscriptionState,
};

pub(crate) use types::IdsOnly;

//! Subscription requests and observer callbacks.

use crate::error::StoreError;
use crate::spec::FactSpec;
use crate::types::Fact;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Whether a subscription ends after the replay or keeps streaming.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Replay the committed facts, then complete.
    Catchup,
    /// Replay, then deliver new facts as they are committed. Never completes.
    Follow,
}

impl SubscriptionMode {
    pub fn is_follow(self) -> bool {
        self == SubscriptionMode::Follow
    }
}

/// Where a subscription's replay begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartPoint {
    FromScratch,
    /// Start after the fact with this id.
    After(Uuid),
    /// Skip everything committed so far.
    FromNowOn,
}

/// How catchup reads the committed range. Both deliver the same facts in
/// the same order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CatchupStrategy {
    /// Bounded pages, advancing a serial cursor.
    #[default]
    Paged,
    /// One pass over the whole range.
    Fetching,
}

/// Everything the engine needs to run a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionRequest {
    /// Facts matching any of these are delivered.
    pub specs: Vec<FactSpec>,
    pub mode: SubscriptionMode,
    pub start: StartPoint,
    pub skip_marks: bool,

    /// Upper bound between re-scans while following. Falls back to the
    /// engine's watchdog interval.
    pub max_latency: Option<Duration>,
}

impl SubscriptionRequest {
    pub fn catchup(spec: FactSpec) -> RequestBuilder {
        RequestBuilder::new(SubscriptionMode::Catchup, spec)
    }

    pub fn follow(spec: FactSpec) -> RequestBuilder {
        RequestBuilder::new(SubscriptionMode::Follow, spec)
    }

    pub fn follow_with_latency(max_latency: Duration, spec: FactSpec) -> RequestBuilder {
        let mut builder = Self::follow(spec);
        builder.max_latency = Some(max_latency);
        builder
    }
}

/// Fluent construction of a [`SubscriptionRequest`]. Finished by choosing
/// a start point.
#[derive(Clone, Debug)]
pub struct RequestBuilder {
    specs: Vec<FactSpec>,
    mode: SubscriptionMode,
    skip_marks: bool,
    max_latency: Option<Duration>,
}

impl RequestBuilder {
    fn new(mode: SubscriptionMode, spec: FactSpec) -> Self {
        Self {
            specs: vec![spec],
            mode,
            skip_marks: false,
            max_latency: None,
        }
    }

    /// Also deliver facts matching `spec`.
    pub fn or(mut self, spec: FactSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn skip_marks(mut self) -> Self {
        self.skip_marks = true;
        self
    }

    pub fn from_scratch(self) -> SubscriptionRequest {
        self.build(StartPoint::FromScratch)
    }

    pub fn from(self, id: Uuid) -> SubscriptionRequest {
        self.build(StartPoint::After(id))
    }

    pub fn from_now_on(self) -> SubscriptionRequest {
        self.build(StartPoint::FromNowOn)
    }

    fn build(self, start: StartPoint) -> SubscriptionRequest {
        SubscriptionRequest {
            specs: self.specs,
            mode: self.mode,
            start,
            skip_marks: self.skip_marks,
            max_latency: self.max_latency,
        }
    }
}

/// Receives the facts of a subscription.
///
/// Calls for one subscription never overlap and arrive in serial order.
/// `on_complete` and `on_error` are terminal.
pub trait FactObserver: Send + 'static {
    fn on_next(&mut self, fact: Fact);

    /// Every fact committed before the subscription started has been seen.
    fn on_catchup(&mut self) {}

    fn on_complete(&mut self) {}

    fn on_error(&mut self, error: &StoreError) {
        warn!(error = %error, "subscription failed");
    }
}

impl<F> FactObserver for F
where
    F: FnMut(Fact) + Send + 'static,
{
    fn on_next(&mut self, fact: Fact) {
        self(fact)
    }
}

/// Like [`FactObserver`] but receives only fact ids.
pub trait IdObserver: Send + 'static {
    fn on_next(&mut self, id: Uuid);

    fn on_catchup(&mut self) {}

    fn on_complete(&mut self) {}

    fn on_error(&mut self, error: &StoreError) {
        warn!(error = %error, "id subscription failed");
    }
}

impl<F> IdObserver for F
where
    F: FnMut(Uuid) + Send + 'static,
{
    fn on_next(&mut self, id: Uuid) {
        self(id)
    }
}

/// Runs an [`IdObserver`] on a fact stream.
pub(crate) struct IdsOnly<O>(pub O);

impl<O: IdObserver> FactObserver for IdsOnly<O> {
    fn on_next(&mut self, fact: Fact) {
        self.0.on_next(fact.id())
    }

    fn on_catchup(&mut self) {
        self.0.on_catchup()
    }

    fn on_complete(&mut self) {
        self.0.on_complete()
    }

    fn on_error(&mut self, error: &StoreError) {
        self.0.on_error(error)
    }
}

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Init,
    Catchup,
    Following,
    Complete,
    Closed,
    Failed,
}

impl SubscriptionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Closed | Self::Failed)
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

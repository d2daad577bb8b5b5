//! The lock builder chain and the bounded retry loop.

use crate::error::StoreError;
use crate::spec::FactSpec;
use crate::store::FactStore;
use tracing::{debug, warn};
use uuid::Uuid;

use super::result::{Attempt, BoxError, LockError, PublishIntent};

/// Start of a locked operation, scoped to one namespace.
pub struct LockedOperationBuilder<'a> {
    store: &'a FactStore,
    ns: String,
}

impl<'a> LockedOperationBuilder<'a> {
    pub(crate) fn new(store: &'a FactStore, ns: impl Into<String>) -> Result<Self, LockError> {
        let ns = ns.into();
        if ns.is_empty() {
            return Err(LockError::InvalidNamespace);
        }
        Ok(Self { store, ns })
    }

    /// Lock the given aggregates. At least one id is required.
    pub fn on(self, agg_ids: impl IntoIterator<Item = Uuid>) -> Result<WithAggregates<'a>, LockError> {
        let agg_ids: Vec<Uuid> = agg_ids.into_iter().collect();
        if agg_ids.is_empty() {
            return Err(LockError::NoAggregates);
        }
        Ok(WithAggregates {
            store: self.store,
            ns: self.ns,
            agg_ids,
        })
    }
}

/// A namespace plus the aggregates whose facts guard the publish.
pub struct WithAggregates<'a> {
    store: &'a FactStore,
    ns: String,
    agg_ids: Vec<Uuid>,
}

impl<'a> WithAggregates<'a> {
    /// Publish only if no fact for these aggregates was committed while
    /// the body ran.
    pub fn optimistic(self) -> OptimisticLock<'a> {
        OptimisticLock {
            store: self.store,
            specs: specs_for(&self.ns, &self.agg_ids),
            retries: OptimisticLock::DEFAULT_RETRIES,
        }
    }

    /// Run `body` once and publish its facts unconditionally.
    ///
    /// Returns the id of the last published fact.
    pub fn attempt<F>(self, body: F) -> Result<Uuid, LockError>
    where
        F: FnOnce() -> Result<Attempt, BoxError>,
    {
        let intent = match body().map_err(LockError::from_body)? {
            Attempt::Publish(intent) => intent,
            Attempt::Abort(aborted) => return Err(LockError::Aborted(aborted)),
        };
        let last_fact_id = last_id(&intent)?;

        self.store.publish(intent.facts)?;
        run_hook(intent.and_then, last_fact_id)?;
        Ok(last_fact_id)
    }
}

/// Optimistic locked publish with a bounded number of attempts.
pub struct OptimisticLock<'a> {
    store: &'a FactStore,
    specs: Vec<FactSpec>,
    retries: u32,
}

impl<'a> OptimisticLock<'a> {
    pub const DEFAULT_RETRIES: u32 = 10;

    /// Maximum number of attempts, at least 1.
    pub fn retry(mut self, attempts: u32) -> Result<Self, LockError> {
        if attempts == 0 {
            return Err(LockError::InvalidRetries);
        }
        self.retries = attempts;
        Ok(self)
    }

    /// Run `body` and publish its facts if the locked aggregates did not
    /// change meanwhile. On conflict the body runs again.
    ///
    /// The body runs outside the write lock and may publish unrelated
    /// facts itself. Returns the id of the last published fact.
    pub fn attempt<F>(self, mut body: F) -> Result<Uuid, LockError>
    where
        F: FnMut() -> Result<Attempt, BoxError>,
    {
        for attempt in 1..=self.retries {
            let token = self.store.state_token(&self.specs)?;

            let intent = match body() {
                Ok(Attempt::Publish(intent)) => intent,
                Ok(Attempt::Abort(aborted)) => {
                    self.store.invalidate_state_token(token);
                    return Err(LockError::Aborted(aborted));
                }
                Err(e) => {
                    self.store.invalidate_state_token(token);
                    return Err(LockError::from_body(e));
                }
            };
            let last_fact_id = last_id(&intent)?;

            if self.store.publish_if_unchanged(intent.facts, Some(token))? {
                run_hook(intent.and_then, last_fact_id)?;
                return Ok(last_fact_id);
            }

            debug!(attempt, of = self.retries, "optimistic conflict, retrying");
        }

        warn!(attempts = self.retries, "optimistic lock retries exhausted");
        Err(LockError::RetriesExceeded {
            attempts: self.retries,
        })
    }
}

fn specs_for(ns: &str, agg_ids: &[Uuid]) -> Vec<FactSpec> {
    agg_ids
        .iter()
        .map(|id| FactSpec::ns(ns).with_agg_id(*id))
        .collect()
}

fn last_id(intent: &PublishIntent) -> Result<Uuid, LockError> {
    match intent.facts.last() {
        Some(fact) => Ok(fact.id()),
        None => Err(LockError::Store(StoreError::Validation(
            "attempt published no facts".into(),
        ))),
    }
}

fn run_hook(
    hook: Option<Box<dyn FnOnce() -> Result<(), BoxError>>>,
    last_fact_id: Uuid,
) -> Result<(), LockError> {
    if let Some(hook) = hook {
        hook().map_err(|source| {
            warn!(%last_fact_id, error = %source, "post-publish hook failed");
            LockError::AfterPublish {
                last_fact_id,
                source,
            }
        })?;
    }
    Ok(())
}

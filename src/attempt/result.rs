//! Attempt outcomes and errors.

use crate::error::StoreError;
use crate::types::FactInput;
use std::error::Error;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error type for attempt bodies and post-publish hooks.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

type Hook = Box<dyn FnOnce() -> Result<(), BoxError>>;

/// Facts to publish plus an optional hook run once they are committed.
pub struct PublishIntent {
    pub(crate) facts: Vec<FactInput>,
    pub(crate) and_then: Option<Hook>,
}

impl fmt::Debug for PublishIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishIntent")
            .field("facts", &self.facts.len())
            .field("and_then", &self.and_then.is_some())
            .finish()
    }
}

/// What an attempt body decided.
#[derive(Debug)]
pub enum Attempt {
    Publish(PublishIntent),
    Abort(AttemptAborted),
}

impl Attempt {
    pub fn publish(fact: FactInput) -> Self {
        Self::publish_all([fact])
    }

    pub fn publish_all(facts: impl IntoIterator<Item = FactInput>) -> Self {
        Attempt::Publish(PublishIntent {
            facts: facts.into_iter().collect(),
            and_then: None,
        })
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Attempt::Abort(AttemptAborted::new(reason))
    }

    pub fn abort_with(aborted: AttemptAborted) -> Self {
        Attempt::Abort(aborted)
    }

    /// Run `hook` after a successful publish. Ignored when aborting.
    pub fn and_then<F>(self, hook: F) -> Self
    where
        F: FnOnce() -> Result<(), BoxError> + 'static,
    {
        match self {
            Attempt::Publish(intent) => Attempt::Publish(PublishIntent {
                facts: intent.facts,
                and_then: Some(Box::new(hook)),
            }),
            abort => abort,
        }
    }
}

/// The body chose not to publish. Never retried.
///
/// Structured data travels in `detail` and can be recovered with
/// [`AttemptAborted::detail`].
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct AttemptAborted {
    reason: String,
    #[source]
    detail: Option<BoxError>,
}

impl AttemptAborted {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            detail: None,
        }
    }

    pub fn with_detail(reason: impl Into<String>, detail: impl Error + Send + Sync + 'static) -> Self {
        Self {
            reason: reason.into(),
            detail: Some(Box::new(detail)),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn detail<T: Error + 'static>(&self) -> Option<&T> {
        self.detail.as_ref()?.downcast_ref::<T>()
    }
}

/// Errors of locked publishing.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock namespace must not be empty")]
    InvalidNamespace,

    #[error("Lock needs at least one aggregate id")]
    NoAggregates,

    #[error("Retry count must be at least 1")]
    InvalidRetries,

    #[error(transparent)]
    Aborted(AttemptAborted),

    /// Every attempt lost against a concurrent publish.
    #[error("Optimistic lock failed after {attempts} attempts")]
    RetriesExceeded { attempts: u32 },

    /// The facts are committed but the post-publish hook failed.
    #[error("Facts published (last {last_fact_id}) but post-publish hook failed: {source}")]
    AfterPublish {
        last_fact_id: Uuid,
        #[source]
        source: BoxError,
    },

    /// The attempt body failed with something other than an abort.
    #[error("Attempt failed: {0}")]
    Body(#[source] BoxError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LockError {
    /// Classify an error returned by an attempt body. An
    /// [`AttemptAborted`] inside the box counts as an abort.
    pub(crate) fn from_body(error: BoxError) -> Self {
        match error.downcast::<AttemptAborted>() {
            Ok(aborted) => LockError::Aborted(*aborted),
            Err(other) => LockError::Body(other),
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, LockError::Aborted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("insufficient stock: {available}")]
    struct OutOfStock {
        available: u32,
    }

    #[test]
    fn test_and_then_ignored_on_abort() {
        let attempt = Attempt::abort("nope").and_then(|| Ok(()));
        match attempt {
            Attempt::Abort(aborted) => assert_eq!(aborted.reason(), "nope"),
            Attempt::Publish(_) => panic!("expected abort"),
        }
    }

    #[test]
    fn test_and_then_attached_to_publish() {
        let attempt = Attempt::publish(FactInput::new("ns", vec![])).and_then(|| Ok(()));
        match attempt {
            Attempt::Publish(intent) => {
                assert_eq!(intent.facts.len(), 1);
                assert!(intent.and_then.is_some());
            }
            Attempt::Abort(_) => panic!("expected publish"),
        }
    }

    #[test]
    fn test_abort_detail_downcast() {
        let aborted = AttemptAborted::with_detail("nah", OutOfStock { available: 42 });
        assert_eq!(aborted.to_string(), "nah");
        assert_eq!(aborted.detail::<OutOfStock>().unwrap().available, 42);
        assert!(aborted.detail::<std::io::Error>().is_none());
    }

    #[test]
    fn test_body_error_classification() {
        let boxed: BoxError = Box::new(AttemptAborted::new("stop"));
        let err = LockError::from_body(boxed);
        assert!(err.is_aborted());
        assert_eq!(err.to_string(), "stop");

        let boxed: BoxError = Box::new(OutOfStock { available: 0 });
        assert!(matches!(LockError::from_body(boxed), LockError::Body(_)));
    }
}

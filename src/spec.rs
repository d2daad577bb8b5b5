//! Fact specifications: which facts a reader is interested in.

use crate::error::panic_message;
use crate::types::FactHeader;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Failure while evaluating a filter predicate.
///
/// Only the subscription owning the predicate is terminated by this.
#[derive(Clone, Debug, Error)]
#[error("Filter predicate failed: {0}")]
pub struct PredicateError(pub String);

/// Arbitrary filter evaluated against a fact's header and payload.
pub trait FactPredicate: Send + Sync {
    fn matches(&self, header: &FactHeader, payload: &[u8]) -> Result<bool, PredicateError>;
}

impl<F> FactPredicate for F
where
    F: Fn(&FactHeader, &[u8]) -> Result<bool, PredicateError> + Send + Sync,
{
    fn matches(&self, header: &FactHeader, payload: &[u8]) -> Result<bool, PredicateError> {
        self(header, payload)
    }
}

/// Describes a set of facts. Every constraint that is set must hold.
#[derive(Clone)]
pub struct FactSpec {
    /// Required namespace.
    pub ns: String,

    pub fact_type: Option<String>,

    /// Meta attributes that must be present with exactly these values.
    pub meta: BTreeMap<String, String>,

    /// Aggregate id that must be among the fact's aggregate ids.
    pub agg_id: Option<Uuid>,

    pub predicate: Option<Arc<dyn FactPredicate>>,
}

impl FactSpec {
    pub fn ns(ns: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            fact_type: None,
            meta: BTreeMap::new(),
            agg_id: None,
            predicate: None,
        }
    }

    pub fn with_type(mut self, fact_type: impl Into<String>) -> Self {
        self.fact_type = Some(fact_type.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_agg_id(mut self, agg_id: Uuid) -> Self {
        self.agg_id = Some(agg_id);
        self
    }

    pub fn with_predicate(mut self, predicate: impl FactPredicate + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Checks every constraint that can be decided from the header alone.
    pub fn matches_header(&self, header: &FactHeader) -> bool {
        if header.ns != self.ns {
            return false;
        }

        if let Some(ref fact_type) = self.fact_type {
            if header.fact_type.as_ref() != Some(fact_type) {
                return false;
            }
        }

        if let Some(agg_id) = self.agg_id {
            if !header.agg_ids.contains(&agg_id) {
                return false;
            }
        }

        self.meta
            .iter()
            .all(|(key, value)| header.meta.get(key) == Some(value))
    }

    /// Full match, including the predicate.
    pub fn matches(&self, header: &FactHeader, payload: &[u8]) -> Result<bool, PredicateError> {
        if !self.matches_header(header) {
            return Ok(false);
        }

        match self.predicate {
            Some(ref predicate) => {
                panic::catch_unwind(AssertUnwindSafe(|| predicate.matches(header, payload)))
                    .unwrap_or_else(|panic| Err(PredicateError(panic_message("predicate", panic))))
            }
            None => Ok(true),
        }
    }

    pub fn has_predicate(&self) -> bool {
        self.predicate.is_some()
    }
}

impl fmt::Debug for FactSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactSpec")
            .field("ns", &self.ns)
            .field("fact_type", &self.fact_type)
            .field("meta", &self.meta)
            .field("agg_id", &self.agg_id)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// True if any spec's header constraints hold.
pub(crate) fn any_matches_header(specs: &[FactSpec], header: &FactHeader) -> bool {
    specs.iter().any(|spec| spec.matches_header(header))
}

/// True if any spec fully matches.
pub(crate) fn any_matches(
    specs: &[FactSpec],
    header: &FactHeader,
    payload: &[u8],
) -> Result<bool, PredicateError> {
    for spec in specs {
        if spec.matches(header, payload)? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FactInput;

    #[test]
    fn test_namespace_and_type() {
        let header = FactInput::new("default", vec![]).with_type("t1").header;

        assert!(FactSpec::ns("default").matches_header(&header));
        assert!(FactSpec::ns("default").with_type("t1").matches_header(&header));
        assert!(!FactSpec::ns("default").with_type("t2").matches_header(&header));
        assert!(!FactSpec::ns("other").matches_header(&header));
    }

    #[test]
    fn test_meta_equality() {
        let plain = FactInput::new("default", vec![]).header;
        let tagged = FactInput::new("default", vec![]).with_meta("foo", "bar").header;

        let spec = FactSpec::ns("default").with_meta("foo", "bar");
        assert!(!spec.matches_header(&plain));
        assert!(spec.matches_header(&tagged));
        assert!(!FactSpec::ns("default")
            .with_meta("foo", "baz")
            .matches_header(&tagged));
    }

    #[test]
    fn test_agg_id_membership() {
        let agg1 = Uuid::new_v4();
        let agg2 = Uuid::new_v4();
        let header = FactInput::new("default", vec![])
            .with_agg_id(agg1)
            .with_agg_id(agg2)
            .header;

        assert!(FactSpec::ns("default").with_agg_id(agg1).matches_header(&header));
        assert!(FactSpec::ns("default").with_agg_id(agg2).matches_header(&header));
        assert!(!FactSpec::ns("default")
            .with_agg_id(Uuid::new_v4())
            .matches_header(&header));
    }

    #[test]
    fn test_predicate_sees_payload() {
        let spec = FactSpec::ns("default").with_predicate(|_: &FactHeader, payload: &[u8]| {
            Ok(payload.starts_with(b"hit"))
        });
        let header = FactHeader::new("default");

        assert!(spec.matches(&header, b"hit me").unwrap());
        assert!(!spec.matches(&header, b"miss").unwrap());
        // header constraints short-circuit the predicate
        assert!(!spec.matches(&FactHeader::new("other"), b"hit").unwrap());
    }

    #[test]
    fn test_predicate_error_propagates() {
        let spec = FactSpec::ns("default").with_predicate(|_: &FactHeader, _: &[u8]| {
            Err(PredicateError("boom".into()))
        });
        let result = spec.matches(&FactHeader::new("default"), b"");
        assert!(result.is_err());
    }

    #[test]
    fn test_any_matches_ors_specs() {
        let header = FactInput::new("ns2", vec![]).header;
        let specs = vec![FactSpec::ns("ns1"), FactSpec::ns("ns2")];
        assert!(any_matches_header(&specs, &header));
        assert!(any_matches(&specs, &header, b"").unwrap());
        assert!(!any_matches_header(&specs[..1], &header));
    }
}

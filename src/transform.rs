//! Fact schema transformation.

use crate::types::Fact;
use thiserror::Error;
use uuid::Uuid;

/// A fact could not be brought to the requested version.
#[derive(Clone, Debug, Error)]
#[error("Cannot transform fact {fact_id} from version {from:?} to {to}: {reason}")]
pub struct TransformationError {
    pub fact_id: Uuid,
    pub from: Option<u32>,
    pub to: u32,
    pub reason: String,
}

/// Upcasts or downcasts a fact's payload to a requested schema version.
///
/// Only invoked for explicit version-targeted fetches.
pub trait FactTransformer: Send + Sync {
    fn transform_if_necessary(
        &self,
        fact: Fact,
        target_version: u32,
    ) -> Result<Fact, TransformationError>;
}

/// Passes facts through unchanged when no conversion is needed and fails
/// otherwise.
///
/// Target version `0` means "any version". Facts published without a
/// version are returned as they are.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTransformation;

impl FactTransformer for NoTransformation {
    fn transform_if_necessary(
        &self,
        fact: Fact,
        target_version: u32,
    ) -> Result<Fact, TransformationError> {
        match fact.header.version {
            None => Ok(fact),
            Some(_) if target_version == 0 => Ok(fact),
            Some(v) if v == target_version => Ok(fact),
            Some(v) => Err(TransformationError {
                fact_id: fact.id(),
                from: Some(v),
                to: target_version,
                reason: "no transformation available".into(),
            }),
        }
    }
}

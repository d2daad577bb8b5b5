//! Core types for the fact store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Namespace of synthetic mark facts.
pub const MARK_NS: &str = "_";

/// Type of synthetic mark facts.
pub const MARK_TYPE: &str = "_mark";

/// Meta key whose value must be unique across the whole log.
pub const UNIQUE_IDENTIFIER_KEY: &str = "unique_identifier";

/// Position of a fact in the log. Zero means "before the first fact".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Serial(pub u64);

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({})", self.0)
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serial {
    pub const ZERO: Serial = Serial(0);

    pub fn next(self) -> Self {
        Serial(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Serial(self.0 - 1))
        } else {
            None
        }
    }
}

/// Header of a fact: everything except the payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactHeader {
    /// Globally unique fact id.
    pub id: Uuid,

    /// Top-level grouping of the fact's type.
    pub ns: String,

    /// Application-defined type within the namespace.
    #[serde(rename = "type")]
    pub fact_type: Option<String>,

    /// Aggregates this fact belongs to.
    pub agg_ids: BTreeSet<Uuid>,

    /// Free-form string attributes.
    pub meta: BTreeMap<String, String>,

    /// Payload schema version, if the publisher declared one.
    pub version: Option<u32>,
}

impl FactHeader {
    pub fn new(ns: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ns: ns.into(),
            fact_type: None,
            agg_ids: BTreeSet::new(),
            meta: BTreeMap::new(),
            version: None,
        }
    }

    /// The store-wide unique identifier, if this fact carries one.
    pub fn unique_identifier(&self) -> Option<&str> {
        self.meta.get(UNIQUE_IDENTIFIER_KEY).map(String::as_str)
    }

    pub fn is_mark(&self) -> bool {
        self.ns == MARK_NS && self.fact_type.as_deref() == Some(MARK_TYPE)
    }
}

/// An immutable fact as stored in the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fact {
    /// Position in the log (assigned by the store).
    pub serial: Serial,

    pub header: FactHeader,

    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl Fact {
    pub fn id(&self) -> Uuid {
        self.header.id
    }

    pub fn ns(&self) -> &str {
        &self.header.ns
    }

    pub fn fact_type(&self) -> Option<&str> {
        self.header.fact_type.as_deref()
    }

    pub fn agg_ids(&self) -> &BTreeSet<Uuid> {
        &self.header.agg_ids
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.header.meta.get(key).map(String::as_str)
    }

    pub fn is_mark(&self) -> bool {
        self.header.is_mark()
    }

    /// True if this fact was appended before `other`.
    pub fn before(&self, other: &Fact) -> bool {
        self.serial < other.serial
    }

    /// Decode the payload as JSON.
    pub fn payload_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Header rendered as JSON, including the assigned serial.
    pub fn json_header(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct WithSerial<'a> {
            #[serde(flatten)]
            header: &'a FactHeader,
            serial: u64,
        }

        serde_json::to_string(&WithSerial {
            header: &self.header,
            serial: self.serial.0,
        })
    }
}

/// Input for publishing a fact (before a serial is assigned).
#[derive(Clone, Debug)]
pub struct FactInput {
    pub header: FactHeader,
    pub payload: Vec<u8>,
}

impl FactInput {
    /// New fact in `ns` with a random id and raw payload.
    pub fn new(ns: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            header: FactHeader::new(ns),
            payload,
        }
    }

    /// New fact in `ns` with a JSON payload.
    pub fn json(ns: impl Into<String>, payload: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self::new(ns, serde_json::to_vec(payload)?))
    }

    pub fn from_parts(header: FactHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// A synthetic mark fact.
    pub fn mark() -> Self {
        Self::new(MARK_NS, b"{}".to_vec()).with_type(MARK_TYPE)
    }

    pub fn id(&self) -> Uuid {
        self.header.id
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.header.id = id;
        self
    }

    pub fn with_type(mut self, fact_type: impl Into<String>) -> Self {
        self.header.fact_type = Some(fact_type.into());
        self
    }

    pub fn with_agg_id(mut self, agg_id: Uuid) -> Self {
        self.header.agg_ids.insert(agg_id);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_unique_identifier(self, ident: impl Into<String>) -> Self {
        self.with_meta(UNIQUE_IDENTIFIER_KEY, ident)
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.header.version = Some(version);
        self
    }
}

/// Key of a cached snapshot: an application key plus an optional
/// aggregate id (nil when the snapshot is not tied to one aggregate).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    pub key: String,
    pub uuid: Uuid,
}

impl SnapshotId {
    pub fn new(key: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            key: key.into(),
            uuid,
        }
    }
}

/// Serialized projection state together with the last fact folded into it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub last_fact: Uuid,
    pub bytes: Vec<u8>,
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub fact_count: u64,
    pub namespace_count: u64,
    pub head: Serial,
    pub log_size_bytes: u64,
}

//! In-memory fact indices.

use crate::error::{Result, StoreError};
use crate::types::{FactHeader, Serial};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Where a fact lives and what its header says.
#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub serial: Serial,
    pub offset: u64,
    pub header: Arc<FactHeader>,
}

#[derive(Default)]
struct IndexInner {
    /// Serial to frame offset and header, in log order.
    by_serial: BTreeMap<Serial, IndexEntry>,

    /// Fact id to serial.
    by_id: HashMap<Uuid, Serial>,

    /// Unique identifier to the id of the fact that claimed it.
    unique_identifiers: HashMap<String, Uuid>,

    /// Namespace to the distinct types seen in it.
    types_by_ns: BTreeMap<String, BTreeSet<String>>,

    /// Serials of non-mark facts per namespace, ascending.
    serials_by_ns: HashMap<String, Vec<Serial>>,

    /// Serials of non-mark facts per aggregate id, ascending.
    serials_by_agg: HashMap<Uuid, Vec<Serial>>,

    head: Serial,
}

/// Index over the fact log.
///
/// All maps sit behind one lock so a committed batch becomes visible at
/// once: a reader never sees some facts of a batch but not others.
#[derive(Default)]
pub struct FactIndex {
    inner: RwLock<IndexInner>,
}

impl FactIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the batch if any id or unique identifier is already taken,
    /// either by a committed fact or by an earlier fact in the same batch.
    pub fn check_unique<'a>(&self, headers: impl IntoIterator<Item = &'a FactHeader>) -> Result<()> {
        let inner = self.inner.read();
        let mut ids = HashSet::new();
        let mut idents = HashSet::new();

        for header in headers {
            if inner.by_id.contains_key(&header.id) || !ids.insert(header.id) {
                debug!(id = %header.id, "rejecting duplicate fact id");
                return Err(StoreError::DuplicateFact(format!("id {}", header.id)));
            }

            if let Some(ident) = header.unique_identifier() {
                if inner.unique_identifiers.contains_key(ident) || !idents.insert(ident) {
                    debug!(ident, "rejecting duplicate unique identifier");
                    return Err(StoreError::DuplicateFact(format!(
                        "unique identifier {}",
                        ident
                    )));
                }
            }
        }

        Ok(())
    }

    /// Make a batch visible. Serials must be above the current head.
    pub fn commit(&self, entries: impl IntoIterator<Item = IndexEntry>) {
        let mut inner = self.inner.write();

        for entry in entries {
            let header = &entry.header;
            inner.by_id.insert(header.id, entry.serial);

            if let Some(ident) = header.unique_identifier() {
                inner.unique_identifiers.insert(ident.to_string(), header.id);
            }

            let types = inner.types_by_ns.entry(header.ns.clone()).or_default();
            if let Some(ref fact_type) = header.fact_type {
                types.insert(fact_type.clone());
            }

            if !header.is_mark() {
                inner
                    .serials_by_ns
                    .entry(header.ns.clone())
                    .or_default()
                    .push(entry.serial);
                for agg_id in &header.agg_ids {
                    inner
                        .serials_by_agg
                        .entry(*agg_id)
                        .or_default()
                        .push(entry.serial);
                }
            }

            inner.head = inner.head.max(entry.serial);
            inner.by_serial.insert(entry.serial, entry);
        }
    }

    pub fn get(&self, id: Uuid) -> Option<IndexEntry> {
        let inner = self.inner.read();
        let serial = inner.by_id.get(&id)?;
        inner.by_serial.get(serial).cloned()
    }

    pub fn serial_of(&self, id: Uuid) -> Option<Serial> {
        self.inner.read().by_id.get(&id).copied()
    }

    /// Highest committed serial, `Serial::ZERO` for an empty log.
    pub fn head(&self) -> Serial {
        self.inner.read().head
    }

    pub fn count(&self) -> usize {
        self.inner.read().by_serial.len()
    }

    pub fn namespaces(&self) -> BTreeSet<String> {
        self.inner.read().types_by_ns.keys().cloned().collect()
    }

    pub fn types(&self, ns: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .types_by_ns
            .get(ns)
            .cloned()
            .unwrap_or_default()
    }

    /// Up to `limit` entries with `after < serial <= until`, ascending.
    pub fn page(&self, after: Serial, until: Serial, limit: usize) -> Vec<IndexEntry> {
        if after >= until {
            return Vec::new();
        }
        self.inner
            .read()
            .by_serial
            .range(after.next()..=until)
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Every entry with `after < serial <= until`, ascending.
    pub fn range(&self, after: Serial, until: Serial) -> Vec<IndexEntry> {
        self.page(after, until, usize::MAX)
    }

    /// Walk the non-mark facts of `ns` (or of `agg_id`, when given) from
    /// the newest down to `after`, exclusive, and return the first entry
    /// `accept` takes. Only those candidates are visited. `accept` may fail,
    /// which aborts the walk.
    pub fn last_in<F>(
        &self,
        ns: &str,
        agg_id: Option<Uuid>,
        after: Serial,
        mut accept: F,
    ) -> Result<Option<IndexEntry>>
    where
        F: FnMut(&IndexEntry) -> Result<bool>,
    {
        let inner = self.inner.read();
        let candidates = match agg_id {
            Some(agg_id) => inner.serials_by_agg.get(&agg_id),
            None => inner.serials_by_ns.get(ns),
        };
        let candidates = candidates.map(Vec::as_slice).unwrap_or(&[]);

        for serial in candidates.iter().rev().take_while(|serial| **serial > after) {
            if let Some(entry) = inner.by_serial.get(serial) {
                if accept(entry)? {
                    return Ok(Some(entry.clone()));
                }
            }
        }
        Ok(None)
    }
}

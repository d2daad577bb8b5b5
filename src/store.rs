//! Main FactStore struct tying all components together.

use crate::attempt::{LockError, LockedOperationBuilder};
use crate::error::{Result, StoreError};
use crate::lock::{ExclusiveWriteLock, WriteLock};
use crate::log::{FactIndex, FactLog, IndexEntry};
use crate::notify::NotificationBus;
use crate::snapshots::SnapshotCache;
use crate::spec::FactSpec;
use crate::subscriptions::{
    CatchupStrategy, EngineConfig, FactObserver, IdObserver, IdsOnly, Subscription,
    SubscriptionEngine, SubscriptionRequest,
};
use crate::tokens::{State, StateToken, TokenStore};
use crate::transform::{FactTransformer, NoTransformation};
use crate::types::{Fact, FactInput, Serial, Snapshot, SnapshotId, StoreStats};
use fs2::FileExt;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Sync the log every N batches. Above 1, up to N - 1 acknowledged
    /// batches can be lost on power failure.
    pub sync_interval: u64,

    pub catchup_strategy: CatchupStrategy,

    /// Facts per page for paged catchup.
    pub page_size: usize,

    /// Re-scan a follow subscription at least this often, even when no
    /// commit signal arrives.
    pub follow_watchdog: Duration,

    /// Reconnect attempts to the notification bus before followers fail.
    pub transport_retries: u32,

    pub transport_backoff: Duration,

    /// Lifetime of a state token.
    pub token_ttl: Duration,

    /// Maximum number of live state tokens.
    pub token_capacity: usize,

    /// Snapshot cache size (number of snapshots).
    pub snapshot_cache_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./facts"),
            create_if_missing: true,
            sync_interval: FactLog::DEFAULT_SYNC_INTERVAL,
            catchup_strategy: CatchupStrategy::Paged,
            page_size: 500,
            follow_watchdog: Duration::from_secs(2),
            transport_retries: 5,
            transport_backoff: Duration::from_millis(100),
            token_ttl: Duration::from_secs(600),
            token_capacity: 10_000,
            snapshot_cache_size: 1000,
        }
    }
}

impl StoreConfig {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            strategy: self.catchup_strategy,
            page_size: self.page_size,
            watchdog: self.follow_watchdog,
            transport_retries: self.transport_retries,
            transport_backoff: self.transport_backoff,
        }
    }
}

/// Pluggable parts of a store. The defaults are an in-process write lock,
/// a private notification bus and no payload transformation.
pub struct Collaborators {
    pub bus: NotificationBus,
    pub transformer: Arc<dyn FactTransformer>,
    pub write_lock: Arc<dyn WriteLock>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            bus: NotificationBus::new(),
            transformer: Arc::new(NoTransformation),
            write_lock: Arc::new(ExclusiveWriteLock::new()),
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"FST\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// A durable, totally ordered log of facts.
///
/// Provides a unified interface for:
/// - Publishing facts, unconditionally or against a state token
/// - Point lookups and namespace/type enumeration
/// - Catchup and follow subscriptions
/// - Aggregate-scoped optimistic locking
/// - A snapshot cache for projections
pub struct FactStore {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: Arc<FactLog>,

    index: Arc<FactIndex>,

    /// Serializes every append.
    write_lock: Arc<dyn WriteLock>,

    tokens: TokenStore,

    snapshots: SnapshotCache,

    transformer: Arc<dyn FactTransformer>,

    bus: NotificationBus,

    engine: SubscriptionEngine,

    /// Last value handed out by `current_time`.
    clock: AtomicI64,
}

impl FactStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        Self::open_or_create_with(config, Collaborators::default())
    }

    pub fn open_or_create_with(config: StoreConfig, collaborators: Collaborators) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open_with(config, collaborators)
        } else if config.create_if_missing {
            Self::create_with(config, collaborators)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        Self::create_with(config, Collaborators::default())
    }

    fn create_with(config: StoreConfig, collaborators: Collaborators) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        Self::start(config, collaborators)
    }

    /// Open an existing store.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with(config, Collaborators::default())
    }

    fn open_with(config: StoreConfig, collaborators: Collaborators) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        Self::start(config, collaborators)
    }

    fn start(config: StoreConfig, collaborators: Collaborators) -> Result<Self> {
        let lock_file = Self::acquire_lock(&config.path)?;

        let (log, frames) =
            FactLog::open_with_sync_interval(config.path.join("facts.log"), config.sync_interval)?;
        let log = Arc::new(log);

        // Indices are not persisted; the log is the only source of truth.
        let index = Arc::new(FactIndex::new());
        index.commit(frames.into_iter().map(|frame| IndexEntry {
            serial: frame.serial,
            offset: frame.offset,
            header: Arc::new(frame.header),
        }));

        let Collaborators {
            bus,
            transformer,
            write_lock,
        } = collaborators;
        bus.start();

        let engine = SubscriptionEngine::start(
            Arc::clone(&log),
            Arc::clone(&index),
            bus.clone(),
            config.engine_config(),
        )?;

        info!(
            path = %config.path.display(),
            facts = index.count(),
            head = %index.head(),
            "fact store opened"
        );

        Ok(Self {
            tokens: TokenStore::new(config.token_capacity, config.token_ttl),
            snapshots: SnapshotCache::new(config.snapshot_cache_size),
            config,
            _lock_file: lock_file,
            log,
            index,
            write_lock,
            transformer,
            bus,
            engine,
            clock: AtomicI64::new(0),
        })
    }

    // --- Publishing ---

    /// Append facts as one atomic batch.
    ///
    /// Serials are assigned in order. If any id or unique identifier is
    /// already taken, or repeats within the batch, nothing is written.
    pub fn publish(&self, facts: Vec<FactInput>) -> Result<Vec<Fact>> {
        Self::validate(&facts)?;
        if facts.is_empty() {
            return Ok(Vec::new());
        }

        let committed = {
            let _guard = self.write_lock.acquire();
            self.append_locked(facts)?
        };

        self.bus.notify(self.index.head());
        Ok(committed)
    }

    pub fn publish_one(&self, fact: FactInput) -> Result<Fact> {
        let mut committed = self.publish(vec![fact])?;
        committed
            .pop()
            .ok_or_else(|| StoreError::Corruption("publish returned no fact".into()))
    }

    /// Publish the facts followed by a mark fact in the same batch.
    /// Returns the mark's id.
    pub fn publish_with_mark(&self, mut facts: Vec<FactInput>) -> Result<Uuid> {
        let mark = FactInput::mark();
        let mark_id = mark.id();
        facts.push(mark);
        self.publish(facts)?;
        Ok(mark_id)
    }

    /// Publish only if the state captured by `token` still holds.
    ///
    /// Returns `Ok(false)` on conflict, with nothing written. A token that
    /// is unknown or expired counts as a conflict. `None` publishes
    /// unconditionally.
    pub fn publish_if_unchanged(
        &self,
        facts: Vec<FactInput>,
        token: Option<StateToken>,
    ) -> Result<bool> {
        Self::validate(&facts)?;

        let expected = match token {
            None => None,
            Some(token) => match self.tokens.get(token) {
                Some(state) => Some(state),
                None => {
                    debug!(?token, "state token unknown or expired");
                    return Ok(false);
                }
            },
        };

        let outcome = {
            let _guard = self.write_lock.acquire();
            match expected {
                Some(ref state) => match self.state_for(&state.specs) {
                    Ok(serial) if serial != state.serial => Ok(None),
                    Ok(_) => self.append_locked(facts).map(Some),
                    Err(e) => Err(e),
                },
                None => self.append_locked(facts).map(Some),
            }
        };

        // Single use, whether the publish went through or not.
        if let Some(token) = token {
            self.tokens.invalidate(token);
        }

        match outcome? {
            Some(committed) => {
                if !committed.is_empty() {
                    self.bus.notify(self.index.head());
                }
                Ok(true)
            }
            None => {
                debug!(?token, "state changed, publish rejected");
                Ok(false)
            }
        }
    }

    /// Must be called with the write lock held.
    fn append_locked(&self, inputs: Vec<FactInput>) -> Result<Vec<Fact>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        self.index.check_unique(inputs.iter().map(|f| &f.header))?;

        let head = self.index.head();
        let facts: Vec<Fact> = inputs
            .into_iter()
            .zip(1u64..)
            .map(|(input, n)| Fact {
                serial: Serial(head.0 + n),
                header: input.header,
                payload: input.payload,
            })
            .collect();

        let offsets = self.log.append_batch(&facts)?;
        self.index
            .commit(facts.iter().zip(offsets).map(|(fact, offset)| IndexEntry {
                serial: fact.serial,
                offset,
                header: Arc::new(fact.header.clone()),
            }));

        debug!(
            count = facts.len(),
            first = %head.next(),
            last = %Serial(head.0 + facts.len() as u64),
            "batch committed"
        );
        Ok(facts)
    }

    fn validate(facts: &[FactInput]) -> Result<()> {
        for fact in facts {
            if fact.header.id.is_nil() {
                return Err(StoreError::Validation("fact id must be set".into()));
            }
            if fact.header.ns.is_empty() {
                return Err(StoreError::Validation(format!(
                    "fact {} has no namespace",
                    fact.header.id
                )));
            }
        }
        Ok(())
    }

    // --- State tokens ---

    /// Serial of the last committed fact matching any of `specs`, or
    /// zero. Marks never count.
    pub fn state_for(&self, specs: &[FactSpec]) -> Result<Serial> {
        let mut state = Serial::ZERO;

        for spec in specs {
            let found = self.index.last_in(&spec.ns, spec.agg_id, state, |entry| {
                if !spec.matches_header(&entry.header) {
                    return Ok(false);
                }
                if !spec.has_predicate() {
                    return Ok(true);
                }
                let fact = self.log.read_at(entry.offset)?;
                Ok(spec.matches(&fact.header, &fact.payload)?)
            })?;

            if let Some(entry) = found {
                state = entry.serial;
            }
        }

        Ok(state)
    }

    /// Capture the current state for `specs` under a fresh token.
    pub fn state_token(&self, specs: &[FactSpec]) -> Result<StateToken> {
        let serial = self.state_for(specs)?;
        Ok(self.tokens.create(State {
            specs: specs.to_vec(),
            serial,
        }))
    }

    pub fn invalidate_state_token(&self, token: StateToken) {
        self.tokens.invalidate(token);
    }

    // --- Locking ---

    /// Begin a locked operation on `ns`.
    pub fn lock(
        &self,
        ns: impl Into<String>,
    ) -> std::result::Result<LockedOperationBuilder<'_>, LockError> {
        LockedOperationBuilder::new(self, ns)
    }

    // --- Reads ---

    pub fn fetch_by_id(&self, id: Uuid) -> Result<Option<Fact>> {
        match self.index.get(id) {
            Some(entry) => Ok(Some(self.log.read_at(entry.offset)?)),
            None => Ok(None),
        }
    }

    /// Fetch a fact and have it transformed to `version`.
    pub fn fetch_by_id_and_version(&self, id: Uuid, version: u32) -> Result<Option<Fact>> {
        match self.fetch_by_id(id)? {
            Some(fact) => Ok(Some(self.transformer.transform_if_necessary(fact, version)?)),
            None => Ok(None),
        }
    }

    pub fn serial_of(&self, id: Uuid) -> Option<Serial> {
        self.index.serial_of(id)
    }

    pub fn enumerate_namespaces(&self) -> BTreeSet<String> {
        self.index.namespaces()
    }

    pub fn enumerate_types(&self, ns: &str) -> BTreeSet<String> {
        self.index.types(ns)
    }

    /// Highest committed serial.
    pub fn head(&self) -> Serial {
        self.index.head()
    }

    /// Milliseconds since the epoch, never lower than a value returned
    /// before by this store.
    pub fn current_time(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let previous = self.clock.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }

    // --- Subscriptions ---

    pub fn subscribe(
        &self,
        request: SubscriptionRequest,
        observer: impl FactObserver,
    ) -> Result<Subscription> {
        self.engine.subscribe(request, observer)
    }

    /// Like [`FactStore::subscribe`] but only fact ids are delivered.
    pub fn subscribe_to_ids(
        &self,
        request: SubscriptionRequest,
        observer: impl IdObserver,
    ) -> Result<Subscription> {
        self.engine.subscribe(request, IdsOnly(observer))
    }

    /// The bus commit signals go out on.
    pub fn notification_bus(&self) -> &NotificationBus {
        &self.bus
    }

    // --- Snapshots ---

    pub fn get_snapshot(&self, id: &SnapshotId) -> Option<Snapshot> {
        self.snapshots.get(id)
    }

    pub fn set_snapshot(&self, snapshot: Snapshot) {
        self.snapshots.set(snapshot)
    }

    pub fn clear_snapshot(&self, id: &SnapshotId) {
        self.snapshots.clear(id)
    }

    // --- Store Operations ---

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            fact_count: self.index.count() as u64,
            namespace_count: self.index.namespaces().len() as u64,
            head: self.index.head(),
            log_size_bytes: self.log.size(),
        }
    }

    /// Sync all data to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for FactStore {
    fn drop(&mut self) {
        self.engine.stop();
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::PredicateError;
    use crate::types::FactHeader;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            path: dir.path().join("store"),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_syncs_every_batch() {
        assert_eq!(StoreConfig::default().sync_interval, 1);
    }

    #[test]
    fn test_create_store() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();

        assert!(store.path().join("MANIFEST").exists());
        assert!(store.path().join("facts.log").exists());
        assert_eq!(store.head(), Serial::ZERO);
    }

    #[test]
    fn test_publish_assigns_serials() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();

        let batch = store
            .publish(vec![
                FactInput::json("default", &json!({"n": 1})).unwrap(),
                FactInput::json("default", &json!({"n": 2})).unwrap(),
            ])
            .unwrap();
        assert_eq!(batch[0].serial, Serial(1));
        assert_eq!(batch[1].serial, Serial(2));

        let next = store.publish_one(FactInput::new("default", vec![])).unwrap();
        assert_eq!(next.serial, Serial(3));
        assert_eq!(store.head(), Serial(3));
    }

    #[test]
    fn test_fetch_by_id() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();

        let input = FactInput::json("default", &json!({"text": "Hello"}))
            .unwrap()
            .with_type("greeting");
        let id = input.id();
        store.publish_one(input).unwrap();

        let fact = store.fetch_by_id(id).unwrap().unwrap();
        assert_eq!(fact.fact_type(), Some("greeting"));
        let payload: serde_json::Value = fact.payload_json().unwrap();
        assert_eq!(payload["text"], "Hello");

        assert!(store.fetch_by_id(Uuid::new_v4()).unwrap().is_none());
        assert_eq!(store.serial_of(id), Some(Serial(1)));
    }

    #[test]
    fn test_validation_before_write() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();

        let nil_id = FactInput::new("default", vec![]).with_id(Uuid::nil());
        assert!(matches!(
            store.publish(vec![FactInput::new("default", vec![]), nil_id]),
            Err(StoreError::Validation(_))
        ));

        let no_ns = FactInput::new("", vec![]);
        assert!(matches!(
            store.publish(vec![no_ns]),
            Err(StoreError::Validation(_))
        ));

        assert_eq!(store.stats().fact_count, 0);
    }

    #[test]
    fn test_duplicate_leaves_store_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();

        let first = FactInput::new("default", vec![]);
        store.publish_one(first.clone()).unwrap();
        let size = store.stats().log_size_bytes;

        let result = store.publish(vec![FactInput::new("default", vec![]), first]);
        assert!(matches!(result, Err(StoreError::DuplicateFact(_))));
        assert_eq!(store.head(), Serial(1));
        assert_eq!(store.stats().log_size_bytes, size);
    }

    #[test]
    fn test_publish_with_mark() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();

        let input = FactInput::new("default", vec![]);
        let fact_id = input.id();
        let mark_id = store.publish_with_mark(vec![input]).unwrap();

        let mark = store.fetch_by_id(mark_id).unwrap().unwrap();
        assert!(mark.is_mark());
        assert!(store.serial_of(mark_id) > store.serial_of(fact_id));
    }

    #[test]
    fn test_state_for_ignores_other_specs_and_marks() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();
        let agg = Uuid::new_v4();

        store
            .publish_one(FactInput::new("ns", vec![]).with_agg_id(agg))
            .unwrap();
        store.publish_one(FactInput::new("ns", vec![])).unwrap();
        store.publish_with_mark(vec![]).unwrap();

        let specs = vec![FactSpec::ns("ns").with_agg_id(agg)];
        assert_eq!(store.state_for(&specs).unwrap(), Serial(1));
        assert_eq!(store.state_for(&[FactSpec::ns("other")]).unwrap(), Serial::ZERO);
    }

    #[test]
    fn test_state_for_takes_newest_over_all_specs() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();
        let agg = Uuid::new_v4();

        store
            .publish(vec![
                FactInput::new("a", b"keep".to_vec()).with_type("t"),
                FactInput::new("b", vec![]).with_agg_id(agg),
                FactInput::new("a", b"skip".to_vec()).with_type("t"),
                FactInput::new("a", vec![]).with_type("u"),
                FactInput::new("c", vec![]).with_agg_id(agg),
            ])
            .unwrap();

        let typed = FactSpec::ns("a").with_type("t");
        assert_eq!(store.state_for(&[typed.clone()]).unwrap(), Serial(3));

        let filtered = typed.with_predicate(|_: &FactHeader, payload: &[u8]| {
            Ok::<_, PredicateError>(payload == b"keep")
        });
        assert_eq!(store.state_for(&[filtered.clone()]).unwrap(), Serial(1));

        let by_agg = FactSpec::ns("b").with_agg_id(agg);
        assert_eq!(store.state_for(&[by_agg.clone()]).unwrap(), Serial(2));
        assert_eq!(store.state_for(&[filtered, by_agg]).unwrap(), Serial(2));
    }

    #[test]
    fn test_publish_if_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();
        let specs = vec![FactSpec::ns("ns")];

        let token = store.state_token(&specs).unwrap();
        assert!(store
            .publish_if_unchanged(vec![FactInput::new("ns", vec![])], Some(token))
            .unwrap());

        let stale = store.state_token(&specs).unwrap();
        store.publish_one(FactInput::new("ns", vec![])).unwrap();
        assert!(!store
            .publish_if_unchanged(vec![FactInput::new("ns", vec![])], Some(stale))
            .unwrap());
        assert_eq!(store.head(), Serial(2));

        // unrelated facts do not conflict
        let token = store.state_token(&specs).unwrap();
        store.publish_one(FactInput::new("elsewhere", vec![])).unwrap();
        assert!(store
            .publish_if_unchanged(vec![FactInput::new("ns", vec![])], Some(token))
            .unwrap());

        // no token, no precondition
        assert!(store
            .publish_if_unchanged(vec![FactInput::new("ns", vec![])], None)
            .unwrap());
    }

    #[test]
    fn test_token_is_single_use() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();
        let token = store.state_token(&[FactSpec::ns("ns")]).unwrap();

        assert!(store
            .publish_if_unchanged(vec![FactInput::new("other", vec![])], Some(token))
            .unwrap());
        assert!(!store
            .publish_if_unchanged(vec![FactInput::new("other", vec![])], Some(token))
            .unwrap());
    }

    #[test]
    fn test_token_spent_when_append_fails() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();
        let taken = store.publish_one(FactInput::new("ns", vec![])).unwrap();
        let token = store.state_token(&[FactSpec::ns("ns")]).unwrap();

        let duplicate = FactInput::new("ns", vec![]).with_id(taken.id());
        assert!(matches!(
            store.publish_if_unchanged(vec![duplicate], Some(token)),
            Err(StoreError::DuplicateFact(_))
        ));
        assert!(!store
            .publish_if_unchanged(vec![FactInput::new("ns", vec![])], Some(token))
            .unwrap());
        assert_eq!(store.head(), Serial(1));
    }

    #[test]
    fn test_enumerations() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();
        store
            .publish(vec![
                FactInput::new("ns1", vec![]).with_type("a"),
                FactInput::new("ns1", vec![]).with_type("b"),
                FactInput::new("ns2", vec![]).with_type("c"),
            ])
            .unwrap();

        let namespaces: Vec<_> = store.enumerate_namespaces().into_iter().collect();
        assert_eq!(namespaces, vec!["ns1", "ns2"]);
        let types: Vec<_> = store.enumerate_types("ns1").into_iter().collect();
        assert_eq!(types, vec!["a", "b"]);
    }

    #[test]
    fn test_current_time_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();
        let mut last = store.current_time();
        for _ in 0..100 {
            let now = store.current_time();
            assert!(now >= last);
            last = now;
        }
        assert!(last > 0);
    }

    #[test]
    fn test_reopen_rebuilds_index() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let id;

        {
            let store = FactStore::create(config.clone()).unwrap();
            let input = FactInput::new("default", vec![]).with_unique_identifier("u1");
            id = input.id();
            store.publish_one(input).unwrap();
            store.publish_one(FactInput::new("default", vec![])).unwrap();
        }

        {
            let store = FactStore::open(config).unwrap();
            assert_eq!(store.head(), Serial(2));
            assert_eq!(store.serial_of(id), Some(Serial(1)));

            let clash = FactInput::new("default", vec![]).with_unique_identifier("u1");
            assert!(matches!(
                store.publish_one(clash),
                Err(StoreError::DuplicateFact(_))
            ));

            let next = store.publish_one(FactInput::new("default", vec![])).unwrap();
            assert_eq!(next.serial, Serial(3));
        }
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let _store = FactStore::create(config.clone()).unwrap();

        assert!(matches!(FactStore::open(config), Err(StoreError::Locked)));
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            create_if_missing: false,
            ..test_config(&dir)
        };
        assert!(matches!(
            FactStore::open_or_create(config),
            Err(StoreError::NotInitialized)
        ));
    }

    #[test]
    fn test_snapshots() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::create(test_config(&dir)).unwrap();
        let id = SnapshotId::new("projection", Uuid::nil());

        store.set_snapshot(Snapshot {
            id: id.clone(),
            last_fact: Uuid::new_v4(),
            bytes: b"state".to_vec(),
        });
        assert_eq!(store.get_snapshot(&id).unwrap().bytes, b"state");

        store.clear_snapshot(&id);
        assert!(store.get_snapshot(&id).is_none());
    }
}

//! State tokens for optimistic publishing.
//!
//! A token remembers the log state a reader observed for a set of specs.
//! Publishing against the token succeeds only if that state is unchanged.

use crate::spec::FactSpec;
use crate::types::Serial;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::trace;
use uuid::Uuid;

/// Snapshot of the log as seen through a set of specs.
#[derive(Clone, Debug)]
pub struct State {
    pub specs: Vec<FactSpec>,

    /// Serial of the last committed fact matching any of the specs.
    pub serial: Serial,
}

/// Opaque handle to a stored [`State`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateToken(Uuid);

impl StateToken {
    fn generate() -> Self {
        StateToken(Uuid::new_v4())
    }
}

impl fmt::Debug for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateToken({})", self.0)
    }
}

struct StoredState {
    state: State,
    created: Instant,
}

/// Bounded store of live tokens. Tokens expire after `ttl` and the
/// least recently used ones are evicted past `capacity`.
pub struct TokenStore {
    states: Mutex<LruCache<StateToken, StoredState>>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            states: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn create(&self, state: State) -> StateToken {
        let token = StateToken::generate();
        trace!(?token, serial = %state.serial, "state token created");
        self.states.lock().put(
            token,
            StoredState {
                state,
                created: Instant::now(),
            },
        );
        token
    }

    /// Look up a live token without consuming it.
    pub fn get(&self, token: StateToken) -> Option<State> {
        let mut states = self.states.lock();
        let expired = match states.get(&token) {
            Some(stored) if stored.created.elapsed() <= self.ttl => {
                return Some(stored.state.clone())
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            trace!(?token, "state token expired");
            states.pop(&token);
        }
        None
    }

    pub fn invalidate(&self, token: StateToken) {
        self.states.lock().pop(&token);
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

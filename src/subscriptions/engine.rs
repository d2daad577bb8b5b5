//! Subscription engine: catchup replays and the follow driver.
//!
//! Each subscription replays on its own short-lived thread. Follow
//! subscriptions are then handed to a single driver thread that waits on
//! the notification bus and the per-subscription watchdogs, so no thread
//! is parked per follower.

use crate::error::{Result, StoreError};
use crate::log::{FactIndex, FactLog};
use crate::notify::{NotificationBus, Notifications};
use crossbeam_channel::{never, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use super::catchup::Scanner;
use super::subscription::{Subscription, SubscriptionShared};
use super::types::{
    CatchupStrategy, FactObserver, StartPoint, SubscriptionId, SubscriptionMode,
    SubscriptionRequest,
};

/// Longest the driver sleeps when nothing is due.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Tuning for the engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub strategy: CatchupStrategy,

    /// Facts per page for [`CatchupStrategy::Paged`].
    pub page_size: usize,

    /// Default bound between re-scans of a follow subscription.
    pub watchdog: Duration,

    /// Reconnect attempts before followers are failed.
    pub transport_retries: u32,

    /// Backoff unit. The n-th attempt waits n times this.
    pub transport_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: CatchupStrategy::Paged,
            page_size: 500,
            watchdog: Duration::from_secs(2),
            transport_retries: 5,
            transport_backoff: Duration::from_millis(100),
        }
    }
}

/// Messages to the follow driver.
pub(crate) enum Control {
    Follow(Arc<SubscriptionShared>),
    Unfollow(SubscriptionId),
    Shutdown,
}

struct EngineShared {
    scanner: Scanner,
    index: Arc<FactIndex>,
    bus: NotificationBus,
    config: EngineConfig,
    next_id: AtomicU64,
    running: AtomicBool,
}

/// Runs catchup and follow subscriptions against the log.
pub struct SubscriptionEngine {
    shared: Arc<EngineShared>,
    control: Sender<Control>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionEngine {
    /// Create the engine and start its follow driver.
    pub fn start(
        log: Arc<FactLog>,
        index: Arc<FactIndex>,
        bus: NotificationBus,
        config: EngineConfig,
    ) -> Result<Self> {
        let shared = Arc::new(EngineShared {
            scanner: Scanner::new(log, Arc::clone(&index), config.strategy, config.page_size),
            index,
            bus,
            config,
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
        });

        let (control, control_rx) = unbounded();
        let driver = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("factstore-follow".into())
                .spawn(move || Driver::new(shared, control_rx).run())?
        };

        debug!("subscription engine started");
        Ok(Self {
            shared,
            control,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Stop the driver. Followers still running get `on_error`.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.control.send(Control::Shutdown);
        if let Some(handle) = self.driver.lock().take() {
            if handle.join().is_err() {
                error!("follow driver panicked");
            }
        }
        debug!("subscription engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start a subscription. The replay runs in the background; use the
    /// returned handle to wait for it or to close the subscription.
    pub fn subscribe(
        &self,
        request: SubscriptionRequest,
        observer: impl FactObserver,
    ) -> Result<Subscription> {
        if request.specs.is_empty() {
            return Err(StoreError::Validation(
                "a subscription needs at least one fact spec".into(),
            ));
        }
        if !self.is_running() {
            return Err(StoreError::SubscriptionFailed(
                "subscription engine stopped".into(),
            ));
        }

        let start = match request.start {
            StartPoint::FromScratch => Default::default(),
            StartPoint::FromNowOn => self.shared.index.head(),
            StartPoint::After(id) => self.shared.index.serial_of(id).ok_or_else(|| {
                StoreError::Validation(format!("unknown fact id {} as start point", id))
            })?,
        };

        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let latency = request.max_latency.unwrap_or(self.shared.config.watchdog);
        let mode = request.mode;
        let sub = Arc::new(SubscriptionShared::new(
            id,
            request,
            Box::new(observer),
            start,
            latency,
        ));
        debug!(subscription = id.0, ?mode, start = %start, "subscription created");

        {
            let shared = Arc::clone(&self.shared);
            let sub = Arc::clone(&sub);
            let control = self.control.clone();
            thread::Builder::new()
                .name(format!("factstore-catchup-{}", id.0))
                .spawn(move || replay(&shared, &sub, &control))?;
        }

        Ok(Subscription::new(sub, self.control.clone()))
    }
}

impl Drop for SubscriptionEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Replay committed facts up to the head as of now, then either complete
/// or hand over to the follow driver.
fn replay(shared: &EngineShared, sub: &Arc<SubscriptionShared>, control: &Sender<Control>) {
    sub.begin_catchup();
    let boundary = shared.scanner.head();

    match shared.scanner.scan(sub, boundary) {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            warn!(subscription = sub.id.0, error = %e, "catchup failed");
            sub.fail(&e);
            return;
        }
    }

    match sub.request.mode {
        SubscriptionMode::Catchup => {
            sub.caught_up();
            sub.complete();
        }
        SubscriptionMode::Follow => {
            if control.send(Control::Follow(Arc::clone(sub))).is_err() {
                sub.fail(&StoreError::SubscriptionFailed(
                    "subscription engine stopped".into(),
                ));
            }
        }
    }
}

/// The single thread serving every follow subscription.
struct Driver {
    shared: Arc<EngineShared>,
    control: Receiver<Control>,
    follows: HashMap<SubscriptionId, Arc<SubscriptionShared>>,
    listener: Option<Notifications>,
    reconnect_attempts: u32,
    next_reconnect: Instant,
}

impl Driver {
    fn new(shared: Arc<EngineShared>, control: Receiver<Control>) -> Self {
        let listener = shared.bus.subscribe().ok();
        if listener.is_none() {
            warn!("notification bus unavailable, following on watchdog only");
        }
        Self {
            shared,
            control,
            follows: HashMap::new(),
            listener,
            reconnect_attempts: 0,
            next_reconnect: Instant::now(),
        }
    }

    fn run(mut self) {
        let control = self.control.clone();
        loop {
            let notifications = self
                .listener
                .as_ref()
                .map(|l| l.receiver().clone())
                .unwrap_or_else(never);
            let timeout = self.next_wakeup();

            select! {
                recv(control) -> msg => match msg {
                    Ok(Control::Follow(sub)) => self.follow(sub),
                    Ok(Control::Unfollow(id)) => {
                        if self.follows.remove(&id).is_some() {
                            trace!(subscription = id.0, "follow subscription removed");
                        }
                    }
                    Ok(Control::Shutdown) | Err(_) => break,
                },
                recv(notifications) -> msg => match msg {
                    Ok(_) => self.rescan_all(),
                    Err(_) => {
                        warn!("notification bus disconnected");
                        self.listener = None;
                        self.reconnect_attempts = 0;
                        self.next_reconnect = Instant::now();
                    }
                },
                default(timeout) => {}
            }

            self.watchdog();
            if self.listener.is_none() {
                self.reconnect();
            }
        }

        let stopped = StoreError::SubscriptionFailed("subscription engine stopped".into());
        for (_, sub) in self.follows.drain() {
            sub.fail(&stopped);
        }
        while let Ok(msg) = control.try_recv() {
            if let Control::Follow(sub) = msg {
                sub.fail(&stopped);
            }
        }
    }

    /// Until the earliest watchdog or reconnect deadline.
    fn next_wakeup(&self) -> Duration {
        let mut wait = IDLE_WAIT;
        for sub in self.follows.values() {
            wait = wait.min(sub.until_watchdog());
        }
        if self.listener.is_none() {
            wait = wait.min(self.next_reconnect.saturating_duration_since(Instant::now()));
        }
        wait
    }

    /// Take over a subscription whose replay finished. The first scan here
    /// closes the gap between the replay boundary and the current head.
    fn follow(&mut self, sub: Arc<SubscriptionShared>) {
        if sub.is_done() {
            return;
        }
        if self.scan(&sub) {
            sub.caught_up();
            self.follows.insert(sub.id, sub);
        }
    }

    fn rescan_all(&mut self) {
        let subs: Vec<_> = self.follows.values().cloned().collect();
        for sub in subs {
            if !self.scan(&sub) {
                self.follows.remove(&sub.id);
            }
        }
    }

    fn watchdog(&mut self) {
        let due: Vec<_> = self
            .follows
            .values()
            .filter(|sub| sub.until_watchdog().is_zero())
            .cloned()
            .collect();

        for sub in due {
            trace!(subscription = sub.id.0, "watchdog re-scan");
            if !self.scan(&sub) {
                self.follows.remove(&sub.id);
            }
        }
    }

    /// Scan to the current head. False if the subscription is finished.
    fn scan(&self, sub: &SubscriptionShared) -> bool {
        if sub.is_done() {
            return false;
        }
        let head = self.shared.scanner.head();
        match self.shared.scanner.scan(sub, head) {
            Ok(alive) => alive,
            Err(e) => {
                warn!(subscription = sub.id.0, error = %e, "follow scan failed");
                sub.fail(&e);
                false
            }
        }
    }

    fn reconnect(&mut self) {
        if Instant::now() < self.next_reconnect {
            return;
        }

        match self.shared.bus.subscribe() {
            Ok(listener) => {
                info!(
                    attempts = self.reconnect_attempts + 1,
                    "notification bus reconnected"
                );
                self.listener = Some(listener);
                self.reconnect_attempts = 0;
                // Commits during the outage produced no signal.
                self.rescan_all();
            }
            Err(e) => {
                self.reconnect_attempts += 1;
                let retries = self.shared.config.transport_retries;
                if self.reconnect_attempts >= retries {
                    error!(attempts = self.reconnect_attempts, "giving up on notification bus");
                    let failure = StoreError::Transport(format!(
                        "no notifications after {} reconnect attempts: {}",
                        self.reconnect_attempts, e
                    ));
                    for (_, sub) in self.follows.drain() {
                        sub.fail(&failure);
                    }
                    self.reconnect_attempts = 0;
                }
                self.next_reconnect =
                    Instant::now() + self.shared.config.transport_backoff * self.reconnect_attempts.max(1);
                debug!(attempt = self.reconnect_attempts, "notification bus reconnect failed");
            }
        }
    }
}

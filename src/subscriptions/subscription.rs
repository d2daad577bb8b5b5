//! A running subscription and the handle its owner holds.

use crate::error::{panic_message, Result, StoreError};
use crate::types::{Fact, Serial};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::engine::Control;
use super::types::{FactObserver, SubscriptionId, SubscriptionRequest, SubscriptionState};

struct Status {
    state: SubscriptionState,
    caught_up: bool,
    error: Option<String>,
}

/// State shared between the handle, the catchup thread and the follow
/// driver.
pub(crate) struct SubscriptionShared {
    pub id: SubscriptionId,
    pub request: SubscriptionRequest,

    /// Held around every observer call. Reentrant so an observer may close
    /// its own subscription.
    gate: ReentrantMutex<()>,

    observer: Mutex<Box<dyn FactObserver>>,

    /// Last serial the scanner looked at. Held for the whole scan so two
    /// scans of one subscription never interleave.
    pub cursor: Mutex<Serial>,

    /// Set once no further callbacks may fire.
    done: AtomicBool,

    status: Mutex<Status>,
    changed: Condvar,

    last_scan: Mutex<Instant>,
    pub latency: Duration,
}

impl SubscriptionShared {
    pub fn new(
        id: SubscriptionId,
        request: SubscriptionRequest,
        observer: Box<dyn FactObserver>,
        start: Serial,
        latency: Duration,
    ) -> Self {
        Self {
            id,
            request,
            gate: ReentrantMutex::new(()),
            observer: Mutex::new(observer),
            cursor: Mutex::new(start),
            done: AtomicBool::new(false),
            status: Mutex::new(Status {
                state: SubscriptionState::Init,
                caught_up: false,
                error: None,
            }),
            changed: Condvar::new(),
            last_scan: Mutex::new(Instant::now()),
            latency,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SubscriptionState {
        self.status.lock().state
    }

    fn set_state(&self, state: SubscriptionState) {
        let mut status = self.status.lock();
        if !status.state.is_terminal() {
            debug!(subscription = self.id.0, from = ?status.state, to = ?state, "subscription state");
            status.state = state;
        }
        self.changed.notify_all();
    }

    pub fn begin_catchup(&self) {
        self.set_state(SubscriptionState::Catchup);
    }

    pub fn touch(&self) {
        *self.last_scan.lock() = Instant::now();
    }

    /// Time left until the watchdog should re-scan.
    pub fn until_watchdog(&self) -> Duration {
        self.latency.saturating_sub(self.last_scan.lock().elapsed())
    }

    /// Hand one fact to the observer. Returns false once the subscription
    /// is done.
    pub fn deliver(&self, fact: Fact) -> bool {
        let _gate = self.gate.lock();
        if self.is_done() {
            return false;
        }
        if let Err(msg) = self.call(|observer| observer.on_next(fact)) {
            self.fail(&StoreError::SubscriptionFailed(msg));
            return false;
        }
        !self.is_done()
    }

    /// Run one observer callback. A panic is caught and returned as text so
    /// it never unwinds into a thread shared with other subscriptions.
    fn call<F>(&self, f: F) -> std::result::Result<(), String>
    where
        F: FnOnce(&mut dyn FactObserver),
    {
        let mut observer = self.observer.lock();
        panic::catch_unwind(AssertUnwindSafe(|| f(&mut **observer)))
            .map_err(|panic| panic_message("observer", panic))
    }

    /// The replay reached the boundary. Follow subscriptions keep running.
    pub fn caught_up(&self) {
        {
            let _gate = self.gate.lock();
            if self.is_done() {
                return;
            }
            if let Err(msg) = self.call(|observer| observer.on_catchup()) {
                self.fail(&StoreError::SubscriptionFailed(msg));
                return;
            }
        }

        let mut status = self.status.lock();
        status.caught_up = true;
        if status.state == SubscriptionState::Catchup && self.request.mode.is_follow() {
            status.state = SubscriptionState::Following;
            debug!(subscription = self.id.0, "subscription following");
        }
        self.changed.notify_all();
    }

    pub fn complete(&self) {
        {
            let _gate = self.gate.lock();
            if self.done.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Err(msg) = self.call(|observer| observer.on_complete()) {
                warn!(subscription = self.id.0, "{}", msg);
            }
        }
        self.set_state(SubscriptionState::Complete);
    }

    /// Terminate with an error. Only this subscription is affected.
    pub fn fail(&self, error: &StoreError) {
        {
            let _gate = self.gate.lock();
            if self.done.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Err(msg) = self.call(|observer| observer.on_error(error)) {
                warn!(subscription = self.id.0, "{}", msg);
            }
        }

        let mut status = self.status.lock();
        if !status.state.is_terminal() {
            debug!(subscription = self.id.0, error = %error, "subscription failed");
            status.state = SubscriptionState::Failed;
            status.error = Some(error.to_string());
        }
        self.changed.notify_all();
    }

    /// Stop all further callbacks. Waits for an in-flight callback on
    /// another thread to return.
    pub fn close(&self) {
        let was_done = self.done.swap(true, Ordering::SeqCst);
        drop(self.gate.lock());
        if !was_done {
            self.set_state(SubscriptionState::Closed);
        }
    }

    fn wait_for<F>(&self, timeout: Duration, what: &'static str, mut reached: F) -> Result<()>
    where
        F: FnMut(&Status) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        loop {
            if reached(&status) {
                return Ok(());
            }
            match status.state {
                SubscriptionState::Failed => {
                    let msg = status.error.clone().unwrap_or_default();
                    return Err(StoreError::SubscriptionFailed(msg));
                }
                SubscriptionState::Closed => return Err(StoreError::SubscriptionClosed),
                _ => {}
            }
            if self.changed.wait_until(&mut status, deadline).timed_out() {
                return if reached(&status) {
                    Ok(())
                } else {
                    Err(StoreError::Timeout(what))
                };
            }
        }
    }
}

/// Handle to a running subscription. Dropping it closes the subscription.
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
    control: Sender<Control>,
}

impl Subscription {
    pub(crate) fn new(shared: Arc<SubscriptionShared>, control: Sender<Control>) -> Self {
        Self { shared, control }
    }

    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    /// Block until the replay of already committed facts has finished.
    pub fn await_catchup(&self, timeout: Duration) -> Result<()> {
        self.shared
            .wait_for(timeout, "catchup", |status| status.caught_up)
    }

    /// Block until a catchup subscription has completed.
    pub fn await_complete(&self, timeout: Duration) -> Result<()> {
        self.shared.wait_for(timeout, "completion", |status| {
            status.state == SubscriptionState::Complete
        })
    }

    /// Stop delivery. No callback fires after this returns, unless it is
    /// called from inside one.
    pub fn close(&self) {
        self.shared.close();
        let _ = self.control.send(Control::Unfollow(self.shared.id));
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

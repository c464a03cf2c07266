// Copyright 2020 Joyent, Inc.

//! Connection leases.
//!
//! A client that asks for a lease pings its server periodically.  The server
//! tracks the last renewal per session and, when a session goes a whole
//! lease period without renewing, tears down that session's callback
//! registrations and tells its connection listeners.  The client side tells
//! its own listeners when pings have failed for a whole lease period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use slog::{debug, info, o, trace, warn, Logger};

use crate::error::{RemotingError, Result};
use crate::invocation::{InternalInvocation, InvocationRequest, Outcome};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::transport::ClientInvoker;

/// Notified when a peer is judged dead.
pub trait ConnectionListener: Send + Sync {
    fn handle_connection_exception(&self, error: &RemotingError, session_id: &str);
}

pub type ConnectionListeners = Arc<RwLock<Vec<Arc<dyn ConnectionListener>>>>;

pub(crate) fn notify(listeners: &ConnectionListeners, error: &RemotingError, session_id: &str) {
    for listener in listeners.read().iter() {
        listener.handle_connection_exception(error, session_id);
    }
}

#[derive(Clone, Debug)]
pub struct Lease {
    pub session_id: String,
    pub period: Duration,
    pub last_renewal: Instant,
}

impl Lease {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_renewal) > self.period
    }
}

/// Server-side lease bookkeeping.  A zero period disables leasing.
pub struct LeaseTracker {
    period: Duration,
    leases: Mutex<HashMap<String, Lease>>,
    listeners: ConnectionListeners,
    log: Logger,
}

impl LeaseTracker {
    pub fn new(period: Duration, log: &Logger) -> LeaseTracker {
        LeaseTracker {
            period,
            leases: Mutex::new(HashMap::new()),
            listeners: Arc::new(RwLock::new(Vec::new())),
            log: log.new(o!("component" => "lease-tracker")),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_enabled(&self) -> bool {
        self.period > Duration::from_secs(0)
    }

    /// Starts or renews the lease for `session_id`.
    pub fn renew(&self, session_id: &str) {
        if !self.is_enabled() {
            return;
        }
        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get_mut(session_id) {
            Some(lease) => lease.last_renewal = now,
            None => {
                info!(self.log, "lease started"; "session" => session_id,
                    "period_ms" => self.period.as_millis() as u64);
                leases.insert(
                    session_id.to_string(),
                    Lease {
                        session_id: session_id.to_string(),
                        period: self.period,
                        last_renewal: now,
                    },
                );
            }
        }
    }

    /// Any traffic on a leased session counts as a renewal.
    pub fn touch(&self, session_id: &str) {
        if let Some(lease) = self.leases.lock().get_mut(session_id) {
            lease.last_renewal = Instant::now();
        }
    }

    pub fn terminate(&self, session_id: &str) -> Option<Lease> {
        let lease = self.leases.lock().remove(session_id);
        if lease.is_some() {
            debug!(self.log, "lease terminated"; "session" => session_id);
        }
        lease
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.leases.lock().contains_key(session_id)
    }

    pub fn lease_count(&self) -> usize {
        self.leases.lock().len()
    }

    /// Removes and returns every lease that has expired as of `now`.
    pub fn take_expired(&self, now: Instant) -> Vec<Lease> {
        let mut leases = self.leases.lock();
        let expired: Vec<String> = leases
            .values()
            .filter(|l| l.is_expired(now))
            .map(|l| l.session_id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|session_id| leases.remove(session_id))
            .collect()
    }

    pub fn clear(&self) {
        self.leases.lock().clear();
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub(crate) fn notify_expired(&self, lease: &Lease) {
        warn!(self.log, "lease expired"; "session" => &lease.session_id);
        let error = RemotingError::LeaseExpired(lease.session_id.clone());
        notify(&self.listeners, &error, &lease.session_id);
    }
}

/// Sends a lease ping, returning the server's lease period when it has
/// leasing enabled.
pub fn ping(invoker: &dyn ClientInvoker, session_id: &str, lease: bool) -> Result<Option<Duration>> {
    let request = InvocationRequest::internal(session_id, InternalInvocation::Ping { lease });
    match invoker.invoke(request)?.outcome {
        Outcome::Return(payload) => Ok(payload
            .as_value()
            .and_then(|v| v.get("leasePeriod"))
            .and_then(Value::as_u64)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)),
        Outcome::Application(e) => Err(RemotingError::Application(e)),
        Outcome::Failure(f) => Err(f.into()),
    }
}

/// Client-side periodic lease renewal.
pub struct LeaseRenewer {
    task: TaskHandle,
    period: Duration,
    /// Held across each ping; set once stopped.
    stopped: Arc<Mutex<bool>>,
}

impl LeaseRenewer {
    pub fn start(
        scheduler: &Scheduler,
        invoker: Arc<dyn ClientInvoker>,
        session_id: &str,
        period: Duration,
        ping_frequency: Duration,
        listeners: ConnectionListeners,
        log: &Logger,
    ) -> LeaseRenewer {
        let log = log.new(o!("lease" => session_id.to_string()));
        let session_id = session_id.to_string();
        let mut last_success = Instant::now();
        let mut notified = false;
        let stopped = Arc::new(Mutex::new(false));
        let guard = Arc::clone(&stopped);

        info!(log, "renewing lease"; "period_ms" => period.as_millis() as u64,
            "ping_ms" => ping_frequency.as_millis() as u64);
        let task = scheduler.schedule("lease-renewer", ping_frequency, move || {
            let stopped = guard.lock();
            if *stopped {
                return;
            }
            match ping(invoker.as_ref(), &session_id, true) {
                Ok(_) => {
                    trace!(log, "lease renewed");
                    last_success = Instant::now();
                    notified = false;
                }
                Err(e) => {
                    warn!(log, "lease ping failed"; "error" => %e);
                    if !notified && last_success.elapsed() >= period {
                        notified = true;
                        // Listeners may stop this renewer.
                        drop(stopped);
                        let error = RemotingError::LeaseExpired(session_id.clone());
                        notify(&listeners, &error, &session_id);
                    }
                }
            }
        });
        LeaseRenewer {
            task,
            period,
            stopped,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stops renewing.  Returns once no ping is in flight.
    pub fn stop(&self) {
        self.task.cancel();
        *self.stopped.lock() = true;
    }
}

impl Drop for LeaseRenewer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Drain;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn log() -> Logger {
        Logger::root(slog_stdlog::StdLog.fuse(), o!())
    }

    struct Counter(AtomicUsize);

    impl ConnectionListener for Counter {
        fn handle_connection_exception(&self, error: &RemotingError, _session_id: &str) {
            assert!(matches!(error, RemotingError::LeaseExpired(_)));
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn disabled_tracker_grants_no_leases() {
        let tracker = LeaseTracker::new(Duration::from_secs(0), &log());
        tracker.renew("a");
        assert!(!tracker.is_active("a"));
    }

    #[test]
    fn leases_expire_after_their_period() {
        let tracker = LeaseTracker::new(Duration::from_millis(50), &log());
        tracker.renew("a");
        tracker.renew("b");
        let later = Instant::now() + Duration::from_millis(100);
        tracker.touch("b");
        let expired = tracker.take_expired(later);
        assert_eq!(expired.len(), 2);
        assert_eq!(tracker.lease_count(), 0);
        assert!(tracker.take_expired(later).is_empty());
    }

    #[test]
    fn renewal_postpones_expiry() {
        let tracker = LeaseTracker::new(Duration::from_secs(60), &log());
        tracker.renew("a");
        assert!(tracker.take_expired(Instant::now()).is_empty());
        assert!(tracker.terminate("a").is_some());
        assert!(tracker.terminate("a").is_none());
    }

    #[test]
    fn listeners_hear_expiry() {
        let tracker = LeaseTracker::new(Duration::from_millis(1), &log());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let listener: Arc<dyn ConnectionListener> = counter.clone();
        tracker.add_listener(Arc::clone(&listener));
        tracker.renew("a");
        for lease in tracker.take_expired(Instant::now() + Duration::from_millis(10)) {
            tracker.notify_expired(&lease);
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(tracker.remove_listener(&listener));
    }
}

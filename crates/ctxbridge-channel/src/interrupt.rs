//! In-flight request bookkeeping for servers that may unload mid-request.
//!
//! A server records every inbound request. When its page is about to unload,
//! each request that has not been answered yet gets a synthesized
//! "navigation interrupted" result, and any real response produced afterwards
//! for the same id is dropped. Entries older than the configured maximum age
//! are swept periodically so abandoned requests do not accumulate.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ctxbridge_envelope::{interrupted_response, Message, Request, RequestId};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default interval between stale-entry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default age after which an unanswered request is forgotten.
pub const DEFAULT_MAX_REQUEST_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct InFlight {
    method: String,
    received_at: Instant,
    seq: u64,
    interrupted: bool,
}

#[derive(Debug, Default)]
struct NotifierState {
    entries: HashMap<RequestId, InFlight>,
    next_seq: u64,
}

/// Records in-flight server requests and answers them on unload.
#[derive(Clone)]
pub struct InterruptNotifier {
    max_age: Duration,
    state: Arc<Mutex<NotifierState>>,
}

impl InterruptNotifier {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            state: Arc::new(Mutex::new(NotifierState::default())),
        }
    }

    /// Remember an inbound request.
    pub fn record(&self, request: &Request) {
        let mut state = self.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.entries.insert(
            request.id.clone(),
            InFlight {
                method: request.method.clone(),
                received_at: Instant::now(),
                seq,
                interrupted: false,
            },
        );
    }

    /// Forget `id` because a response is about to go out.
    ///
    /// Returns false if an interrupt response was already sent for `id`, in
    /// which case the real response must be suppressed.
    pub fn complete(&self, id: &RequestId) -> bool {
        match self.lock().entries.remove(id) {
            Some(entry) => !entry.interrupted,
            None => true,
        }
    }

    /// Build interrupt responses for every request not yet answered.
    ///
    /// Most recent request first. Each request is interrupted at most once.
    pub fn interrupt_all(&self) -> Vec<Message> {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();

        let mut state = self.lock();
        let mut targets: Vec<(u64, RequestId, String)> = state
            .entries
            .iter_mut()
            .filter(|(_, entry)| !entry.interrupted)
            .map(|(id, entry)| {
                entry.interrupted = true;
                (entry.seq, id.clone(), entry.method.clone())
            })
            .collect();
        drop(state);

        targets.sort_by(|a, b| b.0.cmp(&a.0));
        targets
            .into_iter()
            .map(|(_, id, method)| interrupted_response(id, &method, timestamp_ms))
            .collect()
    }

    /// Drop entries older than the maximum age. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let max_age = self.max_age;
        let mut state = self.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| now.saturating_duration_since(entry.received_at) <= max_age);
        before - state.entries.len()
    }

    /// Number of requests currently recorded.
    pub fn in_flight(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> AbortHandle {
        let notifier = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = notifier.sweep();
                        if removed > 0 {
                            debug!(removed, "swept stale in-flight requests");
                        }
                    }
                }
            }
        })
        .abort_handle()
    }

    fn lock(&self) -> MutexGuard<'_, NotifierState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl fmt::Debug for InterruptNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptNotifier")
            .field("max_age", &self.max_age)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

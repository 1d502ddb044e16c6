//! Per-request timeout tracking for client channels.
//!
//! Every outbound request gets a timer. If no response with the same id
//! arrives in time, a synthesized `-32000` error response is delivered in its
//! place and the id is remembered as expired so that a real response arriving
//! later can be suppressed. Each request therefore sees exactly one response.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ctxbridge_envelope::{timeout_response, Message, Request, RequestId};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of expired ids remembered for late-response suppression.
const EXPIRED_MEMORY: usize = 1024;

/// What a tracker knew about the id of an inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The request was pending; its timer has been cancelled.
    Answered,
    /// The request already timed out; the response must be dropped.
    Expired,
    /// The id was never tracked (or was cleared).
    Untracked,
}

struct Pending {
    method: String,
    timer: AbortHandle,
}

#[derive(Default)]
struct TrackerState {
    pending: HashMap<RequestId, Pending>,
    expired: HashSet<RequestId>,
    expired_order: VecDeque<RequestId>,
}

impl TrackerState {
    fn remember_expired(&mut self, id: RequestId) {
        if self.expired.insert(id.clone()) {
            self.expired_order.push_back(id);
        }
        while self.expired_order.len() > EXPIRED_MEMORY {
            if let Some(oldest) = self.expired_order.pop_front() {
                self.expired.remove(&oldest);
            }
        }
    }
}

/// Tracks pending requests and synthesizes timeout responses.
#[derive(Clone)]
pub struct RequestTimeoutTracker {
    timeout: Duration,
    state: Arc<Mutex<TrackerState>>,
}

impl RequestTimeoutTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Arc::new(Mutex::new(TrackerState::default())),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start the timer for `request`.
    ///
    /// If it fires before [`resolve`](Self::resolve) is called for the same
    /// id, `deliver` receives the synthesized timeout response. Tracking an id
    /// that is already pending restarts its timer.
    pub fn track(&self, request: &Request, deliver: impl FnOnce(Message) + Send + 'static) {
        let id = request.id.clone();
        let timeout = self.timeout;
        let state = Arc::clone(&self.state);

        // The lock is held across spawn so the entry exists before the timer can look for it.
        let mut guard = self.lock();
        let timer = tokio::spawn({
            let id = id.clone();
            async move {
                tokio::time::sleep(timeout).await;
                let method = {
                    let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
                    let Some(entry) = state.pending.remove(&id) else {
                        return;
                    };
                    state.remember_expired(id.clone());
                    entry.method
                };
                warn!(%id, %method, timeout_ms = timeout.as_millis() as u64, "request timed out");
                deliver(timeout_response(id, timeout, Some(&method)));
            }
        })
        .abort_handle();

        if guard.expired.remove(&id) {
            guard.expired_order.retain(|expired| expired != &id);
        }
        if let Some(previous) = guard.pending.insert(
            id.clone(),
            Pending {
                method: request.method.clone(),
                timer,
            },
        ) {
            debug!(%id, "request id reused while pending; restarting timer");
            previous.timer.abort();
        }
    }

    /// Record that a response for `id` arrived.
    pub fn resolve(&self, id: &RequestId) -> Resolution {
        let mut state = self.lock();
        if let Some(entry) = state.pending.remove(id) {
            entry.timer.abort();
            return Resolution::Answered;
        }
        // Expired ids stay until they age out, so duplicates are dropped too.
        if state.expired.contains(id) {
            return Resolution::Expired;
        }
        Resolution::Untracked
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Cancel every timer and forget all state.
    pub fn clear(&self) {
        let mut state = self.lock();
        for (_, entry) in state.pending.drain() {
            entry.timer.abort();
        }
        state.expired.clear();
        state.expired_order.clear();
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl fmt::Debug for RequestTimeoutTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("RequestTimeoutTracker")
            .field("timeout", &self.timeout)
            .field("pending", &state.pending.len())
            .field("expired", &state.expired.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use ctxbridge_envelope::TIMEOUT_ERROR_CODE;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    fn request(id: i64, method: &str) -> Request {
        match Message::request(id, method, None) {
            Message::Request(request) => request,
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn synthesizes_timeout_and_suppresses_late_response() {
        let tracker = RequestTimeoutTracker::new(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();

        tracker.track(&request(1, "x"), move |msg| {
            let _ = tx.send(msg);
        });
        assert_eq!(tracker.pending_count(), 1);

        let msg = rx.recv().await.unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.id, RequestId::Number(1));
        let err = resp.error().unwrap();
        assert_eq!(err.code, TIMEOUT_ERROR_CODE);
        assert_eq!(
            err.data,
            Some(json!({"timeoutMs": 50, "originalMethod": "x"}))
        );

        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.resolve(&RequestId::Number(1)), Resolution::Expired);
        assert_eq!(tracker.resolve(&RequestId::Number(1)), Resolution::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn reused_id_is_tracked_again_after_expiry() {
        let tracker = RequestTimeoutTracker::new(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = tx.clone();
        tracker.track(&request(4, "a"), move |msg| {
            let _ = first.send(msg);
        });
        rx.recv().await.unwrap();
        assert_eq!(tracker.resolve(&RequestId::Number(4)), Resolution::Expired);

        tracker.track(&request(4, "b"), move |msg| {
            let _ = tx.send(msg);
        });
        assert_eq!(tracker.resolve(&RequestId::Number(4)), Resolution::Answered);
        assert_eq!(tracker.resolve(&RequestId::Number(4)), Resolution::Untracked);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_request_never_times_out() {
        let tracker = RequestTimeoutTracker::new(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();

        tracker.track(&request(2, "y"), move |msg| {
            let _ = tx.send(msg);
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.resolve(&RequestId::Number(2)), Resolution::Answered);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_all_timers() {
        let tracker = RequestTimeoutTracker::new(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        for id in 0..3 {
            let tx = tx.clone();
            tracker.track(&request(id, "z"), move |msg| {
                let _ = tx.send(msg);
            });
        }
        tracker.clear();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn expired_memory_is_bounded() {
        let mut state = TrackerState::default();
        for id in 0..(EXPIRED_MEMORY as i64 + 10) {
            state.remember_expired(RequestId::Number(id));
        }
        assert_eq!(state.expired.len(), EXPIRED_MEMORY);
        assert!(!state.expired.contains(&RequestId::Number(0)));
        assert!(state.expired.contains(&RequestId::Number(EXPIRED_MEMORY as i64 + 9)));
    }
}

//! Window messaging model.
//!
//! A [`Window`] is a message target with an origin, matching `postMessage`
//! semantics: a message posted with a `target_origin` that is neither `*` nor
//! the window's own origin is dropped, every listener of the window sees every
//! delivered message, and delivery is asynchronous but FIFO per window.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::listeners::{ObserverList, Subscription};

/// Target/allowed origin that matches every origin.
pub const WILDCARD_ORIGIN: &str = "*";

/// A message delivered to a window listener.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    /// Origin of the sending context.
    pub origin: String,
    /// Structured-clone payload.
    pub data: Value,
}

struct WindowInner {
    origin: String,
    listeners: ObserverList<MessageEvent>,
    unload_hooks: ObserverList<()>,
    queue: OnceLock<mpsc::UnboundedSender<MessageEvent>>,
}

/// A browsing context that can receive posted messages.
///
/// Cloning a `Window` yields another handle to the same context.
#[derive(Clone)]
pub struct Window {
    inner: Arc<WindowInner>,
}

impl Window {
    /// Create a window with the given origin (e.g. `https://app.example`).
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(WindowInner {
                origin: origin.into(),
                listeners: ObserverList::new(),
                unload_hooks: ObserverList::new(),
                queue: OnceLock::new(),
            }),
        }
    }

    /// Origin of this window.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Post a message to this window.
    ///
    /// `sender_origin` becomes [`MessageEvent::origin`]. Returns false when the
    /// message was dropped because `target_origin` does not match this window.
    /// Must be called from within a Tokio runtime.
    pub fn post_message(&self, data: Value, target_origin: &str, sender_origin: &str) -> bool {
        if target_origin != WILDCARD_ORIGIN && target_origin != self.inner.origin {
            trace!(
                target_origin,
                window_origin = %self.inner.origin,
                "dropping message for mismatched target origin"
            );
            return false;
        }

        let event = MessageEvent {
            origin: sender_origin.to_string(),
            data,
        };
        self.dispatcher().send(event).is_ok()
    }

    /// Register a message listener.
    pub fn add_listener(
        &self,
        listener: impl Fn(&MessageEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.subscribe(listener)
    }

    /// Number of registered message listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Register a hook that runs synchronously when the window unloads.
    pub fn on_before_unload(&self, hook: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.unload_hooks.subscribe(move |_| hook())
    }

    /// Number of registered unload hooks.
    pub fn unload_hook_count(&self) -> usize {
        self.inner.unload_hooks.len()
    }

    /// Fire every unload hook synchronously, in registration order.
    ///
    /// Messages posted by the hooks are queued before this returns.
    pub fn unload(&self) {
        let fired = self.inner.unload_hooks.emit(&());
        trace!(origin = %self.inner.origin, hooks = fired, "window unload");
    }

    fn dispatcher(&self) -> &mpsc::UnboundedSender<MessageEvent> {
        self.inner.queue.get_or_init(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<MessageEvent>();
            let listeners = self.inner.listeners.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    listeners.emit(&event);
                }
            });
            tx
        })
    }
}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
            .field("origin", &self.inner.origin)
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

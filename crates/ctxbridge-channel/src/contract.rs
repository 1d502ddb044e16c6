//! The channel contract shared by every concrete channel.
//!
//! A channel moves JSON-RPC [`Message`]s between two contexts. Its lifecycle
//! is strictly `Unstarted -> Started -> Closed`:
//! - `start` succeeds once; a second call fails with
//!   [`ChannelError::AlreadyStarted`]
//! - `send` fails with [`ChannelError::NotStarted`] outside `Started`
//! - `close` is idempotent and fires `on_close` at most once
//!
//! Inbound messages, asynchronous errors and closure are reported through the
//! three callback slots held in [`Callbacks`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ctxbridge_envelope::{Direction, Message};
use tracing::{debug, trace};

use crate::error::{ChannelError, Result};

/// Callback invoked for every accepted inbound message.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;
/// Callback invoked for asynchronous channel errors.
pub type ErrorHandler = Arc<dyn Fn(ChannelError) + Send + Sync>;
/// Callback invoked once when the channel closes.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Which end of a conversation a channel plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Direction stamped on envelopes this role sends.
    pub fn outbound(self) -> Direction {
        match self {
            Role::Client => Direction::ClientToServer,
            Role::Server => Direction::ServerToClient,
        }
    }

    /// Direction this role accepts on inbound envelopes.
    pub fn inbound(self) -> Direction {
        self.outbound().reverse()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Unstarted,
    Started,
    Closed,
}

const UNSTARTED: u8 = 0;
const STARTED: u8 = 1;
const CLOSED: u8 = 2;

fn decode_state(raw: u8) -> TransportState {
    match raw {
        UNSTARTED => TransportState::Unstarted,
        STARTED => TransportState::Started,
        _ => TransportState::Closed,
    }
}

/// Atomic lifecycle state machine.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    /// A lifecycle in the `Unstarted` state.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(UNSTARTED),
        }
    }

    /// Current state.
    pub fn state(&self) -> TransportState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    /// Returns true while in `Started`.
    pub fn is_started(&self) -> bool {
        self.state() == TransportState::Started
    }

    /// Transition `Unstarted -> Started`.
    pub fn begin_start(&self) -> Result<()> {
        match self
            .state
            .compare_exchange(UNSTARTED, STARTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(STARTED) => Err(ChannelError::AlreadyStarted),
            Err(_) => Err(ChannelError::Closed),
        }
    }

    /// Fail with [`ChannelError::NotStarted`] unless in `Started`.
    pub fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(ChannelError::NotStarted)
        }
    }

    /// Move to `Closed`, returning the state it was in before.
    ///
    /// Only the call that observes a non-`Closed` previous state should run
    /// teardown.
    pub fn begin_close(&self) -> TransportState {
        decode_state(self.state.swap(CLOSED, Ordering::AcqRel))
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// The three callback slots of a channel.
///
/// Slots may be set or replaced at any time; an event with no handler is
/// dropped. `on_close` fires at most once per channel.
#[derive(Default)]
pub struct Callbacks {
    on_message: RwLock<Option<MessageHandler>>,
    on_error: RwLock<Option<ErrorHandler>>,
    on_close: RwLock<Option<CloseHandler>>,
    closed: AtomicBool,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_message(&self, handler: impl Fn(Message) + Send + Sync + 'static) {
        *write(&self.on_message) = Some(Arc::new(handler));
    }

    pub fn set_on_error(&self, handler: impl Fn(ChannelError) + Send + Sync + 'static) {
        *write(&self.on_error) = Some(Arc::new(handler));
    }

    pub fn set_on_close(&self, handler: impl Fn() + Send + Sync + 'static) {
        *write(&self.on_close) = Some(Arc::new(handler));
    }

    /// Hand a message to `on_message`.
    pub fn emit_message(&self, message: Message) {
        let handler = read(&self.on_message).clone();
        match handler {
            Some(handler) => handler(message),
            None => trace!("no on_message handler; dropping message"),
        }
    }

    /// Hand an error to `on_error`.
    pub fn emit_error(&self, error: ChannelError) {
        let handler = read(&self.on_error).clone();
        match handler {
            Some(handler) => handler(error),
            None => debug!(%error, "unhandled channel error"),
        }
    }

    /// Fire `on_close` unless it already fired. Returns true if this call fired it.
    pub fn emit_close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let handler = read(&self.on_close).clone();
        if let Some(handler) = handler {
            handler();
        }
        true
    }

    /// Returns true once `on_close` has fired.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_message", &read(&self.on_message).is_some())
            .field("on_error", &read(&self.on_error).is_some())
            .field("on_close", &read(&self.on_close).is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A bidirectional JSON-RPC message channel between two contexts.
pub trait Channel: Send + Sync {
    /// Begin listening and, for clients, start the readiness handshake.
    fn start(&self) -> impl Future<Output = Result<()>> + Send;

    /// Send a message to the peer.
    ///
    /// Clients wait for the peer to be ready before transmitting.
    fn send(&self, message: Message) -> impl Future<Output = Result<()>> + Send;

    /// Stop the channel and release everything it holds. Idempotent.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;

    /// The callback slots of this channel.
    fn callbacks(&self) -> &Callbacks;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// Replace the `on_message` handler.
    fn set_on_message(&self, handler: impl Fn(Message) + Send + Sync + 'static) {
        self.callbacks().set_on_message(handler);
    }

    /// Replace the `on_error` handler.
    fn set_on_error(&self, handler: impl Fn(ChannelError) + Send + Sync + 'static) {
        self.callbacks().set_on_error(handler);
    }

    /// Replace the `on_close` handler.
    fn set_on_close(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.callbacks().set_on_close(handler);
    }
}

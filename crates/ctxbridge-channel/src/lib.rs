//! Cross-context JSON-RPC channels.
//!
//! Every channel implements the [`Channel`] contract (`start` / `send` /
//! `close` plus message, error and close callbacks) over one medium:
//! - [`WindowChannel`]: window `postMessage`, same-window or parent/iframe
//! - [`PortClientChannel`] / [`PortServerChannel`] / [`ExtensionHost`]:
//!   runtime ports in the extension and user-script worlds
//! - [`StreamChannel`]: newline-delimited JSON over child-process stdio
//!
//! The reliability pieces they are assembled from are public too: the
//! readiness handshake, request timeouts, interrupt notification on unload,
//! reconnection backoff, write backpressure, inbound filtering, and the peer
//! registry.

use std::sync::{Mutex, MutexGuard};

mod client;

pub mod backpressure;
pub mod contract;
pub mod error;
pub mod filter;
pub mod handshake;
pub mod interrupt;
pub mod port;
pub mod ready;
pub mod reconnect;
pub mod registry;
pub mod stream;
pub mod timeout;
pub mod window;

pub use backpressure::BackpressureController;
pub use contract::{
    Callbacks, Channel, CloseHandler, ErrorHandler, Lifecycle, MessageHandler, Role,
    TransportState,
};
pub use error::{ChannelError, Result};
pub use filter::InboundFilter;
pub use handshake::{HandshakeConfig, ReadinessProbe};
pub use interrupt::InterruptNotifier;
pub use port::{
    ExtensionHost, PortClientChannel, PortClientConfig, PortServerChannel, PortServerConfig,
};
pub use ready::ReadySignal;
pub use reconnect::{ReconnectPolicy, Reconnector};
pub use registry::{PeerRegistry, WeakPeerRegistry};
pub use stream::{StreamChannel, StreamChannelConfig};
pub use timeout::{RequestTimeoutTracker, Resolution};
pub use window::{WindowChannel, WindowChannelConfig};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

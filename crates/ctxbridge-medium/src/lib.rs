//! Delivery primitives that ctxbridge channels are built on.
//!
//! Each primitive models one cross-context medium with its own delivery
//! semantics:
//! - [`Window`]: broadcast, origin-tagged, asynchronous `postMessage` target
//!   with best-effort unload hooks
//! - [`PortHub`] / [`Port`]: named point-to-point runtime ports that can
//!   disconnect underneath their users (extension and user-script worlds)
//! - [`ChildProcess`]: a spawned child whose stdin/stdout carry a byte stream
//!
//! This is the lowest layer of ctxbridge. Nothing here knows about envelopes
//! or JSON-RPC; payloads are opaque [`serde_json::Value`]s.

pub mod error;
pub mod listeners;
pub mod port;
pub mod process;
pub mod window;

pub use error::{MediumError, Result};
pub use listeners::{ObserverList, Subscription};
pub use port::{Port, PortHub, PortListener, PortSender, World};
pub use process::ChildProcess;
pub use window::{MessageEvent, Window, WILDCARD_ORIGIN};

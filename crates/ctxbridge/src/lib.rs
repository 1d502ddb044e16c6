//! JSON-RPC transport across isolated execution contexts.
//!
//! ctxbridge carries protocol messages between a client and a server that
//! live in different contexts: two scripts in one page, a page and an
//! embedded iframe, a page and an extension background, or a host process and
//! a tool server on stdio. Every channel shares one contract and the same
//! reliability pieces (readiness handshake, request timeouts, interrupt
//! responses on unload, reconnection, backpressure).
//!
//! # Crate Structure
//!
//! - [`medium`]: delivery primitives (window message bus, runtime ports, child processes)
//! - [`envelope`]: JSON-RPC message model, routing envelope, stream codec
//! - [`channel`]: the channel contract and every concrete channel

/// Re-export medium types.
pub mod medium {
    pub use ctxbridge_medium::*;
}

/// Re-export envelope types.
pub mod envelope {
    pub use ctxbridge_envelope::*;
}

/// Re-export channel types.
pub mod channel {
    pub use ctxbridge_channel::*;
}

//! JSON-RPC message model and routing envelope for ctxbridge.
//!
//! Every message crossing a broadcast-style medium is wrapped in an
//! [`Envelope`]:
//! - `channel`: the channel id both parties were configured with
//! - `type`: always `"mcp"`
//! - `direction`: `client-to-server` or `server-to-client`
//! - `payload`: a JSON-RPC [`Message`] or a bare [`ControlSignal`] string
//!
//! Stream-based media skip the envelope and carry one JSON message per line
//! (see [`codec`]).

pub mod codec;
pub mod envelope;
pub mod error;
pub mod message;
pub mod synthesized;

pub use codec::{encode_message, JsonLineCodec, DEFAULT_MAX_LINE};
pub use envelope::{ControlSignal, Direction, Envelope, EnvelopeKind, Payload, ENVELOPE_TYPE};
pub use error::{EnvelopeError, Result};
pub use message::{
    Message, Notification, Outcome, Request, RequestId, Response, RpcError, JSONRPC_VERSION,
};
pub use synthesized::{
    interrupted_response, timeout_response, INTERRUPTED_TEXT, TIMEOUT_ERROR_CODE, TIMEOUT_MESSAGE,
};

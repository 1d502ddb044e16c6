//! Channels over window `postMessage`.
//!
//! Four configurations share one implementation:
//!
//! | Constructor                     | Role   | Listens on | Posts to |
//! |---------------------------------|--------|------------|----------|
//! | [`WindowChannel::tab_client`]   | client | tab        | tab      |
//! | [`WindowChannel::tab_server`]   | server | tab        | tab      |
//! | [`WindowChannel::iframe_parent`]| client | parent     | iframe   |
//! | [`WindowChannel::iframe_child`] | server | iframe     | parent   |
//!
//! Every message travels inside an [`Envelope`]. Since a window is a
//! broadcast medium, inbound traffic goes through an [`InboundFilter`] before
//! anything else looks at it. Servers answer in-flight requests with an
//! interrupt response when their window unloads.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ctxbridge_envelope::{ControlSignal, Envelope, Message, Payload};
use ctxbridge_medium::{MessageEvent, Subscription, Window};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientState;
use crate::contract::{Callbacks, Channel, Lifecycle, Role, TransportState};
use crate::error::{ChannelError, Result};
use crate::filter::InboundFilter;
use crate::handshake::HandshakeConfig;
use crate::interrupt::{InterruptNotifier, DEFAULT_MAX_REQUEST_AGE, DEFAULT_SWEEP_INTERVAL};
use crate::lock;
use crate::timeout::DEFAULT_REQUEST_TIMEOUT;

/// Default channel id of same-window channels.
pub const DEFAULT_TAB_CHANNEL: &str = "mcp-default";

/// Default channel id of iframe channels.
pub const DEFAULT_IFRAME_CHANNEL: &str = "mcp-iframe";

/// Configuration for [`WindowChannel`].
#[derive(Debug, Clone)]
pub struct WindowChannelConfig {
    /// Channel id stamped on and required of every envelope.
    pub channel_id: String,
    /// Origin messages are posted to. Required for tab clients and iframe
    /// children.
    pub target_origin: Option<String>,
    /// Origins accepted on inbound messages. Servers must set at least one
    /// entry; clients default to the target origin.
    pub allowed_origins: Vec<String>,
    /// Client request timeout. `None` disables timeouts.
    pub request_timeout: Option<Duration>,
    /// Readiness probe settings (clients).
    pub handshake: HandshakeConfig,
    /// Interval between stale in-flight request sweeps (servers).
    pub sweep_interval: Duration,
    /// Age after which an unanswered request is forgotten (servers).
    pub max_request_age: Duration,
}

impl Default for WindowChannelConfig {
    fn default() -> Self {
        Self::tab()
    }
}

impl WindowChannelConfig {
    /// Defaults for same-window channels.
    pub fn tab() -> Self {
        Self {
            channel_id: DEFAULT_TAB_CHANNEL.to_string(),
            target_origin: None,
            allowed_origins: Vec::new(),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            handshake: HandshakeConfig::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_request_age: DEFAULT_MAX_REQUEST_AGE,
        }
    }

    /// Defaults for parent/iframe channels.
    pub fn iframe() -> Self {
        Self {
            channel_id: DEFAULT_IFRAME_CHANNEL.to_string(),
            ..Self::tab()
        }
    }

    pub fn with_channel_id(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = channel_id.into();
        self
    }

    pub fn with_target_origin(mut self, origin: impl Into<String>) -> Self {
        self.target_origin = Some(origin.into());
        self
    }

    pub fn with_allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_sweep(mut self, interval: Duration, max_request_age: Duration) -> Self {
        self.sweep_interval = interval;
        self.max_request_age = max_request_age;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.channel_id.is_empty() {
            return Err(ChannelError::Config("channel id must not be empty".to_string()));
        }
        if self.request_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ChannelError::Config(
                "request timeout must be non-zero; use None to disable".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ChannelError::Config("sweep interval must be non-zero".to_string()));
        }
        self.handshake.validate()
    }

    fn require_target_origin(&self, what: &str) -> Result<String> {
        self.target_origin
            .clone()
            .ok_or_else(|| ChannelError::Config(format!("{what} requires a target origin")))
    }

    fn require_allowed_origins(&self, what: &str) -> Result<()> {
        if self.allowed_origins.is_empty() {
            return Err(ChannelError::Config(format!(
                "{what} requires at least one allowed origin"
            )));
        }
        Ok(())
    }
}

enum Side {
    Client(ClientState),
    Server {
        interrupts: InterruptNotifier,
        sweep_interval: Duration,
    },
}

struct WindowShared {
    role: Role,
    listen: Window,
    post: Window,
    target_origin: String,
    filter: InboundFilter,
    lifecycle: Lifecycle,
    callbacks: Callbacks,
    side: Side,
    cancel: CancellationToken,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// A channel over window `postMessage`.
pub struct WindowChannel {
    inner: Arc<WindowShared>,
}

impl WindowChannel {
    /// Client talking to a server in the same window.
    pub fn tab_client(window: Window, config: WindowChannelConfig) -> Result<Self> {
        let target = config.require_target_origin("tab client")?;
        Self::build(Role::Client, window.clone(), window, target, config)
    }

    /// Server answering clients in the same window.
    pub fn tab_server(window: Window, config: WindowChannelConfig) -> Result<Self> {
        config.require_allowed_origins("tab server")?;
        let target = config
            .target_origin
            .clone()
            .unwrap_or_else(|| window.origin().to_string());
        Self::build(Role::Server, window.clone(), window, target, config)
    }

    /// Client in a parent window talking to a server inside `iframe`.
    pub fn iframe_parent(
        parent: Window,
        iframe: Window,
        config: WindowChannelConfig,
    ) -> Result<Self> {
        let target = config
            .target_origin
            .clone()
            .unwrap_or_else(|| iframe.origin().to_string());
        Self::build(Role::Client, parent, iframe, target, config)
    }

    /// Server inside an iframe answering its parent window.
    pub fn iframe_child(iframe: Window, parent: Window, config: WindowChannelConfig) -> Result<Self> {
        config.require_allowed_origins("iframe child")?;
        let target = config.require_target_origin("iframe child")?;
        Self::build(Role::Server, iframe, parent, target, config)
    }

    fn build(
        role: Role,
        listen: Window,
        post: Window,
        target_origin: String,
        config: WindowChannelConfig,
    ) -> Result<Self> {
        config.validate()?;

        let allowed_origins = if config.allowed_origins.is_empty() {
            vec![target_origin.clone()]
        } else {
            config.allowed_origins.clone()
        };
        let filter = InboundFilter::new(config.channel_id.clone(), role.inbound(), allowed_origins);
        let side = match role {
            Role::Client => Side::Client(ClientState::new(&config.handshake, config.request_timeout)),
            Role::Server => Side::Server {
                interrupts: InterruptNotifier::new(config.max_request_age),
                sweep_interval: config.sweep_interval,
            },
        };

        Ok(Self {
            inner: Arc::new(WindowShared {
                role,
                listen,
                post,
                target_origin,
                filter,
                lifecycle: Lifecycle::new(),
                callbacks: Callbacks::new(),
                side,
                cancel: CancellationToken::new(),
                subscriptions: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn channel_id(&self) -> &str {
        self.inner.filter.channel_id()
    }

    /// Returns true once the server has been seen. Always false for servers.
    pub fn is_ready(&self) -> bool {
        match &self.inner.side {
            Side::Client(client) => client.ready.is_ready(),
            Side::Server { .. } => false,
        }
    }

    /// Requests a server has received and not yet answered.
    pub fn in_flight(&self) -> usize {
        match &self.inner.side {
            Side::Client(_) => 0,
            Side::Server { interrupts, .. } => interrupts.in_flight(),
        }
    }

    /// Requests a client is still waiting on.
    pub fn pending_requests(&self) -> usize {
        match &self.inner.side {
            Side::Client(client) => client
                .timeouts
                .as_ref()
                .map_or(0, |tracker| tracker.pending_count()),
            Side::Server { .. } => 0,
        }
    }
}

impl Channel for WindowChannel {
    async fn start(&self) -> Result<()> {
        self.inner.start()
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.inner.send(message).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close();
        Ok(())
    }

    fn callbacks(&self) -> &Callbacks {
        &self.inner.callbacks
    }

    fn state(&self) -> TransportState {
        self.inner.lifecycle.state()
    }
}

impl Drop for WindowChannel {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for WindowChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowChannel")
            .field("role", &self.inner.role)
            .field("channel", &self.inner.filter.channel_id())
            .field("listen", &self.inner.listen.origin())
            .field("target_origin", &self.inner.target_origin)
            .field("state", &self.inner.lifecycle.state())
            .finish()
    }
}

impl WindowShared {
    fn start(self: &Arc<Self>) -> Result<()> {
        self.lifecycle.begin_start()?;

        let weak = Arc::downgrade(self);
        let mut subscriptions = vec![self.listen.add_listener(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_event(event);
            }
        })];

        match &self.side {
            Side::Client(_) => self.restart_probe(),
            Side::Server {
                interrupts,
                sweep_interval,
            } => {
                let weak = Arc::downgrade(self);
                subscriptions.push(self.listen.on_before_unload(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.handle_unload();
                    }
                }));
                interrupts.spawn_sweeper(*sweep_interval, self.cancel.clone());
                self.post_control(ControlSignal::ServerReady);
            }
        }
        *lock(&self.subscriptions) = subscriptions;

        info!(
            role = %self.role,
            channel = %self.filter.channel_id(),
            origin = %self.listen.origin(),
            "window channel started"
        );
        Ok(())
    }

    async fn send(self: &Arc<Self>, message: Message) -> Result<()> {
        self.lifecycle.ensure_started()?;

        match &self.side {
            Side::Client(client) => {
                let weak = Arc::downgrade(self);
                let transmit = client
                    .prepare_send(&message, move |response| {
                        if let Some(shared) = weak.upgrade() {
                            shared.callbacks.emit_message(response);
                        }
                    })
                    .await?;
                if !transmit {
                    return Ok(());
                }
                self.lifecycle.ensure_started()?;
            }
            Side::Server { interrupts, .. } => {
                if let Message::Response(response) = &message {
                    if !interrupts.complete(&response.id) {
                        debug!(id = %response.id, "dropping response to an interrupted request");
                        return Ok(());
                    }
                }
            }
        }

        self.post_message(&message);
        Ok(())
    }

    fn close(&self) {
        let previous = self.lifecycle.begin_close();
        if previous == TransportState::Closed {
            return;
        }

        self.cancel.cancel();
        lock(&self.subscriptions).clear();
        match &self.side {
            Side::Client(client) => client.shutdown("channel closed"),
            Side::Server { interrupts, .. } => {
                if previous == TransportState::Started {
                    self.post_control(ControlSignal::ServerStopped);
                }
                interrupts.clear();
            }
        }

        debug!(role = %self.role, channel = %self.filter.channel_id(), "window channel closed");
        self.callbacks.emit_close();
    }

    fn handle_event(self: &Arc<Self>, event: &MessageEvent) {
        if !self.lifecycle.is_started() {
            return;
        }
        let Some(envelope) = self.filter.accept(Some(&event.origin), &event.data) else {
            return;
        };

        match envelope.parse_payload() {
            Ok(Payload::Control(signal)) => self.handle_control(signal),
            Ok(Payload::Message(message)) => self.handle_message(message),
            Err(err) => {
                warn!(channel = %self.filter.channel_id(), error = %err, "malformed envelope payload");
                self.callbacks.emit_error(err.into());
            }
        }
    }

    fn handle_control(self: &Arc<Self>, signal: ControlSignal) {
        match (&self.side, signal) {
            (Side::Client(client), ControlSignal::ServerReady) => {
                if client.ready.signal_ready() {
                    debug!(channel = %self.filter.channel_id(), "server ready");
                }
            }
            (Side::Client(client), ControlSignal::ServerStopped) => {
                info!(channel = %self.filter.channel_id(), "server stopped; waiting for it to return");
                client.ready.reset();
                self.restart_probe();
            }
            (Side::Server { .. }, ControlSignal::CheckReady) => {
                self.post_control(ControlSignal::ServerReady);
            }
            (_, signal) => {
                debug!(%signal, role = %self.role, "ignoring control signal");
            }
        }
    }

    fn handle_message(&self, message: Message) {
        match &self.side {
            Side::Client(client) => {
                if let Some(message) = client.accept_inbound(message) {
                    self.callbacks.emit_message(message);
                }
            }
            Side::Server { interrupts, .. } => {
                if let Message::Request(request) = &message {
                    interrupts.record(request);
                }
                self.callbacks.emit_message(message);
            }
        }
    }

    fn handle_unload(&self) {
        let Side::Server { interrupts, .. } = &self.side else {
            return;
        };
        if !self.lifecycle.is_started() {
            return;
        }

        let responses = interrupts.interrupt_all();
        info!(
            channel = %self.filter.channel_id(),
            interrupted = responses.len(),
            "window unloading; interrupting in-flight requests"
        );
        for response in &responses {
            self.post_message(response);
        }
        self.post_control(ControlSignal::ServerStopped);
    }

    fn restart_probe(self: &Arc<Self>) {
        let Side::Client(client) = &self.side else {
            return;
        };
        let weak = Arc::downgrade(self);
        client
            .probe
            .restart(client.ready.clone(), self.cancel.clone(), move || {
                if let Some(shared) = weak.upgrade() {
                    shared.post_control(ControlSignal::CheckReady);
                }
            });
    }

    fn post_control(&self, signal: ControlSignal) {
        let envelope = Envelope::control(self.filter.channel_id(), self.role.outbound(), signal);
        self.post(envelope);
    }

    fn post_message(&self, message: &Message) {
        let envelope = Envelope::message(self.filter.channel_id(), self.role.outbound(), message);
        self.post(envelope);
    }

    fn post(&self, envelope: Envelope) {
        let delivered = self.post.post_message(
            envelope.to_value(),
            &self.target_origin,
            self.listen.origin(),
        );
        if !delivered {
            debug!(
                target_origin = %self.target_origin,
                window = %self.post.origin(),
                "post dropped by target window"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = "https://app.example";

    #[test]
    fn tab_client_requires_target_origin() {
        let err = WindowChannel::tab_client(Window::new(APP), WindowChannelConfig::tab()).unwrap_err();
        assert!(matches!(err, ChannelError::Config(_)));
    }

    #[test]
    fn servers_require_allowed_origins() {
        let err = WindowChannel::tab_server(Window::new(APP), WindowChannelConfig::tab()).unwrap_err();
        assert!(matches!(err, ChannelError::Config(_)));

        let err = WindowChannel::iframe_child(
            Window::new("https://widget.example"),
            Window::new(APP),
            WindowChannelConfig::iframe().with_target_origin(APP),
        )
        .unwrap_err();
        assert!(matches!(err, ChannelError::Config(_)));
    }

    #[test]
    fn iframe_child_requires_target_origin() {
        let err = WindowChannel::iframe_child(
            Window::new("https://widget.example"),
            Window::new(APP),
            WindowChannelConfig::iframe().with_allowed_origins([APP]),
        )
        .unwrap_err();
        assert!(matches!(err, ChannelError::Config(_)));
    }

    #[test]
    fn zero_request_timeout_rejected() {
        let config = WindowChannelConfig::tab()
            .with_target_origin(APP)
            .with_request_timeout(Some(Duration::ZERO));
        assert!(matches!(
            WindowChannel::tab_client(Window::new(APP), config),
            Err(ChannelError::Config(_))
        ));
    }

    #[test]
    fn defaults_per_flavour() {
        assert_eq!(WindowChannelConfig::tab().channel_id, DEFAULT_TAB_CHANNEL);
        assert_eq!(WindowChannelConfig::iframe().channel_id, DEFAULT_IFRAME_CHANNEL);
        assert_eq!(
            WindowChannelConfig::default().request_timeout,
            Some(DEFAULT_REQUEST_TIMEOUT)
        );
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        let window = Window::new(APP);
        let client = WindowChannel::tab_client(
            window,
            WindowChannelConfig::tab().with_target_origin(APP),
        )
        .unwrap();

        assert!(matches!(
            client.send(Message::notification("x", None)).await,
            Err(ChannelError::NotStarted)
        ));
        client.start().await.unwrap();
        assert!(matches!(client.start().await, Err(ChannelError::AlreadyStarted)));

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state(), TransportState::Closed);
        assert!(matches!(
            client.send(Message::notification("x", None)).await,
            Err(ChannelError::NotStarted)
        ));
        assert!(matches!(client.start().await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn close_releases_window_listeners() {
        let window = Window::new(APP);
        let server = WindowChannel::tab_server(
            window.clone(),
            WindowChannelConfig::tab().with_allowed_origins([APP]),
        )
        .unwrap();
        server.start().await.unwrap();
        assert_eq!(window.listener_count(), 1);
        assert_eq!(window.unload_hook_count(), 1);

        server.close().await.unwrap();
        assert_eq!(window.listener_count(), 0);
        assert_eq!(window.unload_hook_count(), 0);
    }
}

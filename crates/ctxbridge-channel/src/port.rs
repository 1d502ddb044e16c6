//! Channels over runtime ports.
//!
//! A [`PortClientChannel`] lives in a page, content script or user script and
//! connects to a named listener through a [`PortHub`]. Ports can disappear
//! underneath it at any time (the background worker restarts, the runtime
//! reloads), so the client reconnects with exponential backoff, repeats the
//! readiness handshake on every new port, and optionally re-probes the server
//! on an interval while connected.
//!
//! The other end is an [`ExtensionHost`]: it accepts ports and wraps each in
//! a [`PortServerChannel`], keeping them in a [`PeerRegistry`] keyed by port
//! id until the port disconnects. A server channel's lifetime is its port's;
//! a disconnect closes it for good.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ctxbridge_envelope::{ControlSignal, Envelope, Message, Payload};
use ctxbridge_medium::{Port, PortHub, PortListener, Subscription, World, WILDCARD_ORIGIN};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientState;
use crate::contract::{Callbacks, Channel, Lifecycle, Role, TransportState};
use crate::error::{ChannelError, Result};
use crate::filter::InboundFilter;
use crate::handshake::{spawn_keep_alive, HandshakeConfig};
use crate::lock;
use crate::reconnect::{ReconnectPolicy, Reconnector};
use crate::registry::{PeerRegistry, WeakPeerRegistry};
use crate::timeout::DEFAULT_REQUEST_TIMEOUT;

/// Default port name for extension-world clients.
pub const DEFAULT_EXTENSION_PORT: &str = "mcp-extension";

/// Default port name for user-script-world clients.
pub const DEFAULT_USER_SCRIPT_PORT: &str = "mcp-userscript";

/// Default interval between keep-alive probes.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Configuration for [`PortClientChannel`].
#[derive(Debug, Clone)]
pub struct PortClientConfig {
    /// Port name to connect to. Also used as the envelope channel id.
    pub port_name: String,
    /// Origin reported to the host, if the connecting context has one.
    pub origin: Option<String>,
    /// Request timeout. `None` disables timeouts.
    pub request_timeout: Option<Duration>,
    /// Reconnection backoff.
    pub reconnect: ReconnectPolicy,
    /// Re-probe the server periodically while connected.
    pub keep_alive: bool,
    /// Interval between keep-alive probes.
    pub keep_alive_interval: Duration,
    /// Readiness probe settings.
    pub handshake: HandshakeConfig,
}

impl Default for PortClientConfig {
    fn default() -> Self {
        Self::extension()
    }
}

impl PortClientConfig {
    /// Defaults for extension-world clients.
    pub fn extension() -> Self {
        Self {
            port_name: DEFAULT_EXTENSION_PORT.to_string(),
            origin: None,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            reconnect: ReconnectPolicy::default(),
            keep_alive: true,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            handshake: HandshakeConfig::default(),
        }
    }

    /// Defaults for user-script-world clients.
    pub fn user_script() -> Self {
        Self {
            port_name: DEFAULT_USER_SCRIPT_PORT.to_string(),
            ..Self::extension()
        }
    }

    pub fn with_port_name(mut self, port_name: impl Into<String>) -> Self {
        self.port_name = port_name.into();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool, interval: Duration) -> Self {
        self.keep_alive = keep_alive;
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.port_name.is_empty() {
            return Err(ChannelError::Config("port name must not be empty".to_string()));
        }
        if self.request_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ChannelError::Config(
                "request timeout must be non-zero; use None to disable".to_string(),
            ));
        }
        if self.keep_alive && self.keep_alive_interval.is_zero() {
            return Err(ChannelError::Config(
                "keep-alive interval must be non-zero".to_string(),
            ));
        }
        self.reconnect.validate()?;
        self.handshake.validate()
    }
}

struct Connection {
    port: Port,
    generation: u64,
    _subscriptions: [Subscription; 2],
}

enum PostOutcome {
    Sent,
    Failed(u64),
    NoPort,
}

struct PortClientShared {
    hub: PortHub,
    world: World,
    origin: Option<String>,
    keep_alive: Option<Duration>,
    filter: InboundFilter,
    lifecycle: Lifecycle,
    callbacks: Callbacks,
    client: ClientState,
    cancel: CancellationToken,
    connection: Mutex<Option<Connection>>,
    generation: AtomicU64,
    reconnector: Mutex<Reconnector>,
}

/// Client channel over a runtime port, with automatic reconnection.
pub struct PortClientChannel {
    inner: Arc<PortClientShared>,
}

impl PortClientChannel {
    /// Client in the extension world (pages, content scripts).
    pub fn extension(hub: PortHub, config: PortClientConfig) -> Result<Self> {
        Self::build(hub, World::Extension, config)
    }

    /// Client in the user-script world.
    pub fn user_script(hub: PortHub, config: PortClientConfig) -> Result<Self> {
        Self::build(hub, World::UserScript, config)
    }

    fn build(hub: PortHub, world: World, config: PortClientConfig) -> Result<Self> {
        config.validate()?;
        let filter = InboundFilter::new(
            config.port_name.clone(),
            Role::Client.inbound(),
            vec![WILDCARD_ORIGIN.to_string()],
        );

        Ok(Self {
            inner: Arc::new(PortClientShared {
                hub,
                world,
                origin: config.origin.clone(),
                keep_alive: config.keep_alive.then_some(config.keep_alive_interval),
                filter,
                lifecycle: Lifecycle::new(),
                callbacks: Callbacks::new(),
                client: ClientState::new(&config.handshake, config.request_timeout),
                cancel: CancellationToken::new(),
                connection: Mutex::new(None),
                generation: AtomicU64::new(0),
                reconnector: Mutex::new(Reconnector::new(config.reconnect)),
            }),
        })
    }

    pub fn port_name(&self) -> &str {
        self.inner.filter.channel_id()
    }

    pub fn world(&self) -> World {
        self.inner.world
    }

    /// Returns true once the server has answered on the current port.
    pub fn is_ready(&self) -> bool {
        self.inner.client.ready.is_ready()
    }

    /// Returns true while a port is attached and still connected.
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.connection)
            .as_ref()
            .is_some_and(|connection| connection.port.is_connected())
    }

    /// Ports opened so far, the initial connection included.
    pub fn connections(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Reconnect attempts since the server was last seen.
    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.reconnector).attempts()
    }
}

impl Channel for PortClientChannel {
    async fn start(&self) -> Result<()> {
        self.inner.start()
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.inner.send(message).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.shutdown("channel closed");
        Ok(())
    }

    fn callbacks(&self) -> &Callbacks {
        &self.inner.callbacks
    }

    fn state(&self) -> TransportState {
        self.inner.lifecycle.state()
    }
}

impl Drop for PortClientChannel {
    fn drop(&mut self) {
        self.inner.shutdown("channel dropped");
    }
}

impl fmt::Debug for PortClientChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortClientChannel")
            .field("port_name", &self.inner.filter.channel_id())
            .field("world", &self.inner.world)
            .field("state", &self.inner.lifecycle.state())
            .field("connections", &self.connections())
            .finish()
    }
}

impl PortClientShared {
    fn start(self: &Arc<Self>) -> Result<()> {
        self.lifecycle.begin_start()?;
        info!(
            port = %self.filter.channel_id(),
            world = ?self.world,
            "port client starting"
        );

        self.connect();

        if let Some(interval) = self.keep_alive {
            let weak = Arc::downgrade(self);
            spawn_keep_alive(interval, self.cancel.clone(), move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if shared.client.ready.is_ready() {
                    shared.post_control(ControlSignal::CheckReady);
                }
            });
        }
        Ok(())
    }

    fn connect(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let port = self
            .hub
            .connect(self.filter.channel_id(), self.world, self.origin.as_deref());

        let weak = Arc::downgrade(self);
        let on_message = port.on_message(move |value| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_value(generation, value);
            }
        });
        let weak = Arc::downgrade(self);
        let on_disconnect = port.on_disconnect(move || {
            if let Some(shared) = weak.upgrade() {
                shared.handle_disconnect(generation);
            }
        });

        let connected = port.is_connected();
        let previous = lock(&self.connection).replace(Connection {
            port,
            generation,
            _subscriptions: [on_message, on_disconnect],
        });
        drop(previous);
        debug!(port = %self.filter.channel_id(), generation, "port opened");

        if connected {
            self.restart_probe();
        } else {
            // The runtime refused the port before our listeners were attached.
            self.handle_disconnect(generation);
        }
    }

    fn handle_disconnect(self: &Arc<Self>, generation: u64) {
        let detached = {
            let mut connection = lock(&self.connection);
            if !connection
                .as_ref()
                .is_some_and(|current| current.generation == generation)
            {
                return;
            }
            connection.take()
        };
        drop(detached);

        if !self.lifecycle.is_started() {
            return;
        }
        self.client.ready.reset();
        self.client.probe.stop();

        let (delay, attempt, auto_reconnect) = {
            let mut reconnector = lock(&self.reconnector);
            (
                reconnector.next_delay(),
                reconnector.attempts(),
                reconnector.policy().auto_reconnect,
            )
        };
        let Some(delay) = delay else {
            if auto_reconnect {
                warn!(port = %self.filter.channel_id(), attempts = attempt, "port disconnected; giving up");
                self.callbacks.emit_error(ChannelError::ReconnectExhausted(attempt));
            } else {
                warn!(port = %self.filter.channel_id(), "port disconnected; not reconnecting");
            }
            self.shutdown("port disconnected");
            return;
        };

        info!(
            port = %self.filter.channel_id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "port disconnected; scheduling reconnect"
        );
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(shared) = weak.upgrade() {
                        if shared.lifecycle.is_started() {
                            shared.connect();
                        }
                    }
                }
            }
        });
    }

    fn handle_value(self: &Arc<Self>, generation: u64, value: &Value) {
        if !self.lifecycle.is_started() || self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        let Some(envelope) = self.filter.accept(None, value) else {
            return;
        };

        match envelope.parse_payload() {
            Ok(Payload::Control(ControlSignal::ServerReady)) => {
                lock(&self.reconnector).reset();
                if self.client.ready.signal_ready() {
                    debug!(port = %self.filter.channel_id(), generation, "server ready");
                }
            }
            Ok(Payload::Control(ControlSignal::ServerStopped)) => {
                info!(port = %self.filter.channel_id(), "server stopped; waiting for it to return");
                self.client.ready.reset();
                self.restart_probe();
            }
            Ok(Payload::Control(signal)) => {
                debug!(%signal, "ignoring control signal");
            }
            Ok(Payload::Message(message)) => {
                lock(&self.reconnector).reset();
                if let Some(message) = self.client.accept_inbound(message) {
                    self.callbacks.emit_message(message);
                }
            }
            Err(err) => {
                warn!(port = %self.filter.channel_id(), error = %err, "malformed envelope payload");
                self.callbacks.emit_error(err.into());
            }
        }
    }

    async fn send(self: &Arc<Self>, message: Message) -> Result<()> {
        self.lifecycle.ensure_started()?;

        let weak = Arc::downgrade(self);
        let transmit = self
            .client
            .prepare_send(&message, move |response| {
                if let Some(shared) = weak.upgrade() {
                    shared.callbacks.emit_message(response);
                }
            })
            .await?;
        if !transmit {
            return Ok(());
        }

        let envelope =
            Envelope::message(self.filter.channel_id(), Role::Client.outbound(), &message).to_value();
        loop {
            self.lifecycle.ensure_started()?;
            match self.post(envelope.clone()) {
                PostOutcome::Sent => return Ok(()),
                PostOutcome::Failed(generation) => {
                    debug!(port = %self.filter.channel_id(), "port went away during send; waiting for reconnect");
                    self.handle_disconnect(generation);
                }
                PostOutcome::NoPort => tokio::task::yield_now().await,
            }
            self.client.ready.wait().await?;
        }
    }

    fn shutdown(&self, reason: &str) {
        if self.lifecycle.begin_close() == TransportState::Closed {
            return;
        }

        self.cancel.cancel();
        self.client.shutdown(reason);
        let detached = lock(&self.connection).take();
        if let Some(connection) = detached {
            connection.port.disconnect();
        }

        debug!(port = %self.filter.channel_id(), reason, "port client closed");
        self.callbacks.emit_close();
    }

    fn restart_probe(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.client
            .probe
            .restart(self.client.ready.clone(), self.cancel.clone(), move || {
                if let Some(shared) = weak.upgrade() {
                    shared.post_control(ControlSignal::CheckReady);
                }
            });
    }

    fn post_control(&self, signal: ControlSignal) {
        let envelope = Envelope::control(self.filter.channel_id(), Role::Client.outbound(), signal);
        // A failed probe is followed by the disconnect notification.
        let _ = self.post(envelope.to_value());
    }

    fn post(&self, value: Value) -> PostOutcome {
        let connection = lock(&self.connection);
        let Some(connection) = connection.as_ref() else {
            return PostOutcome::NoPort;
        };
        match connection.port.post_message(value) {
            Ok(()) => PostOutcome::Sent,
            Err(_) => PostOutcome::Failed(connection.generation),
        }
    }
}

/// Configuration for [`PortServerChannel`] and [`ExtensionHost`].
#[derive(Debug, Clone)]
pub struct PortServerConfig {
    /// Envelope channel id. Defaults to the port name.
    pub channel_id: Option<String>,
    /// Origins of connecting contexts that are served.
    pub allowed_origins: Vec<String>,
}

impl Default for PortServerConfig {
    fn default() -> Self {
        Self {
            channel_id: None,
            allowed_origins: vec![WILDCARD_ORIGIN.to_string()],
        }
    }
}

impl PortServerConfig {
    pub fn with_channel_id(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
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
}

struct PortServerShared {
    port: Port,
    filter: InboundFilter,
    lifecycle: Lifecycle,
    callbacks: Callbacks,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Server channel over one accepted port.
pub struct PortServerChannel {
    inner: Arc<PortServerShared>,
}

impl PortServerChannel {
    pub fn new(port: Port, config: PortServerConfig) -> Result<Self> {
        if config.allowed_origins.is_empty() {
            return Err(ChannelError::Config(
                "port server requires at least one allowed origin".to_string(),
            ));
        }
        let channel_id = config
            .channel_id
            .unwrap_or_else(|| port.name().to_string());
        let filter = InboundFilter::new(channel_id, Role::Server.inbound(), config.allowed_origins);

        Ok(Self {
            inner: Arc::new(PortServerShared {
                port,
                filter,
                lifecycle: Lifecycle::new(),
                callbacks: Callbacks::new(),
                subscriptions: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Hub-assigned id of the underlying port.
    pub fn port_id(&self) -> u64 {
        self.inner.port.sender().port_id
    }

    /// The port this channel serves.
    pub fn port(&self) -> &Port {
        &self.inner.port
    }
}

impl Channel for PortServerChannel {
    async fn start(&self) -> Result<()> {
        self.inner.start()
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.inner.send(&message)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close("channel closed");
        Ok(())
    }

    fn callbacks(&self) -> &Callbacks {
        &self.inner.callbacks
    }

    fn state(&self) -> TransportState {
        self.inner.lifecycle.state()
    }
}

impl Drop for PortServerChannel {
    fn drop(&mut self) {
        self.inner.close("channel dropped");
    }
}

impl fmt::Debug for PortServerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortServerChannel")
            .field("channel", &self.inner.filter.channel_id())
            .field("sender", self.inner.port.sender())
            .field("state", &self.inner.lifecycle.state())
            .finish()
    }
}

impl PortServerShared {
    fn start(self: &Arc<Self>) -> Result<()> {
        self.lifecycle.begin_start()?;

        let weak = Arc::downgrade(self);
        let on_message = self.port.on_message(move |value| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_value(value);
            }
        });
        let weak = Arc::downgrade(self);
        let on_disconnect = self.port.on_disconnect(move || {
            if let Some(shared) = weak.upgrade() {
                shared.handle_disconnect();
            }
        });
        *lock(&self.subscriptions) = vec![on_message, on_disconnect];

        let sender = self.port.sender();
        debug!(
            channel = %self.filter.channel_id(),
            port_id = sender.port_id,
            world = ?sender.world,
            "port server started"
        );
        self.post_control(ControlSignal::ServerReady);
        if !self.port.is_connected() {
            self.handle_disconnect();
        }
        Ok(())
    }

    fn send(&self, message: &Message) -> Result<()> {
        self.lifecycle.ensure_started()?;
        let envelope = Envelope::message(self.filter.channel_id(), Role::Server.outbound(), message);
        if self.port.post_message(envelope.to_value()).is_err() {
            self.handle_disconnect();
            return Err(ChannelError::Disconnected(format!(
                "port {} is gone",
                self.port.sender().port_id
            )));
        }
        Ok(())
    }

    fn handle_value(&self, value: &Value) {
        if !self.lifecycle.is_started() {
            return;
        }
        let origin = self.port.sender().origin.as_deref();
        let Some(envelope) = self.filter.accept(origin, value) else {
            return;
        };

        match envelope.parse_payload() {
            Ok(Payload::Control(ControlSignal::CheckReady)) => {
                self.post_control(ControlSignal::ServerReady);
            }
            Ok(Payload::Control(signal)) => {
                debug!(%signal, "ignoring control signal");
            }
            Ok(Payload::Message(message)) => self.callbacks.emit_message(message),
            Err(err) => {
                warn!(channel = %self.filter.channel_id(), error = %err, "malformed envelope payload");
                self.callbacks.emit_error(err.into());
            }
        }
    }

    fn handle_disconnect(&self) {
        if self.lifecycle.begin_close() == TransportState::Closed {
            return;
        }
        info!(
            channel = %self.filter.channel_id(),
            port_id = self.port.sender().port_id,
            "port peer disconnected"
        );
        lock(&self.subscriptions).clear();
        self.callbacks.emit_close();
    }

    fn close(&self, reason: &str) {
        if self.lifecycle.begin_close() == TransportState::Closed {
            return;
        }
        lock(&self.subscriptions).clear();
        self.port.disconnect();
        debug!(channel = %self.filter.channel_id(), reason, "port server closed");
        self.callbacks.emit_close();
    }

    fn post_control(&self, signal: ControlSignal) {
        let envelope = Envelope::control(self.filter.channel_id(), Role::Server.outbound(), signal);
        if self.port.post_message(envelope.to_value()).is_err() {
            debug!(%signal, "control signal not delivered; port disconnected");
        }
    }
}

/// Accepts ports on a listener and serves each with a [`PortServerChannel`].
pub struct ExtensionHost {
    listener: PortListener,
    config: PortServerConfig,
    channels: PeerRegistry<u64, Arc<PortServerChannel>>,
    hooks: PeerRegistry<u64, Arc<Subscription>>,
}

impl ExtensionHost {
    pub fn new(listener: PortListener, config: PortServerConfig) -> Self {
        Self {
            listener,
            config,
            channels: PeerRegistry::new(),
            hooks: PeerRegistry::new(),
        }
    }

    /// Start listening on `hub` for `name` in `world`.
    pub fn listen(
        hub: &PortHub,
        name: impl Into<String>,
        world: World,
        config: PortServerConfig,
    ) -> Result<Self> {
        Ok(Self::new(hub.listen(name, world)?, config))
    }

    /// Wait for the next port and wrap it in an unstarted server channel.
    ///
    /// The channel stays registered until its port disconnects or it is
    /// [`release`](Self::release)d.
    pub async fn accept(&mut self) -> Result<Arc<PortServerChannel>> {
        let port = self.listener.accept().await?;
        let sender = port.sender().clone();
        let channel = Arc::new(PortServerChannel::new(port.clone(), self.config.clone())?);

        let channels: WeakPeerRegistry<u64, Arc<PortServerChannel>> = self.channels.downgrade();
        let hooks = self.hooks.downgrade();
        let port_id = sender.port_id;
        let hook = port.on_disconnect(move || {
            if let Some(channels) = channels.upgrade() {
                channels.remove(&port_id);
            }
            if let Some(hooks) = hooks.upgrade() {
                hooks.remove(&port_id);
            }
        });

        self.channels.insert(port_id, Arc::clone(&channel));
        self.hooks.insert(port_id, Arc::new(hook));
        if !port.is_connected() {
            self.release(port_id);
        }

        info!(
            port = %self.listener.name(),
            port_id,
            world = ?sender.world,
            origin = sender.origin.as_deref().unwrap_or("-"),
            "accepted port"
        );
        Ok(channel)
    }

    /// Forget the channel registered for `port_id`.
    pub fn release(&self, port_id: u64) -> Option<Arc<PortServerChannel>> {
        self.hooks.remove(&port_id);
        self.channels.remove(&port_id)
    }

    /// Channel registered for `port_id`, if its port is still connected.
    pub fn channel(&self, port_id: u64) -> Option<Arc<PortServerChannel>> {
        self.channels.get(&port_id)
    }

    /// Live channels, keyed by port id.
    pub fn channels(&self) -> &PeerRegistry<u64, Arc<PortServerChannel>> {
        &self.channels
    }

    /// Close and forget every registered channel.
    pub async fn close_all(&self) -> Result<()> {
        self.hooks.drain();
        for channel in self.channels.drain() {
            channel.close().await?;
        }
        Ok(())
    }
}

impl fmt::Debug for ExtensionHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionHost")
            .field("listener", &self.listener)
            .field("channels", &self.channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let ext = PortClientConfig::extension();
        assert_eq!(ext.port_name, DEFAULT_EXTENSION_PORT);
        assert!(ext.keep_alive);
        assert_eq!(ext.keep_alive_interval, DEFAULT_KEEP_ALIVE_INTERVAL);
        assert_eq!(ext.reconnect, ReconnectPolicy::default());

        assert_eq!(PortClientConfig::user_script().port_name, DEFAULT_USER_SCRIPT_PORT);
        assert_eq!(
            PortServerConfig::default().allowed_origins,
            vec![WILDCARD_ORIGIN.to_string()]
        );
    }

    #[test]
    fn invalid_client_configs_rejected() {
        let hub = PortHub::new();
        let empty = PortClientConfig::extension().with_port_name("");
        assert!(matches!(
            PortClientChannel::extension(hub.clone(), empty),
            Err(ChannelError::Config(_))
        ));

        let zero_keep_alive = PortClientConfig::extension().with_keep_alive(true, Duration::ZERO);
        assert!(matches!(
            PortClientChannel::extension(hub, zero_keep_alive),
            Err(ChannelError::Config(_))
        ));
    }

    #[tokio::test]
    async fn server_requires_allowed_origins() {
        let hub = PortHub::new();
        let mut listener = hub.listen("p", World::Extension).unwrap();
        let _client = hub.connect("p", World::Extension, None);
        let port = listener.accept().await.unwrap();

        let config = PortServerConfig::default().with_allowed_origins(Vec::<String>::new());
        assert!(matches!(
            PortServerChannel::new(port, config),
            Err(ChannelError::Config(_))
        ));
    }
}

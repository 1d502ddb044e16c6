//! Runtime port model.
//!
//! A [`PortHub`] stands in for an extension runtime: contexts in either the
//! extension world or the user-script world `connect` to a named listener and
//! get a [`Port`]. Ports deliver messages asynchronously and in order, and can
//! be disconnected by either end or by the runtime itself (for example when a
//! background worker is restarted). Disconnecting an end notifies only the
//! remote end, like the browser API.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{MediumError, Result};
use crate::listeners::{lock, ObserverList, Subscription};

/// Execution world a port was opened from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum World {
    /// Extension pages, content scripts, background worker.
    Extension,
    /// Sandboxed user scripts.
    UserScript,
}

/// Identity of the context that opened a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSender {
    /// Hub-unique port id.
    pub port_id: u64,
    /// World the connecting context runs in.
    pub world: World,
    /// Origin of the connecting context, when known.
    pub origin: Option<String>,
}

enum PortEvent {
    Message(Value),
    Disconnect,
}

#[derive(Default)]
struct PortEnd {
    messages: ObserverList<Value>,
    disconnects: ObserverList<()>,
    inbox: OnceLock<mpsc::UnboundedSender<PortEvent>>,
}

impl PortEnd {
    fn deliver(&self, event: PortEvent) {
        let inbox = self.inbox.get_or_init(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<PortEvent>();
            let messages = self.messages.clone();
            let disconnects = self.disconnects.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        PortEvent::Message(value) => {
                            messages.emit(&value);
                        }
                        PortEvent::Disconnect => {
                            disconnects.emit(&());
                            break;
                        }
                    }
                }
            });
            tx
        });
        let _ = inbox.send(event);
    }
}

struct PortPair {
    name: String,
    sender: PortSender,
    connected: AtomicBool,
    ends: [PortEnd; 2],
}

impl PortPair {
    fn sever(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            for end in &self.ends {
                end.deliver(PortEvent::Disconnect);
            }
        }
    }
}

const CLIENT: usize = 0;
const SERVER: usize = 1;

/// One end of a connected runtime port.
#[derive(Clone)]
pub struct Port {
    pair: Arc<PortPair>,
    side: usize,
}

impl Port {
    /// Port name given at connect time.
    pub fn name(&self) -> &str {
        &self.pair.name
    }

    /// Identity of the context that opened this port.
    pub fn sender(&self) -> &PortSender {
        &self.pair.sender
    }

    /// Returns true until either end (or the runtime) disconnects the port.
    pub fn is_connected(&self) -> bool {
        self.pair.connected.load(Ordering::Acquire)
    }

    /// Send a message to the remote end.
    pub fn post_message(&self, data: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(MediumError::Disconnected);
        }
        self.remote().deliver(PortEvent::Message(data));
        Ok(())
    }

    /// Register a message listener on this end.
    pub fn on_message(&self, listener: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        self.local().messages.subscribe(listener)
    }

    /// Register a listener fired when the remote end or the runtime disconnects.
    pub fn on_disconnect(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.local().disconnects.subscribe(move |_| listener())
    }

    /// Disconnect this port. Only the remote end is notified.
    pub fn disconnect(&self) {
        if self.pair.connected.swap(false, Ordering::AcqRel) {
            trace!(name = %self.pair.name, port_id = self.pair.sender.port_id, "port disconnected locally");
            self.remote().deliver(PortEvent::Disconnect);
        }
    }

    fn local(&self) -> &PortEnd {
        &self.pair.ends[self.side]
    }

    fn remote(&self) -> &PortEnd {
        &self.pair.ends[1 - self.side]
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.pair.name)
            .field("sender", &self.pair.sender)
            .field("side", &if self.side == CLIENT { "client" } else { "server" })
            .field("connected", &self.is_connected())
            .finish()
    }
}

type ListenerKey = (String, World);

#[derive(Default)]
struct HubState {
    listeners: HashMap<ListenerKey, mpsc::UnboundedSender<Port>>,
    live: Vec<Weak<PortPair>>,
}

/// In-process runtime that routes port connections by name and world.
#[derive(Clone, Default)]
pub struct PortHub {
    state: Arc<Mutex<HubState>>,
    next_port_id: Arc<AtomicU64>,
}

impl PortHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections for `name` from contexts in `world`.
    pub fn listen(&self, name: impl Into<String>, world: World) -> Result<PortListener> {
        let name = name.into();
        let key = (name.clone(), world);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = lock(&self.state);
        if let Some(existing) = state.listeners.get(&key) {
            if !existing.is_closed() {
                return Err(MediumError::AlreadyListening(name));
            }
        }
        state.listeners.insert(key, tx);
        debug!(%name, ?world, "port listener registered");

        Ok(PortListener {
            name,
            world,
            rx,
            hub: Arc::downgrade(&self.state),
        })
    }

    /// Open a port to the listener registered for `name` in `world`.
    ///
    /// With no listener the returned port is disconnected asynchronously, the
    /// way a runtime connect to a missing receiver behaves.
    pub fn connect(&self, name: impl Into<String>, world: World, origin: Option<&str>) -> Port {
        let name = name.into();
        let port_id = self.next_port_id.fetch_add(1, Ordering::Relaxed) + 1;
        let pair = Arc::new(PortPair {
            name: name.clone(),
            sender: PortSender {
                port_id,
                world,
                origin: origin.map(str::to_string),
            },
            connected: AtomicBool::new(true),
            ends: [PortEnd::default(), PortEnd::default()],
        });
        let client = Port {
            pair: Arc::clone(&pair),
            side: CLIENT,
        };
        let server = Port {
            pair: Arc::clone(&pair),
            side: SERVER,
        };

        let accepted = {
            let mut state = lock(&self.state);
            state.live.retain(|weak| weak.strong_count() > 0);
            let accepted = state
                .listeners
                .get(&(name.clone(), world))
                .is_some_and(|tx| tx.send(server.clone()).is_ok());
            if accepted {
                state.live.push(Arc::downgrade(&pair));
            }
            accepted
        };

        if accepted {
            debug!(%name, ?world, port_id, "port connected");
        } else {
            debug!(%name, ?world, port_id, "no listener for port; disconnecting");
            server.disconnect();
        }
        client
    }

    /// Disconnect every live port opened under `name`, notifying both ends.
    ///
    /// Returns the number of ports severed.
    pub fn drop_connections(&self, name: &str) -> usize {
        let pairs: Vec<Arc<PortPair>> = {
            let mut state = lock(&self.state);
            state.live.retain(|weak| weak.strong_count() > 0);
            state
                .live
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|pair| pair.name == name && pair.connected.load(Ordering::Acquire))
                .collect()
        };
        for pair in &pairs {
            pair.sever();
        }
        pairs.len()
    }
}

impl fmt::Debug for PortHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("PortHub")
            .field("listeners", &state.listeners.len())
            .field("live", &state.live.len())
            .finish()
    }
}

/// Accepts ports connecting to one name/world pair.
///
/// Dropping the listener unregisters it.
pub struct PortListener {
    name: String,
    world: World,
    rx: mpsc::UnboundedReceiver<Port>,
    hub: Weak<Mutex<HubState>>,
}

impl PortListener {
    /// Wait for the next connecting port.
    pub async fn accept(&mut self) -> Result<Port> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| MediumError::ListenerClosed(self.name.clone()))
    }

    /// Port name this listener accepts.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// World this listener accepts.
    pub fn world(&self) -> World {
        self.world
    }
}

impl Drop for PortListener {
    fn drop(&mut self) {
        if let Some(state) = self.hub.upgrade() {
            lock(&state)
                .listeners
                .remove(&(self.name.clone(), self.world));
        }
    }
}

impl fmt::Debug for PortListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortListener")
            .field("name", &self.name)
            .field("world", &self.world)
            .finish()
    }
}

//! Channels over byte streams (child-process stdio, or our own).
//!
//! Streams are point-to-point, so there is no envelope and no readiness
//! handshake: the channel is ready as soon as it starts. Each message is one
//! line of JSON. A reader task decodes lines with [`JsonLineCodec`] and a
//! writer task drains an outbound queue, reporting flushed bytes to the
//! [`BackpressureController`] so senders slow down when the peer stops
//! reading.
//!
//! End of input only closes the read side. A server keeps writing until every
//! request it has already received is answered, then closes; a client closes
//! at once since no response can arrive any more. A write failure closes the
//! channel immediately.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ctxbridge_envelope::{encode_message, JsonLineCodec, Message, RequestId, DEFAULT_MAX_LINE};
use ctxbridge_medium::ChildProcess;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backpressure::{BackpressureController, DEFAULT_DRAIN_TIMEOUT, DEFAULT_HIGH_WATER_MARK};
use crate::contract::{Callbacks, Channel, Lifecycle, Role, TransportState};
use crate::error::{ChannelError, Result};
use crate::lock;
use crate::timeout::{RequestTimeoutTracker, Resolution, DEFAULT_REQUEST_TIMEOUT};

/// How long a closed client waits for its child to exit before killing it.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

/// How long `close()` waits for queued output to be written.
const WRITER_FLUSH_GRACE: Duration = Duration::from_secs(2);

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Configuration for [`StreamChannel`].
#[derive(Debug, Clone)]
pub struct StreamChannelConfig {
    /// Client request timeout. `None` disables timeouts. Ignored by servers.
    pub request_timeout: Option<Duration>,
    /// Unflushed bytes at which senders start waiting for drain.
    pub high_water_mark: usize,
    /// Longest a sender waits for drain. A send that gives up is not written.
    pub drain_timeout: Duration,
    /// Longest accepted inbound line.
    pub max_line_length: usize,
}

impl Default for StreamChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_line_length: DEFAULT_MAX_LINE,
        }
    }
}

impl StreamChannelConfig {
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.request_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ChannelError::Config(
                "request timeout must be non-zero; use None to disable".to_string(),
            ));
        }
        if self.high_water_mark == 0 {
            return Err(ChannelError::Config("high-water mark must be non-zero".to_string()));
        }
        if self.max_line_length == 0 {
            return Err(ChannelError::Config("max line length must be non-zero".to_string()));
        }
        Ok(())
    }
}

struct StreamIo {
    reader: BoxReader,
    writer: BoxWriter,
}

/// Requests a server has received but not answered yet.
#[derive(Debug, Default)]
struct InFlight {
    requests: HashSet<RequestId>,
    input_closed: bool,
}

struct StreamShared {
    role: Role,
    lifecycle: Lifecycle,
    callbacks: Callbacks,
    timeouts: Option<RequestTimeoutTracker>,
    backpressure: BackpressureController,
    max_line_length: usize,
    io: Mutex<Option<StreamIo>>,
    in_flight: Mutex<InFlight>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    child: Mutex<Option<ChildProcess>>,
}

/// A channel over a pair of byte streams, one JSON message per line.
pub struct StreamChannel {
    inner: Arc<StreamShared>,
}

impl StreamChannel {
    /// Channel over an arbitrary reader/writer pair.
    pub fn new<R, W>(role: Role, reader: R, writer: W, config: StreamChannelConfig) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;
        let timeouts = match role {
            Role::Client => config.request_timeout.map(RequestTimeoutTracker::new),
            Role::Server => None,
        };

        Ok(Self {
            inner: Arc::new(StreamShared {
                role,
                lifecycle: Lifecycle::new(),
                callbacks: Callbacks::new(),
                timeouts,
                backpressure: BackpressureController::with_timeout(
                    config.high_water_mark,
                    config.drain_timeout,
                ),
                max_line_length: config.max_line_length,
                io: Mutex::new(Some(StreamIo {
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                })),
                in_flight: Mutex::new(InFlight::default()),
                outbound: Mutex::new(None),
                writer_task: Mutex::new(None),
                cancel: CancellationToken::new(),
                child: Mutex::new(None),
            }),
        })
    }

    /// Client talking to a server spawned as a child process.
    ///
    /// The child's stdin carries requests, its stdout responses; its stderr
    /// is inherited.
    pub fn stdio_client<I, S>(program: &str, args: I, config: StreamChannelConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut child = ChildProcess::spawn(program, args)?;
        let (stdin, stdout) = child.take_stdio()?;
        let channel = Self::new(Role::Client, stdout, stdin, config)?;
        *lock(&channel.inner.child) = Some(child);
        Ok(channel)
    }

    /// Server on this process's own stdin/stdout.
    pub fn stdio_server(config: StreamChannelConfig) -> Result<Self> {
        Self::new(Role::Server, tokio::io::stdin(), tokio::io::stdout(), config)
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Process id of the spawned child, for stdio clients.
    pub fn child_id(&self) -> Option<u32> {
        lock(&self.inner.child).as_ref().and_then(ChildProcess::id)
    }

    /// Bytes queued for writing but not yet flushed.
    pub fn buffered(&self) -> usize {
        self.inner.backpressure.buffered()
    }

    /// Requests still waiting for a response (clients).
    pub fn pending_requests(&self) -> usize {
        self.inner
            .timeouts
            .as_ref()
            .map_or(0, RequestTimeoutTracker::pending_count)
    }

    /// Requests received but not yet answered (servers).
    pub fn unanswered_requests(&self) -> usize {
        lock(&self.inner.in_flight).requests.len()
    }

    /// Returns true once the peer has stopped sending.
    pub fn is_input_closed(&self) -> bool {
        lock(&self.inner.in_flight).input_closed
    }
}

impl Channel for StreamChannel {
    async fn start(&self) -> Result<()> {
        self.inner.start()
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.inner.send(message).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close();

        // Let the writer finish what was queued before close.
        let writer = lock(&self.inner.writer_task).take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(WRITER_FLUSH_GRACE, &mut writer).await.is_err() {
                warn!(role = %self.inner.role, "stream writer did not flush in time; dropping output");
                writer.abort();
            }
        }
        Ok(())
    }

    fn callbacks(&self) -> &Callbacks {
        &self.inner.callbacks
    }

    fn state(&self) -> TransportState {
        self.inner.lifecycle.state()
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("role", &self.inner.role)
            .field("state", &self.inner.lifecycle.state())
            .field("buffered", &self.inner.backpressure.buffered())
            .field("child", &self.child_id())
            .finish()
    }
}

impl StreamShared {
    fn start(self: &Arc<Self>) -> Result<()> {
        let io = lock(&self.io).take();
        self.lifecycle.begin_start()?;
        let Some(StreamIo { reader, writer }) = io else {
            return Err(ChannelError::Closed);
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.outbound) = Some(tx);

        tokio::spawn(read_loop(
            Arc::downgrade(self),
            reader,
            self.max_line_length,
            self.cancel.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            Arc::downgrade(self),
            writer,
            rx,
            self.backpressure.clone(),
        ));
        *lock(&self.writer_task) = Some(writer);

        info!(role = %self.role, child = ?self.child_pid(), "stream channel started");
        Ok(())
    }

    async fn send(self: &Arc<Self>, message: Message) -> Result<()> {
        self.lifecycle.ensure_started()?;

        let mut line = BytesMut::new();
        encode_message(&message, &mut line)?;
        let len = line.len();

        let tracked = match (&message, &self.timeouts) {
            (Message::Request(request), Some(tracker)) => {
                let weak = Arc::downgrade(self);
                tracker.track(request, move |response| {
                    if let Some(shared) = weak.upgrade() {
                        shared.callbacks.emit_message(response);
                    }
                });
                Some((tracker, &request.id))
            }
            _ => None,
        };

        // Wait before queueing: a send that fails here has written nothing.
        if self.backpressure.is_active() {
            debug!(buffered = self.backpressure.buffered(), "write buffer above high-water mark; waiting for drain");
            let drained = match tracked {
                Some((tracker, _)) => {
                    tokio::time::timeout(tracker.timeout(), self.backpressure.wait_for_drain()).await
                }
                None => Ok(self.backpressure.wait_for_drain().await),
            };
            match drained {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if let Some((tracker, id)) = tracked {
                        tracker.resolve(id);
                    }
                    return Err(err);
                }
                Err(_) => {
                    debug!("request answered by timeout while waiting for drain");
                    return Ok(());
                }
            }
        }

        if !self.backpressure.enqueue(len) {
            trace!(buffered = self.backpressure.buffered(), "write buffer reached high-water mark");
        }
        let queued = lock(&self.outbound)
            .as_ref()
            .is_some_and(|tx| tx.send(line.freeze()).is_ok());
        if !queued {
            self.backpressure.complete(len);
            if let Some((tracker, id)) = tracked {
                tracker.resolve(id);
            }
            return Err(ChannelError::Disconnected("stream writer stopped".to_string()));
        }

        if let (Role::Server, Message::Response(response)) = (self.role, &message) {
            self.answered(&response.id);
        }
        Ok(())
    }

    fn handle_line(&self, line: &[u8]) {
        let message = match serde_json::from_slice::<Message>(line) {
            Ok(message) => message,
            Err(err) => {
                warn!(role = %self.role, error = %err, "failed to parse stream line");
                self.callbacks.emit_error(err.into());
                return;
            }
        };

        match (&message, &self.timeouts) {
            (Message::Response(response), Some(tracker)) => {
                if tracker.resolve(&response.id) == Resolution::Expired {
                    warn!(id = %response.id, "dropping response that arrived after its timeout");
                    return;
                }
            }
            (Message::Request(request), _) if self.role == Role::Server => {
                lock(&self.in_flight).requests.insert(request.id.clone());
            }
            _ => {}
        }
        self.callbacks.emit_message(message);
    }

    /// The peer stopped sending.
    fn finish_input(&self) {
        let unanswered = {
            let mut in_flight = lock(&self.in_flight);
            in_flight.input_closed = true;
            in_flight.requests.len()
        };
        if self.role == Role::Client || unanswered == 0 {
            self.handle_disconnect("end of input");
        } else {
            info!(role = %self.role, unanswered, "end of input; answering remaining requests");
        }
    }

    fn answered(&self, id: &RequestId) {
        let done = {
            let mut in_flight = lock(&self.in_flight);
            in_flight.requests.remove(id) && in_flight.input_closed && in_flight.requests.is_empty()
        };
        if done {
            self.handle_disconnect("end of input");
        }
    }

    fn handle_disconnect(&self, reason: &str) {
        if self.lifecycle.begin_close() == TransportState::Closed {
            return;
        }
        info!(role = %self.role, reason, "stream peer went away");
        self.teardown();
        self.callbacks.emit_close();
    }

    fn close(&self) {
        if self.lifecycle.begin_close() == TransportState::Closed {
            return;
        }
        debug!(role = %self.role, "stream channel closed");
        self.teardown();
        self.callbacks.emit_close();
    }

    fn teardown(&self) {
        self.cancel.cancel();
        // Dropping the sender lets the writer flush what is queued and exit.
        lock(&self.outbound).take();
        self.backpressure.close();
        if let Some(tracker) = &self.timeouts {
            tracker.clear();
        }

        let child = lock(&self.child).take();
        if let Some(mut child) = child {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await.is_err() {
                            if let Err(err) = child.kill().await {
                                warn!(program = %child.program(), error = %err, "failed to kill child");
                            }
                        }
                    });
                }
                // Without a runtime the child is killed on drop.
                Err(_) => drop(child),
            }
        }
    }

    fn child_pid(&self) -> Option<u32> {
        lock(&self.child).as_ref().and_then(ChildProcess::id)
    }
}

async fn read_loop(
    shared: Weak<StreamShared>,
    reader: BoxReader,
    max_line_length: usize,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(reader, JsonLineCodec::with_max_line_length(max_line_length));
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = lines.next() => next,
        };
        let Some(channel) = shared.upgrade() else {
            return;
        };
        match next {
            Some(Ok(Ok(line))) => channel.handle_line(&line),
            Some(Ok(Err(err))) => {
                warn!(role = %channel.role, error = %err, "skipping unreadable stream line");
                channel.callbacks.emit_error(err.into());
            }
            Some(Err(err)) => {
                warn!(error = %err, "stream read failed");
                channel.callbacks.emit_error(err.into());
                channel.handle_disconnect("read failed");
                return;
            }
            None => {
                channel.finish_input();
                return;
            }
        }
    }
}

async fn write_loop(
    shared: Weak<StreamShared>,
    mut writer: BoxWriter,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    backpressure: BackpressureController,
) {
    while let Some(line) = outbound.recv().await {
        let len = line.len();
        let written = match writer.write_all(&line).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        backpressure.complete(len);

        if let Err(err) = written {
            warn!(error = %err, "stream write failed");
            backpressure.close();
            if let Some(channel) = shared.upgrade() {
                channel.callbacks.emit_error(err.into());
                channel.handle_disconnect("write failed");
            }
            return;
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(error = %err, "stream writer shutdown failed");
    }
}

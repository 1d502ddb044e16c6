use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ctxbridge_channel::{
    Channel, ChannelError, ExtensionHost, PeerRegistry, PortClientChannel, PortClientConfig,
    PortServerChannel, PortServerConfig, ReconnectPolicy, TransportState,
};
use ctxbridge_envelope::Message;
use ctxbridge_medium::{PortHub, World};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const PORT: &str = "mcp-extension";

/// Accepts ports in the background, forwarding every inbound message along
/// with the port id it arrived on.
struct HostHarness {
    inbound: mpsc::UnboundedReceiver<(u64, Message)>,
    accepted: Arc<Mutex<Vec<Arc<PortServerChannel>>>>,
    registry: PeerRegistry<u64, Arc<PortServerChannel>>,
    task: JoinHandle<()>,
}

impl HostHarness {
    fn spawn(mut host: ExtensionHost) -> Self {
        let (tx, inbound) = mpsc::unbounded_channel();
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let registry = host.channels().clone();
        let list = Arc::clone(&accepted);
        let task = tokio::spawn(async move {
            while let Ok(channel) = host.accept().await {
                let port_id = channel.port_id();
                let tx = tx.clone();
                channel.set_on_message(move |msg| {
                    let _ = tx.send((port_id, msg));
                });
                channel.start().await.unwrap();
                list.lock().unwrap().push(channel);
            }
        });
        Self {
            inbound,
            accepted,
            registry,
            task,
        }
    }

    async fn recv(&mut self) -> (u64, Message) {
        timeout(Duration::from_secs(2), self.inbound.recv())
            .await
            .expect("timed out waiting for server message")
            .expect("host stopped")
    }

    fn channel(&self, port_id: u64) -> Arc<PortServerChannel> {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.port_id() == port_id)
            .cloned()
            .expect("no channel for port")
    }

    fn accepted(&self) -> usize {
        self.accepted.lock().unwrap().len()
    }
}

impl Drop for HostHarness {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn collect(channel: &impl Channel) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.set_on_message(move |msg| {
        let _ = tx.send(msg);
    });
    rx
}

fn count_closes(channel: &impl Channel) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    channel.set_on_close(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    count
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel dropped")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

fn fast_reconnect(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy::default()
        .with_reconnect_delay(Duration::from_millis(10))
        .with_max_reconnect_delay(Duration::from_millis(40))
        .with_max_reconnect_attempts(max_attempts)
}

#[tokio::test]
async fn extension_roundtrip_through_host() {
    let hub = PortHub::new();
    let host = ExtensionHost::listen(&hub, PORT, World::Extension, PortServerConfig::default())
        .unwrap();
    let mut harness = HostHarness::spawn(host);

    let client = PortClientChannel::extension(
        hub.clone(),
        PortClientConfig::extension().with_origin("https://page.example"),
    )
    .unwrap();
    let mut client_rx = collect(&client);
    client.start().await.unwrap();

    client
        .send(Message::request(1, "tools/list", None))
        .await
        .unwrap();
    let (port_id, msg) = harness.recv().await;
    assert_eq!(msg, Message::request(1, "tools/list", None));
    assert_eq!(harness.registry.len(), 1);

    let server = harness.channel(port_id);
    assert_eq!(
        server.port().sender().origin.as_deref(),
        Some("https://page.example")
    );
    server
        .send(Message::result(1, json!({"tools": []})))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut client_rx).await,
        Message::result(1, json!({"tools": []}))
    );
    assert!(client.is_ready());
    assert_eq!(client.connections(), 1);
}

#[tokio::test]
async fn worlds_are_routed_separately() {
    let hub = PortHub::new();
    let _host = ExtensionHost::listen(&hub, "shared", World::Extension, PortServerConfig::default())
        .unwrap();

    let client = PortClientChannel::user_script(
        hub.clone(),
        PortClientConfig::user_script()
            .with_port_name("shared")
            .with_reconnect(ReconnectPolicy::disabled()),
    )
    .unwrap();
    let closes = count_closes(&client);
    client.start().await.unwrap();

    eventually(|| closes.load(Ordering::SeqCst) == 1).await;
    assert_eq!(client.state(), TransportState::Closed);
    assert_eq!(client.world(), World::UserScript);
}

#[tokio::test]
async fn reconnects_after_runtime_drops_ports() {
    let hub = PortHub::new();
    let host = ExtensionHost::listen(&hub, PORT, World::Extension, PortServerConfig::default())
        .unwrap();
    let mut harness = HostHarness::spawn(host);

    let client = PortClientChannel::extension(
        hub.clone(),
        PortClientConfig::extension().with_reconnect(fast_reconnect(5)),
    )
    .unwrap();
    let closes = count_closes(&client);
    client.start().await.unwrap();
    client
        .send(Message::notification("first", None))
        .await
        .unwrap();
    let (first_port, _) = harness.recv().await;

    assert_eq!(hub.drop_connections(PORT), 1);
    eventually(|| harness.accepted() == 2 && client.is_ready()).await;
    assert_eq!(client.connections(), 2);
    assert_eq!(client.reconnect_attempts(), 0);

    client
        .send(Message::notification("second", None))
        .await
        .unwrap();
    let (second_port, msg) = harness.recv().await;
    assert_ne!(first_port, second_port);
    assert_eq!(msg, Message::notification("second", None));

    // The severed server channel closed and left the registry.
    assert_eq!(harness.channel(first_port).state(), TransportState::Closed);
    eventually(|| !harness.registry.contains(&first_port)).await;
    assert!(harness.registry.contains(&second_port));
    assert_eq!(closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn send_during_outage_is_delivered_after_reconnect() {
    let hub = PortHub::new();
    let client = Arc::new(
        PortClientChannel::extension(
            hub.clone(),
            PortClientConfig::extension().with_reconnect(fast_reconnect(10)),
        )
        .unwrap(),
    );
    client.start().await.unwrap();

    let sending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send(Message::notification("queued", None)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!sending.is_finished());

    let host = ExtensionHost::listen(&hub, PORT, World::Extension, PortServerConfig::default())
        .unwrap();
    let mut harness = HostHarness::spawn(host);

    sending.await.unwrap().unwrap();
    let (_, msg) = harness.recv().await;
    assert_eq!(msg, Message::notification("queued", None));
    assert!(client.connections() > 1);
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let hub = PortHub::new();
    let client = PortClientChannel::extension(
        hub,
        PortClientConfig::extension().with_reconnect(fast_reconnect(3)),
    )
    .unwrap();
    let closes = count_closes(&client);
    let exhausted = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::clone(&exhausted);
    client.set_on_error(move |err| {
        if let ChannelError::ReconnectExhausted(attempts) = err {
            errors.lock().unwrap().push(attempts);
        }
    });
    client.start().await.unwrap();

    eventually(|| closes.load(Ordering::SeqCst) == 1).await;
    assert_eq!(*exhausted.lock().unwrap(), vec![3]);
    assert_eq!(client.connections(), 4);
    assert_eq!(client.state(), TransportState::Closed);
    assert!(client.send(Message::notification("late", None)).await.is_err());
}

#[tokio::test]
async fn client_close_releases_host_channel() {
    let hub = PortHub::new();
    let host = ExtensionHost::listen(&hub, PORT, World::Extension, PortServerConfig::default())
        .unwrap();
    let mut harness = HostHarness::spawn(host);

    let client = PortClientChannel::extension(hub.clone(), PortClientConfig::extension()).unwrap();
    let client_closes = count_closes(&client);
    client.start().await.unwrap();
    client.send(Message::notification("hi", None)).await.unwrap();
    let (port_id, _) = harness.recv().await;
    let server = harness.channel(port_id);
    let server_closes = count_closes(server.as_ref());

    client.close().await.unwrap();
    client.close().await.unwrap();
    assert_eq!(client_closes.load(Ordering::SeqCst), 1);

    eventually(|| server_closes.load(Ordering::SeqCst) == 1).await;
    eventually(|| harness.registry.is_empty()).await;
    assert!(server.send(Message::result(1, json!({}))).await.is_err());
}

#[tokio::test]
async fn host_filters_origins() {
    let hub = PortHub::new();
    let host = ExtensionHost::listen(
        &hub,
        PORT,
        World::Extension,
        PortServerConfig::default().with_allowed_origins(["https://trusted.example"]),
    )
    .unwrap();
    let mut harness = HostHarness::spawn(host);

    let stranger = PortClientChannel::extension(
        hub.clone(),
        PortClientConfig::extension()
            .with_origin("https://stranger.example")
            .with_request_timeout(Some(Duration::from_millis(100))),
    )
    .unwrap();
    let mut stranger_rx = collect(&stranger);
    stranger.start().await.unwrap();
    stranger.send(Message::request(1, "x", None)).await.unwrap();
    let reply = recv(&mut stranger_rx).await;
    assert_eq!(reply.to_value()["error"]["code"], json!(-32000));

    let trusted = PortClientChannel::extension(
        hub.clone(),
        PortClientConfig::extension().with_origin("https://trusted.example"),
    )
    .unwrap();
    trusted.start().await.unwrap();
    trusted.send(Message::request(2, "y", None)).await.unwrap();
    let (_, msg) = harness.recv().await;
    assert_eq!(msg, Message::request(2, "y", None));
}

#[tokio::test]
async fn close_all_closes_every_peer() {
    let hub = PortHub::new();
    let mut host = ExtensionHost::listen(&hub, PORT, World::Extension, PortServerConfig::default())
        .unwrap();

    let a = PortClientChannel::extension(
        hub.clone(),
        PortClientConfig::extension().with_reconnect(ReconnectPolicy::disabled()),
    )
    .unwrap();
    let b = PortClientChannel::extension(
        hub.clone(),
        PortClientConfig::extension().with_reconnect(ReconnectPolicy::disabled()),
    )
    .unwrap();
    let a_closes = count_closes(&a);
    let b_closes = count_closes(&b);
    a.start().await.unwrap();
    b.start().await.unwrap();

    for _ in 0..2 {
        host.accept().await.unwrap().start().await.unwrap();
    }
    assert_eq!(host.channels().len(), 2);

    host.close_all().await.unwrap();
    assert!(host.channels().is_empty());
    eventually(|| a_closes.load(Ordering::SeqCst) == 1 && b_closes.load(Ordering::SeqCst) == 1)
        .await;
}

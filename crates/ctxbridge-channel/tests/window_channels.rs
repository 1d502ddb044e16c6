use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ctxbridge_channel::{Channel, ChannelError, TransportState, WindowChannel, WindowChannelConfig};
use ctxbridge_envelope::{ControlSignal, Direction, Envelope, Message, RequestId, TIMEOUT_ERROR_CODE};
use ctxbridge_medium::Window;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

const APP: &str = "https://app.example";
const WIDGET: &str = "https://widget.example";

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

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Message>, wait: Duration) {
    if let Ok(Some(msg)) = timeout(wait, rx.recv()).await {
        panic!("unexpected message: {msg:?}");
    }
}

fn tab_server(window: &Window, channel: &str) -> WindowChannel {
    WindowChannel::tab_server(
        window.clone(),
        WindowChannelConfig::tab()
            .with_channel_id(channel)
            .with_allowed_origins([APP]),
    )
    .unwrap()
}

fn tab_client(window: &Window, channel: &str, request_timeout: Option<Duration>) -> WindowChannel {
    WindowChannel::tab_client(
        window.clone(),
        WindowChannelConfig::tab()
            .with_channel_id(channel)
            .with_target_origin(APP)
            .with_request_timeout(request_timeout),
    )
    .unwrap()
}

#[tokio::test]
async fn roundtrip_with_server_started_first() {
    let window = Window::new(APP);
    let server = tab_server(&window, "mcp-default");
    let mut server_rx = collect(&server);
    server.start().await.unwrap();

    let client = tab_client(&window, "mcp-default", Some(Duration::from_secs(5)));
    let mut client_rx = collect(&client);
    client.start().await.unwrap();

    client
        .send(Message::request(1, "tools/list", None))
        .await
        .unwrap();
    assert_eq!(recv(&mut server_rx).await, Message::request(1, "tools/list", None));
    assert_eq!(server.in_flight(), 1);

    server
        .send(Message::result(1, json!({"tools": []})))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut client_rx).await,
        Message::result(1, json!({"tools": []}))
    );
    assert_eq!(server.in_flight(), 0);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn client_started_first_waits_for_server() {
    let window = Window::new(APP);
    let client = Arc::new(tab_client(&window, "mcp-default", None));
    client.start().await.unwrap();

    let sending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send(Message::notification("hello", None)).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!sending.is_finished());
    assert!(!client.is_ready());

    let server = tab_server(&window, "mcp-default");
    let mut server_rx = collect(&server);
    server.start().await.unwrap();

    sending.await.unwrap().unwrap();
    assert!(client.is_ready());
    assert_eq!(
        recv(&mut server_rx).await,
        Message::notification("hello", None)
    );
}

#[tokio::test]
async fn unanswered_request_gets_synthesized_timeout() {
    let window = Window::new(APP);
    let client = tab_client(&window, "mcp-default", Some(Duration::from_millis(50)));
    let mut client_rx = collect(&client);
    client.start().await.unwrap();

    let started = tokio::time::Instant::now();
    client
        .send(Message::request(1, "x", None))
        .await
        .unwrap();
    let Message::Response(response) = recv(&mut client_rx).await else {
        panic!("expected a response");
    };
    assert!(started.elapsed() < Duration::from_millis(500));

    assert_eq!(response.id, RequestId::Number(1));
    let error = response.error().unwrap();
    assert_eq!(error.code, TIMEOUT_ERROR_CODE);
    assert_eq!(
        error.message,
        "Request timeout - server may have navigated or become unresponsive"
    );
    assert_eq!(error.data, Some(json!({"timeoutMs": 50, "originalMethod": "x"})));
}

#[tokio::test]
async fn late_response_after_timeout_is_suppressed() {
    let window = Window::new(APP);
    let server = tab_server(&window, "mcp-default");
    let mut server_rx = collect(&server);
    server.start().await.unwrap();

    let client = tab_client(&window, "mcp-default", Some(Duration::from_millis(80)));
    let mut client_rx = collect(&client);
    client.start().await.unwrap();

    client.send(Message::request(3, "slow", None)).await.unwrap();
    recv(&mut server_rx).await;

    let first = recv(&mut client_rx).await;
    assert_eq!(
        first.to_value()["error"]["code"],
        json!(TIMEOUT_ERROR_CODE)
    );

    server.send(Message::result(3, json!("late"))).await.unwrap();
    assert_quiet(&mut client_rx, Duration::from_millis(150)).await;
}

#[tokio::test]
async fn answered_request_never_times_out() {
    let window = Window::new(APP);
    let server = tab_server(&window, "mcp-default");
    let mut server_rx = collect(&server);
    server.start().await.unwrap();

    let client = tab_client(&window, "mcp-default", Some(Duration::from_millis(100)));
    let mut client_rx = collect(&client);
    client.start().await.unwrap();

    client.send(Message::request(4, "fast", None)).await.unwrap();
    recv(&mut server_rx).await;
    server.send(Message::result(4, json!({}))).await.unwrap();

    assert_eq!(recv(&mut client_rx).await, Message::result(4, json!({})));
    assert_quiet(&mut client_rx, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn channels_on_one_window_are_isolated() {
    let window = Window::new(APP);
    let server1 = tab_server(&window, "c1");
    let server2 = tab_server(&window, "c2");
    let seen1 = Arc::new(AtomicUsize::new(0));
    let seen2 = Arc::new(AtomicUsize::new(0));
    let s1 = Arc::clone(&seen1);
    let s2 = Arc::clone(&seen2);
    server1.set_on_message(move |_| {
        s1.fetch_add(1, Ordering::SeqCst);
    });
    server2.set_on_message(move |_| {
        s2.fetch_add(1, Ordering::SeqCst);
    });
    server1.start().await.unwrap();
    server2.start().await.unwrap();

    let client = tab_client(&window, "c1", None);
    client.start().await.unwrap();
    client
        .send(Message::notification("only-c1", None))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen1.load(Ordering::SeqCst), 1);
    assert_eq!(seen2.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unload_interrupts_in_flight_request() {
    let window = Window::new(APP);
    let server = tab_server(&window, "mcp-default");
    let mut server_rx = collect(&server);
    server.start().await.unwrap();

    let client = tab_client(&window, "mcp-default", None);
    let mut client_rx = collect(&client);
    client.start().await.unwrap();

    client
        .send(Message::request(7, "tools/call", Some(json!({"name": "click"}))))
        .await
        .unwrap();
    recv(&mut server_rx).await;

    window.unload();

    let Message::Response(response) = recv(&mut client_rx).await else {
        panic!("expected a response");
    };
    assert_eq!(response.id, RequestId::Number(7));
    let result = response.result().unwrap();
    assert_eq!(result["metadata"]["navigationInterrupted"], json!(true));
    assert_eq!(result["metadata"]["originalMethod"], json!("tools/call"));
    assert_eq!(
        result["content"][0]["text"],
        json!("Tool execution interrupted by page navigation")
    );

    server.send(Message::result(7, json!("real"))).await.unwrap();
    assert_quiet(&mut client_rx, Duration::from_millis(150)).await;
}

#[tokio::test]
async fn unload_interrupts_most_recent_first() {
    let window = Window::new(APP);
    let server = tab_server(&window, "mcp-default");
    let mut server_rx = collect(&server);
    server.start().await.unwrap();

    let client = tab_client(&window, "mcp-default", None);
    let mut client_rx = collect(&client);
    client.start().await.unwrap();

    for id in 1..=3 {
        client.send(Message::request(id, "work", None)).await.unwrap();
        recv(&mut server_rx).await;
    }
    server.send(Message::result(2, json!("done"))).await.unwrap();
    assert_eq!(recv(&mut client_rx).await.id(), Some(&RequestId::Number(2)));

    window.unload();
    let first = recv(&mut client_rx).await;
    let second = recv(&mut client_rx).await;
    assert_eq!(first.id(), Some(&RequestId::Number(3)));
    assert_eq!(second.id(), Some(&RequestId::Number(1)));
    assert_quiet(&mut client_rx, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn iframe_pair_roundtrip() {
    let parent = Window::new(APP);
    let iframe = Window::new(WIDGET);

    let child = WindowChannel::iframe_child(
        iframe.clone(),
        parent.clone(),
        WindowChannelConfig::iframe()
            .with_target_origin(APP)
            .with_allowed_origins([APP]),
    )
    .unwrap();
    let mut child_rx = collect(&child);
    child.start().await.unwrap();

    let host = WindowChannel::iframe_parent(parent.clone(), iframe.clone(), WindowChannelConfig::iframe())
        .unwrap();
    let mut host_rx = collect(&host);
    host.start().await.unwrap();

    host.send(Message::request("a", "ping", None)).await.unwrap();
    assert_eq!(recv(&mut child_rx).await, Message::request("a", "ping", None));
    child.send(Message::result("a", json!({}))).await.unwrap();
    assert_eq!(recv(&mut host_rx).await, Message::result("a", json!({})));
}

#[tokio::test]
async fn disallowed_origin_is_ignored() {
    let evil = Window::new("https://evil.example");
    let iframe = Window::new(WIDGET);
    let parent = Window::new(APP);

    let child = WindowChannel::iframe_child(
        iframe.clone(),
        parent,
        WindowChannelConfig::iframe()
            .with_target_origin(APP)
            .with_allowed_origins([APP]),
    )
    .unwrap();
    let mut child_rx = collect(&child);
    child.start().await.unwrap();

    let intruder = WindowChannel::iframe_parent(evil, iframe.clone(), WindowChannelConfig::iframe())
        .unwrap();
    intruder.start().await.unwrap();

    // A forged envelope posted straight at the iframe.
    let forged = Envelope::message(
        "mcp-iframe",
        Direction::ClientToServer,
        &Message::notification("steal", None),
    );
    iframe.post_message(forged.to_value(), "*", "https://evil.example");

    assert_quiet(&mut child_rx, Duration::from_millis(250)).await;
    assert!(!intruder.is_ready());
}

#[tokio::test]
async fn foreign_traffic_and_bad_payloads() {
    let window = Window::new(APP);
    let server = tab_server(&window, "mcp-default");
    let mut server_rx = collect(&server);
    let errors = Arc::new(AtomicUsize::new(0));
    let e = Arc::clone(&errors);
    server.set_on_error(move |_| {
        e.fetch_add(1, Ordering::SeqCst);
    });
    server.start().await.unwrap();

    window.post_message(json!({"source": "react-devtools"}), "*", APP);
    window.post_message(json!("plain string"), "*", APP);
    let mut bogus = Envelope::control("mcp-default", Direction::ClientToServer, ControlSignal::CheckReady);
    bogus.payload = json!({"jsonrpc": "2.0"});
    window.post_message(bogus.to_value(), "*", APP);

    assert_quiet(&mut server_rx, Duration::from_millis(100)).await;
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_is_idempotent_and_releases_listeners() {
    let window = Window::new(APP);
    let server = tab_server(&window, "mcp-default");
    let client = tab_client(&window, "mcp-default", None);
    let server_closes = count_closes(&server);
    let client_closes = count_closes(&client);

    server.start().await.unwrap();
    client.start().await.unwrap();
    assert_eq!(window.listener_count(), 2);

    client.close().await.unwrap();
    client.close().await.unwrap();
    server.close().await.unwrap();
    server.close().await.unwrap();

    assert_eq!(window.listener_count(), 0);
    assert_eq!(client_closes.load(Ordering::SeqCst), 1);
    assert_eq!(server_closes.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), TransportState::Closed);
}

#[tokio::test]
async fn close_fails_sends_waiting_for_readiness() {
    let window = Window::new(APP);
    let client = Arc::new(tab_client(&window, "mcp-default", None));
    client.start().await.unwrap();

    let sending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send(Message::notification("never", None)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close().await.unwrap();

    assert!(matches!(
        sending.await.unwrap(),
        Err(ChannelError::ClosedBeforeReady(_))
    ));
}

#[tokio::test]
async fn server_stop_resets_client_readiness() {
    let window = Window::new(APP);
    let server = tab_server(&window, "mcp-default");
    server.start().await.unwrap();
    let client = tab_client(&window, "mcp-default", None);
    client.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.is_ready());

    server.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!client.is_ready());

    let replacement = tab_server(&window, "mcp-default");
    let mut replacement_rx = collect(&replacement);
    replacement.start().await.unwrap();
    client
        .send(Message::notification("again", None))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut replacement_rx).await,
        Message::notification("again", None)
    );
}

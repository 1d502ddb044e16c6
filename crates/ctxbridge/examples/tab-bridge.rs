//! Same-window bridge: a page script calls a tool served by another script in
//! the same tab, then the page navigates away mid-call.
//!
//! Run with:
//!   cargo run --example tab-bridge

use std::time::Duration;

use ctxbridge::channel::{Channel, WindowChannel, WindowChannelConfig};
use ctxbridge::envelope::Message;
use ctxbridge::medium::Window;
use serde_json::json;
use tokio::sync::mpsc;

const ORIGIN: &str = "https://app.example";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let window = Window::new(ORIGIN);

    let server = WindowChannel::tab_server(
        window.clone(),
        WindowChannelConfig::tab().with_allowed_origins([ORIGIN]),
    )?;
    let (requests_tx, mut requests) = mpsc::unbounded_channel();
    server.set_on_message(move |msg| {
        let _ = requests_tx.send(msg);
    });

    let client = WindowChannel::tab_client(
        window.clone(),
        WindowChannelConfig::tab()
            .with_target_origin(ORIGIN)
            .with_request_timeout(Some(Duration::from_secs(2))),
    )?;
    let (replies_tx, mut replies) = mpsc::unbounded_channel();
    client.set_on_message(move |msg| {
        let _ = replies_tx.send(msg);
    });

    // Start order does not matter; the client waits for the server.
    client.start().await?;
    server.start().await?;

    client.send(Message::request(1, "tools/list", None)).await?;
    if let Some(request) = requests.recv().await {
        eprintln!("server got: {}", request.to_value());
        server
            .send(Message::result(1, json!({"tools": [{"name": "click"}]})))
            .await?;
    }
    if let Some(reply) = replies.recv().await {
        eprintln!("client got: {}", reply.to_value());
    }

    client
        .send(Message::request(2, "tools/call", Some(json!({"name": "click"}))))
        .await?;
    let _ = requests.recv().await;
    eprintln!("page navigating away with request 2 in flight");
    window.unload();
    if let Some(reply) = replies.recv().await {
        eprintln!("client got: {}", reply.to_value());
    }

    client.close().await?;
    server.close().await?;
    Ok(())
}

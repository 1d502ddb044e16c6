//! Extension background serving content-script ports, including a runtime
//! restart that drops every port and the client reconnecting on its own.
//!
//! Run with:
//!   cargo run --example extension-host

use std::time::Duration;

use ctxbridge::channel::{
    Channel, ExtensionHost, PortClientChannel, PortClientConfig, PortServerConfig,
    ReconnectPolicy,
};
use ctxbridge::envelope::Message;
use ctxbridge::medium::{PortHub, World};
use serde_json::json;

const PORT: &str = "mcp-extension";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let hub = PortHub::new();
    let mut host = ExtensionHost::listen(&hub, PORT, World::Extension, PortServerConfig::default())?;

    // Background: answer every request with the port it arrived on.
    let background = tokio::spawn(async move {
        while let Ok(channel) = host.accept().await {
            let port_id = channel.port_id();
            eprintln!("background: port {port_id} connected");
            let replier = std::sync::Arc::downgrade(&channel);
            channel.set_on_message(move |msg| {
                let Message::Request(request) = msg else {
                    return;
                };
                let Some(channel) = replier.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let reply = Message::result(request.id, json!({"servedBy": port_id}));
                    if let Err(err) = channel.send(reply).await {
                        eprintln!("background: reply failed: {err}");
                    }
                });
            });
            if let Err(err) = channel.start().await {
                eprintln!("background: start failed: {err}");
            }
        }
    });

    let client = PortClientChannel::extension(
        hub.clone(),
        PortClientConfig::extension()
            .with_origin("https://page.example")
            .with_reconnect(
                ReconnectPolicy::default().with_reconnect_delay(Duration::from_millis(50)),
            ),
    )?;
    let (tx, mut replies) = tokio::sync::mpsc::unbounded_channel();
    client.set_on_message(move |msg| {
        let _ = tx.send(msg);
    });
    client.start().await?;

    client.send(Message::request(1, "ping", None)).await?;
    if let Some(reply) = replies.recv().await {
        eprintln!("content script got: {}", reply.to_value());
    }

    eprintln!("runtime restarting; dropped {} port(s)", hub.drop_connections(PORT));
    client.send(Message::request(2, "ping", None)).await?;
    if let Some(reply) = replies.recv().await {
        eprintln!("content script got: {}", reply.to_value());
    }
    eprintln!("ports opened by the client: {}", client.connections());

    client.close().await?;
    background.abort();
    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use ctxbridge_channel::{Channel, StreamChannel, StreamChannelConfig};
use ctxbridge_envelope::{Message, Request, RpcError};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cmd::{install_ctrlc_handler, runtime, ServeArgs};
use crate::exit::{channel_error, CliResult, SUCCESS};

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
const MAX_SLEEP: Duration = Duration::from_secs(60);

enum Event {
    Message(Message),
    Closed,
}

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let runtime = runtime()?;
    let result = runtime.block_on(serve(args));
    // A stdin read may still be parked on a blocking thread after Ctrl-C.
    runtime.shutdown_background();
    result
}

async fn serve(args: ServeArgs) -> CliResult<i32> {
    let mut config = StreamChannelConfig::default();
    if let Some(max) = args.max_line_length {
        config = config.with_max_line_length(max);
    }
    let channel = Arc::new(
        StreamChannel::stdio_server(config).map_err(|err| channel_error("serve failed", err))?,
    );

    let (tx, mut events) = mpsc::unbounded_channel();
    let closed = tx.clone();
    channel.set_on_message(move |msg| {
        let _ = tx.send(Event::Message(msg));
    });
    channel.set_on_close(move || {
        let _ = closed.send(Event::Closed);
    });
    channel.set_on_error(|err| {
        tracing::warn!(error = %err, "dropping unreadable input");
    });

    let cancel = CancellationToken::new();
    install_ctrlc_handler(cancel.clone())?;

    channel
        .start()
        .await
        .map_err(|err| channel_error("serve failed", err))?;
    tracing::info!(name = %args.server_name, "serving on stdio");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(Event::Message(Message::Request(request))) => {
                dispatch(&channel, request, &args.server_name);
            }
            Some(Event::Message(Message::Notification(note))) => {
                tracing::debug!(method = %note.method, "notification");
            }
            Some(Event::Message(Message::Response(resp))) => {
                tracing::debug!(id = %resp.id, "ignoring response sent to server");
            }
            Some(Event::Closed) | None => break,
        }
    }

    tracing::info!("input closed; shutting down");
    channel
        .close()
        .await
        .map_err(|err| channel_error("shutdown failed", err))?;
    Ok(SUCCESS)
}

fn dispatch(channel: &Arc<StreamChannel>, request: Request, server_name: &str) {
    tracing::debug!(id = %request.id, method = %request.method, "request");
    if request.method == "sleep" {
        let channel = Arc::clone(channel);
        tokio::spawn(async move {
            let reply = match sleep_duration(request.params.as_ref()) {
                Ok(duration) => {
                    tokio::time::sleep(duration).await;
                    Message::result(request.id, json!({"sleptMs": duration.as_millis() as u64}))
                }
                Err(error) => Message::error(request.id, error),
            };
            reply_with(&channel, reply).await;
        });
        return;
    }

    let reply = respond(&request, server_name);
    let channel = Arc::clone(channel);
    tokio::spawn(async move { reply_with(&channel, reply).await });
}

async fn reply_with(channel: &StreamChannel, reply: Message) {
    if let Err(err) = channel.send(reply).await {
        tracing::debug!(error = %err, "response not delivered");
    }
}

fn respond(request: &Request, server_name: &str) -> Message {
    let id = request.id.clone();
    match request.method.as_str() {
        "ping" => Message::result(id, json!({})),
        "echo" => Message::result(id, request.params.clone().unwrap_or(Value::Null)),
        "initialize" => {
            let version = request
                .params
                .as_ref()
                .and_then(|p| p.get("protocolVersion"))
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_PROTOCOL_VERSION);
            Message::result(
                id,
                json!({
                    "protocolVersion": version,
                    "capabilities": {},
                    "serverInfo": {"name": server_name, "version": env!("CARGO_PKG_VERSION")},
                }),
            )
        }
        other => Message::error(
            id,
            RpcError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {other}"),
                data: None,
            },
        ),
    }
}

fn sleep_duration(params: Option<&Value>) -> Result<Duration, RpcError> {
    let ms = params
        .and_then(|p| p.get("ms"))
        .and_then(Value::as_u64)
        .ok_or_else(|| RpcError {
            code: INVALID_PARAMS,
            message: "sleep expects {\"ms\": <non-negative integer>}".to_string(),
            data: None,
        })?;
    Ok(Duration::from_millis(ms).min(MAX_SLEEP))
}

#[cfg(test)]
mod tests {
    use ctxbridge_envelope::RequestId;

    use super::*;

    fn request(method: &str, params: Option<Value>) -> Request {
        match Message::request(1, method, params) {
            Message::Request(req) => req,
            _ => unreachable!(),
        }
    }

    #[test]
    fn known_methods() {
        assert_eq!(
            respond(&request("ping", None), "t"),
            Message::result(1, json!({}))
        );
        assert_eq!(
            respond(&request("echo", Some(json!({"a": [1, 2]}))), "t"),
            Message::result(1, json!({"a": [1, 2]}))
        );

        let Message::Response(init) = respond(
            &request("initialize", Some(json!({"protocolVersion": "2025-03-26"}))),
            "bridge",
        ) else {
            panic!("initialize should answer");
        };
        let result = init.result().unwrap();
        assert_eq!(result["protocolVersion"], json!("2025-03-26"));
        assert_eq!(result["serverInfo"]["name"], json!("bridge"));
    }

    #[test]
    fn unknown_method_is_method_not_found() {
        let Message::Response(resp) = respond(&request("tools/destroy", None), "t") else {
            panic!("expected response");
        };
        assert_eq!(resp.id, RequestId::Number(1));
        assert_eq!(resp.error().unwrap().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn sleep_params() {
        assert_eq!(
            sleep_duration(Some(&json!({"ms": 25}))).unwrap(),
            Duration::from_millis(25)
        );
        assert_eq!(
            sleep_duration(Some(&json!({"ms": 3_600_000}))).unwrap(),
            MAX_SLEEP
        );
        assert_eq!(sleep_duration(None).unwrap_err().code, INVALID_PARAMS);
    }
}

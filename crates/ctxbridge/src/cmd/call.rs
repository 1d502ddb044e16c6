use std::time::{Duration, Instant};

use ctxbridge_channel::{Channel, StreamChannel, StreamChannelConfig, TransportState};
use ctxbridge_envelope::{Message, RequestId, Response, TIMEOUT_ERROR_CODE};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cmd::{parse_duration, runtime, CallArgs};
use crate::exit::{channel_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, TRANSPORT_ERROR, USAGE};
use crate::output::{print_response, OutputFormat};

const CALL_ID: i64 = 1;

enum Event {
    Message(Message),
    Closed,
}

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let params = parse_params(args.params.as_deref())?;
    let message = if args.notify {
        Message::notification(args.method.as_str(), params)
    } else {
        Message::request(CALL_ID, args.method.as_str(), params)
    };

    let runtime = runtime()?;
    let result = runtime.block_on(call(&args.server, timeout, message));
    runtime.shutdown_background();

    let Some((response, elapsed)) = result? else {
        return Ok(SUCCESS);
    };
    print_response(&response, &args.method, elapsed, format);
    Ok(exit_code(&response))
}

async fn call(
    server: &[String],
    timeout: Duration,
    message: Message,
) -> CliResult<Option<(Response, Duration)>> {
    let Some((program, server_args)) = server.split_first() else {
        return Err(CliError::new(USAGE, "missing server program"));
    };
    let config = StreamChannelConfig::default().with_request_timeout(Some(timeout));
    let channel = StreamChannel::stdio_client(program, server_args, config)
        .map_err(|err| channel_error("spawn failed", err))?;
    tracing::debug!(program, pid = ?channel.child_id(), "server spawned");

    let outcome = exchange(&channel, message).await;
    channel
        .close()
        .await
        .map_err(|err| channel_error("shutdown failed", err))?;
    outcome
}

/// Send `message` and, for requests, wait for the matching response. The
/// channel answers with a synthesized error if the server stays silent past
/// the request timeout.
async fn exchange(
    channel: &StreamChannel,
    message: Message,
) -> CliResult<Option<(Response, Duration)>> {
    let (tx, mut events) = mpsc::unbounded_channel();
    let closed = tx.clone();
    channel.set_on_message(move |msg| {
        let _ = tx.send(Event::Message(msg));
    });
    channel.set_on_close(move || {
        let _ = closed.send(Event::Closed);
    });
    channel.set_on_error(|err| {
        tracing::warn!(error = %err, "unreadable server output");
    });

    channel
        .start()
        .await
        .map_err(|err| channel_error("start failed", err))?;

    let expects_reply = message.is_request();
    let started = Instant::now();
    if let Err(err) = channel.send(message).await {
        if channel.state() == TransportState::Closed {
            return Err(CliError::new(
                TRANSPORT_ERROR,
                "server exited before the request was sent",
            ));
        }
        return Err(channel_error("send failed", err));
    }
    if !expects_reply {
        return Ok(None);
    }

    let wanted = RequestId::Number(CALL_ID);
    while let Some(event) = events.recv().await {
        match event {
            Event::Message(Message::Response(response)) if response.id == wanted => {
                return Ok(Some((response, started.elapsed())));
            }
            Event::Message(other) => {
                tracing::debug!(method = ?other.method(), "ignoring server message");
            }
            Event::Closed => break,
        }
    }
    Err(CliError::new(
        TRANSPORT_ERROR,
        "server closed its output before responding",
    ))
}

fn parse_params(raw: Option<&str>) -> CliResult<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| CliError::new(USAGE, format!("--params is not valid JSON: {err}")))?;
    if !(value.is_object() || value.is_array()) {
        return Err(CliError::new(
            USAGE,
            "--params must be a JSON object or array",
        ));
    }
    Ok(Some(value))
}

fn exit_code(response: &Response) -> i32 {
    match response.error() {
        None => SUCCESS,
        Some(err) if is_synthesized_timeout(err.code, err.data.as_ref()) => TIMEOUT,
        Some(_) => FAILURE,
    }
}

fn is_synthesized_timeout(code: i64, data: Option<&Value>) -> bool {
    code == TIMEOUT_ERROR_CODE && data.is_some_and(|d| d.get("timeoutMs").is_some())
}

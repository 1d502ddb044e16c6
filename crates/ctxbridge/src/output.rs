use std::io::{IsTerminal, Write};
use std::time::Duration;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use ctxbridge_envelope::{Outcome, RequestId, Response, RpcError};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct CallOutput<'a> {
    id: &'a RequestId,
    method: &'a str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RpcError>,
    elapsed_ms: u64,
}

/// Print the response to a `call`.
pub fn print_response(response: &Response, method: &str, elapsed: Duration, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = CallOutput {
                id: &response.id,
                method,
                ok: response.result().is_some(),
                result: response.result(),
                error: response.error(),
                elapsed_ms: elapsed.as_millis() as u64,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let (outcome, body) = match &response.outcome {
                Outcome::Result(result) => ("result".to_string(), compact(result)),
                Outcome::Error(error) => (format!("error {}", error.code), error.message.clone()),
            };
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "METHOD", "OUTCOME", "ELAPSED", "BODY"])
                .add_row(vec![
                    response.id.to_string(),
                    method.to_string(),
                    outcome,
                    format!("{}ms", elapsed.as_millis()),
                    body,
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => match &response.outcome {
            Outcome::Result(result) => println!(
                "{}",
                serde_json::to_string_pretty(result).unwrap_or_else(|_| compact(result))
            ),
            Outcome::Error(error) => {
                println!("error {}: {}", error.code, error.message);
                if let Some(data) = &error.data {
                    println!("data: {}", compact(data));
                }
            }
        },
        OutputFormat::Raw => {
            let body = match &response.outcome {
                Outcome::Result(result) => compact(result),
                Outcome::Error(error) => compact(&serde_json::to_value(error).unwrap_or(Value::Null)),
            };
            print_raw(format!("{body}\n").as_bytes());
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

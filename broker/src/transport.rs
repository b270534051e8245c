//! NDJSON stdio transport loop (§1's "out of scope" transport, made
//! concrete per §10-13): one JSON-RPC request per line in on stdin, one
//! response per line out on stdout, with broker-originated notifications
//! (transfer progress, terminal data, tunnel closure) interleaved.
//!
//! stdout carries only the wire protocol; every log line goes to stderr
//! through `tracing` (§10).

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatch::Dispatcher;
use crate::protocol::errors;
use crate::protocol::messages::{JsonRpcErrorResponse, JsonRpcNotification, JsonRpcRequest};

/// Generous but bounded; guards against a malformed or hostile peer wedging
/// the line reader on an unbounded buffer.
const MAX_LINE_SIZE: usize = 4 * 1024 * 1024;

pub async fn run_stdio_loop(dispatcher: Dispatcher, shutdown: CancellationToken) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut reader = BufReader::new(stdin);
    let mut notifications = dispatcher.subscribe_notifications();

    run_transport_loop(&mut reader, &mut stdout, &dispatcher, &mut notifications, shutdown).await
}

async fn run_transport_loop<R, W>(
    reader: &mut R,
    writer: &mut W,
    dispatcher: &Dispatcher,
    notifications: &mut tokio::sync::mpsc::UnboundedReceiver<JsonRpcNotification>,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut line = String::new();

    loop {
        line.clear();

        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("shutdown signal received, exiting transport loop");
                break;
            }

            result = reader.read_line(&mut line) => {
                let bytes_read = result?;
                if bytes_read == 0 {
                    debug!("stdin closed (EOF), exiting transport loop");
                    break;
                }

                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                if trimmed.len() > MAX_LINE_SIZE {
                    warn!(bytes = trimmed.len(), "request exceeds line size limit");
                    let err = JsonRpcErrorResponse::new(serde_json::Value::Null, errors::PARSE_ERROR, "request exceeds line size limit");
                    write_json(writer, &serde_json::to_value(&err)?).await?;
                    continue;
                }

                let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "failed to parse JSON-RPC request");
                        let err = JsonRpcErrorResponse::new(serde_json::Value::Null, errors::PARSE_ERROR, format!("parse error: {e}"));
                        write_json(writer, &serde_json::to_value(&err)?).await?;
                        continue;
                    }
                };

                if request.jsonrpc != "2.0" {
                    let err = JsonRpcErrorResponse::new(request.id, errors::INVALID_REQUEST, "invalid JSON-RPC version (must be \"2.0\")");
                    write_json(writer, &serde_json::to_value(&err)?).await?;
                    continue;
                }

                let response = dispatcher.dispatch(request).await;
                write_json(writer, &response.to_json()).await?;
            }

            Some(notification) = notifications.recv() => {
                write_json(writer, &serde_json::to_value(&notification)?).await?;
            }
        }
    }

    Ok(())
}

async fn write_json<W: AsyncWriteExt + Unpin>(writer: &mut W, value: &serde_json::Value) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_json_appends_single_newline() {
        let mut buf: Vec<u8> = Vec::new();
        write_json(&mut buf, &serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {}})).await.unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert_eq!(output.matches('\n').count(), 1);
        assert!(output.ends_with('\n'));
    }
}

//! Line-delimited transports
//!
//! stdio is always served. A local socket (named pipe on Windows, abstract
//! or file socket elsewhere) can be added so other processes can drive the
//! same session.

use super::tools::Dispatcher;
use super::{Request, Response, RpcError};
use anyhow::{Context, Result};
use interprocess::local_socket::{
    traits::ListenerExt, GenericNamespaced, ListenerOptions, Stream as LocalStream, ToNsName,
};
use interprocess::TryClone;
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Process one request line. Returns the response line, if one is owed.
pub async fn handle_line(dispatcher: &Dispatcher, line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let response = match serde_json::from_str::<Value>(line) {
        Err(e) => Some(Response::failure(
            Value::Null,
            RpcError::parse_error(e.to_string()),
        )),
        Ok(value) => handle_value(dispatcher, value).await,
    }?;

    match serde_json::to_string(&response) {
        Ok(text) => Some(text),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            None
        }
    }
}

async fn handle_value(dispatcher: &Dispatcher, value: Value) -> Option<Response> {
    let id = value.get("id").cloned();
    let request: Request = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return Some(Response::failure(
                id.unwrap_or(Value::Null),
                RpcError::invalid_request(e.to_string()),
            ))
        }
    };
    if let Some(version) = request.jsonrpc.as_deref().filter(|v| *v != "2.0") {
        return Some(Response::failure(
            id.unwrap_or(Value::Null),
            RpcError::invalid_request(format!("unsupported jsonrpc version {}", version)),
        ));
    }

    let result = dispatcher
        .call(&request.method, request.params.unwrap_or(Value::Null))
        .await;

    // Notifications get no reply, even on failure
    let id = request.id?;
    Some(match result {
        Ok(result) => Response::success(id, result),
        Err(error) => {
            debug!("{} failed: {}", request.method, error.message);
            Response::failure(id, error)
        }
    })
}

/// Serve requests from stdin until it closes
pub async fn serve_stdio(dispatcher: Dispatcher) -> Result<()> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    info!("Serving JSON-RPC on stdio");

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if let Some(response) = handle_line(&dispatcher, &line).await {
            stdout.write_all(response.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }
    info!("stdin closed");
    Ok(())
}

/// Accept local socket clients on a background thread, one thread per
/// connection. Requests run on the given runtime.
pub fn spawn_local_socket(name: &str, dispatcher: Dispatcher, runtime: Handle) -> Result<()> {
    let socket_name = name
        .to_string()
        .to_ns_name::<GenericNamespaced>()
        .with_context(|| format!("Invalid socket name {}", name))?;
    let listener = ListenerOptions::new()
        .name(socket_name)
        .create_sync()
        .with_context(|| format!("Failed to listen on {}", name))?;
    info!("Serving JSON-RPC on local socket {}", name);

    std::thread::spawn(move || {
        for conn in listener.incoming().filter_map(|x| x.ok()) {
            info!("Local socket client connected");
            let dispatcher = dispatcher.clone();
            let runtime = runtime.clone();
            std::thread::spawn(move || {
                if let Err(e) = handle_connection(conn, &dispatcher, &runtime) {
                    warn!("Local socket connection error: {}", e);
                }
            });
        }
    });
    Ok(())
}

fn handle_connection(mut stream: LocalStream, dispatcher: &Dispatcher, runtime: &Handle) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut buffer = String::new();

    loop {
        buffer.clear();
        match reader.read_line(&mut buffer) {
            Ok(0) => break,
            Ok(_) => {
                if let Some(response) = runtime.block_on(handle_line(dispatcher, &buffer)) {
                    stream.write_all(response.as_bytes())?;
                    stream.write_all(b"\n")?;
                    stream.flush()?;
                }
            }
            Err(e) => {
                error!("Read error: {}", e);
                break;
            }
        }
    }
    info!("Local socket client disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::FakeHost;
    use crate::infrastructure::bluetooth::host::host_event_channel;
    use crate::infrastructure::bluetooth::{BluetoothService, SessionConfig};
    use std::sync::Arc;
    use std::time::Duration;

    fn dispatcher() -> Dispatcher {
        let (tx, rx) = host_event_channel();
        let host = Arc::new(FakeHost::fitness_bike(tx));
        let service = BluetoothService::spawn(host, rx, SessionConfig::default());
        Dispatcher::new(service, Duration::from_secs(1))
    }

    fn parse(line: Option<String>) -> Value {
        serde_json::from_str(&line.expect("response expected")).unwrap()
    }

    #[tokio::test]
    async fn test_parse_error() {
        let d = dispatcher();
        let response = parse(handle_line(&d, "{not json").await);
        assert_eq!(response["error"]["code"], -32700);
        assert_eq!(response["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_invalid_request() {
        let d = dispatcher();
        let response = parse(handle_line(&d, r#"{"jsonrpc":"2.0","id":3}"#).await);
        assert_eq!(response["error"]["code"], -32600);
        assert_eq!(response["id"], 3);

        let response = parse(handle_line(&d, r#"[1,2]"#).await);
        assert_eq!(response["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let d = dispatcher();
        let response = parse(handle_line(&d, r#"{"jsonrpc":"2.0","id":"a","method":"nope"}"#).await);
        assert_eq!(response["error"]["code"], -32601);
        assert_eq!(response["id"], "a");
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let d = dispatcher();
        assert_eq!(handle_line(&d, r#"{"jsonrpc":"2.0","method":"ble_status"}"#).await, None);
        assert_eq!(handle_line(&d, "   ").await, None);
    }

    #[tokio::test]
    async fn test_tools_list() {
        let d = dispatcher();
        let response = parse(handle_line(&d, r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).await);
        let tools = response["result"]["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "ftms_set_power"));
        assert!(tools[0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn test_operation_failure_carries_kind() {
        let d = dispatcher();
        let response = parse(
            handle_line(&d, r#"{"jsonrpc":"2.0","id":2,"method":"ble_get_services"}"#).await,
        );
        assert_eq!(response["error"]["code"], -32000);
        assert_eq!(response["error"]["data"]["kind"], "NotConnected");
    }
}

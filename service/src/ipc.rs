//! Unix domain socket IPC listener.
//!
//! Accepts connections on the control socket and dispatches
//! JSON-RPC-lite messages to the [`Supervisor`].

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use crate::PROTOCOL_VERSION;
use crate::error::SupervisorError;
use crate::protocol::*;
use crate::registry::Supervisor;

type RpcResult = Result<serde_json::Value, (i64, String)>;

/// Bind the control socket at `path`, replacing a stale socket file.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!("bothost-service listening on {}", path.display());
    Ok(listener)
}

/// Serve connections until `shutdown` flips to `true`.
///
/// Each connection is handled on its own task; reads newline-delimited
/// requests and writes one response line per request.
pub async fn serve(
    supervisor: Supervisor,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let sup = supervisor.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(sup, stream).await {
                            tracing::warn!("Connection error: {e}");
                        }
                    });
                }
                Err(e) => tracing::error!("Accept error: {e}"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("IPC listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Requests longer than this are answered with an error and the connection
/// is closed.
const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Serve one client: one response line per request line, in order.
async fn handle_connection(supervisor: Supervisor, stream: UnixStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut served = 0usize;

    while let Some(line) = lines.next_line().await? {
        let request = line.trim();
        if request.is_empty() {
            continue;
        }
        if request.len() > MAX_REQUEST_BYTES {
            let reply = to_value(&RpcErrorResponse {
                id: RequestId::Integer(0),
                error: RpcError {
                    code: ERR_INVALID_REQUEST,
                    message: format!("Request exceeds {MAX_REQUEST_BYTES} bytes"),
                },
            });
            write_reply(&mut writer, &reply).await?;
            break;
        }

        let reply = dispatch_message(&supervisor, request).await;
        write_reply(&mut writer, &reply).await?;
        served += 1;
    }

    tracing::debug!("Client disconnected after {served} request(s)");
    Ok(())
}

async fn write_reply(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    reply: &serde_json::Value,
) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(reply).map_err(std::io::Error::other)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Parse and dispatch a single request line.
pub async fn dispatch_message(supervisor: &Supervisor, raw: &str) -> serde_json::Value {
    let request: RpcRequest = match serde_json::from_str(raw) {
        Ok(req) => req,
        Err(e) => {
            return to_value(&RpcErrorResponse {
                id: RequestId::Integer(0),
                error: RpcError {
                    code: ERR_INVALID_REQUEST,
                    message: format!("Invalid JSON-RPC: {e}"),
                },
            });
        }
    };

    let id = request.id.clone();
    match dispatch_method(supervisor, &request.method, request.params).await {
        Ok(result) => to_value(&RpcResponse { id, result }),
        Err((code, message)) => to_value(&RpcErrorResponse {
            id,
            error: RpcError { code, message },
        }),
    }
}

async fn dispatch_method(
    sup: &Supervisor,
    method: &str,
    params: Option<serde_json::Value>,
) -> RpcResult {
    tracing::debug!("IPC request: {method}");
    match method {
        METHOD_HELLO => handle_hello(params),
        METHOD_PROJECT_CREATE => {
            let p: ProjectIdParams = parse(method, params)?;
            sup.create_project(&p.id).await.map_err(rpc_error)?;
            ok(&sup.info(&p.id).await.map_err(rpc_error)?)
        }
        METHOD_PROJECT_REGISTER => {
            let p: RegisterParams = parse(method, params)?;
            let command = p
                .command
                .unwrap_or_else(|| sup.config().default_command.clone());
            sup.register(&p.id, p.root, &command)
                .await
                .map_err(rpc_error)?;
            ok(&sup.info(&p.id).await.map_err(rpc_error)?)
        }
        METHOD_PROJECT_REMOVE => {
            let p: ProjectIdParams = parse(method, params)?;
            sup.remove(&p.id).await.map_err(rpc_error)?;
            ok(&RemoveResult {
                id: p.id,
                removed: true,
            })
        }
        METHOD_PROJECT_LIST => ok(&ProjectListResult {
            projects: sup.list_info().await,
        }),
        METHOD_PROJECT_GET => {
            let p: ProjectIdParams = parse(method, params)?;
            ok(&sup.info(&p.id).await.map_err(rpc_error)?)
        }
        METHOD_PROJECT_SET_COMMAND => {
            let p: SetCommandParams = parse(method, params)?;
            ok(&sup
                .update_command(&p.id, &p.command)
                .await
                .map_err(rpc_error)?)
        }
        METHOD_PROJECT_START => {
            let p: ProjectIdParams = parse(method, params)?;
            ok(&sup.start(&p.id).await.map_err(rpc_error)?)
        }
        METHOD_PROJECT_STOP => {
            let p: ProjectIdParams = parse(method, params)?;
            ok(&sup.stop(&p.id).await.map_err(rpc_error)?)
        }
        METHOD_PROJECT_RESTART => {
            let p: ProjectIdParams = parse(method, params)?;
            ok(&sup.restart(&p.id).await.map_err(rpc_error)?)
        }
        METHOD_PROJECT_STATUS => {
            let p: ProjectIdParams = parse(method, params)?;
            ok(&sup.status(&p.id).await.map_err(rpc_error)?)
        }
        METHOD_PROJECT_LOGS => {
            let p: LogsParams = parse(method, params)?;
            let entries = sup.logs(&p.id, p.lines).await.map_err(rpc_error)?;
            ok(&LogsResult { id: p.id, entries })
        }
        METHOD_PROJECT_USAGE => {
            let p: ProjectIdParams = parse(method, params)?;
            let usage = sup.usage(&p.id).await.map_err(rpc_error)?;
            ok(&UsageResult { id: p.id, usage })
        }
        METHOD_PROJECT_INSTALL => {
            let p: ProjectIdParams = parse(method, params)?;
            ok(&sup.install_dependencies(&p.id).await.map_err(rpc_error)?)
        }
        METHOD_SERVICE_STATUS => ok(&sup.service_status().await),
        _ => Err((ERR_METHOD_NOT_FOUND, format!("Unknown method: {method}"))),
    }
}

/// Handle the `hello` handshake.
fn handle_hello(params: Option<serde_json::Value>) -> RpcResult {
    let hello: HelloParams = parse(METHOD_HELLO, params)?;

    if hello.protocol_version != PROTOCOL_VERSION {
        return Err((
            ERR_INVALID_PARAMS,
            format!(
                "Incompatible protocol version: client={}, service={}",
                hello.protocol_version, PROTOCOL_VERSION
            ),
        ));
    }
    tracing::debug!("Client {} connected", hello.client_version);

    ok(&HelloResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: CAPABILITIES.iter().map(ToString::to_string).collect(),
    })
}

fn parse<T: DeserializeOwned>(
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<T, (i64, String)> {
    params
        .ok_or_else(|| (ERR_INVALID_PARAMS, "Missing params".to_string()))
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| (ERR_INVALID_PARAMS, format!("Invalid {method} params: {e}")))
        })
}

fn ok<T: Serialize>(value: &T) -> RpcResult {
    serde_json::to_value(value).map_err(|e| (ERR_INFRA, format!("Serialize error: {e}")))
}

fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_default()
}

/// Map a supervisor failure to a JSON-RPC error (code, message).
fn rpc_error(err: SupervisorError) -> (i64, String) {
    (err.code(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use pretty_assertions::assert_eq;

    fn supervisor(dir: &Path) -> Supervisor {
        Supervisor::load(SupervisorConfig {
            projects_dir: dir.join("projects"),
            logs_dir: dir.join("logs"),
            ..SupervisorConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn dispatch_hello() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = supervisor(tmp.path());
        let msg = serde_json::json!({
            "id": 0,
            "method": "hello",
            "params": { "protocol_version": "1.0", "client_version": "0.1.0" }
        });

        let result = dispatch_message(&sup, &msg.to_string()).await;
        assert_eq!(result["result"]["protocol_version"], "1.0");
        assert!(
            result["result"]["capabilities"]
                .as_array()
                .unwrap()
                .contains(&serde_json::json!("project.start"))
        );
    }

    #[tokio::test]
    async fn dispatch_rejects_protocol_mismatch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = supervisor(tmp.path());
        let msg = serde_json::json!({
            "id": 0,
            "method": "hello",
            "params": { "protocol_version": "0.9", "client_version": "old" }
        });

        let result = dispatch_message(&sup, &msg.to_string()).await;
        assert_eq!(result["error"]["code"], ERR_INVALID_PARAMS);
    }

    #[tokio::test]
    async fn dispatch_unknown_method() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = supervisor(tmp.path());
        let msg = serde_json::json!({ "id": 1, "method": "unknown.method" });

        let result = dispatch_message(&sup, &msg.to_string()).await;
        assert_eq!(result["id"], 1);
        assert_eq!(result["error"]["code"], ERR_METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn dispatch_garbage_is_invalid_request() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = supervisor(tmp.path());

        let result = dispatch_message(&sup, "not json").await;
        assert_eq!(result["error"]["code"], ERR_INVALID_REQUEST);
    }

    #[tokio::test]
    async fn dispatch_missing_params() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = supervisor(tmp.path());
        let msg = serde_json::json!({ "id": 2, "method": "project.start" });

        let result = dispatch_message(&sup, &msg.to_string()).await;
        assert_eq!(result["error"]["code"], ERR_INVALID_PARAMS);
    }

    #[tokio::test]
    async fn supervisor_errors_keep_their_codes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = supervisor(tmp.path());

        let msg = serde_json::json!({
            "id": 3, "method": "project.status", "params": { "id": "ghost" }
        });
        let result = dispatch_message(&sup, &msg.to_string()).await;
        assert_eq!(result["error"]["code"], ERR_NOT_FOUND);

        let msg = serde_json::json!({
            "id": 4, "method": "project.create", "params": { "id": "../up" }
        });
        let result = dispatch_message(&sup, &msg.to_string()).await;
        assert_eq!(result["error"]["code"], ERR_INVALID_IDENTIFIER);
    }

    #[tokio::test]
    async fn oversized_request_is_rejected_and_connection_closed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = supervisor(tmp.path());
        let (client, server) = UnixStream::pair().unwrap();
        let conn = tokio::spawn(handle_connection(sup, server));

        let (reader, mut writer) = client.into_split();
        let mut huge = vec![b'x'; MAX_REQUEST_BYTES + 1];
        huge.push(b'\n');
        writer.write_all(&huge).await.unwrap();

        let mut lines = BufReader::new(reader).lines();
        let reply: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], ERR_INVALID_REQUEST);
        assert_eq!(lines.next_line().await.unwrap(), None);
        conn.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dispatch_service_status() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = supervisor(tmp.path());
        let msg = serde_json::json!({ "id": 5, "method": "service.status" });

        let result = dispatch_message(&sup, &msg.to_string()).await;
        assert_eq!(result["result"]["projects"], 0);
        assert_eq!(result["result"]["running"], 0);
    }
}

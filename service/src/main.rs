//! `bothost-service` entry point.
//!
//! ## Modes
//!
//! - **Service mode** (default): load configuration and `projects.json`,
//!   bind the control socket, serve until SIGINT/SIGTERM, then stop every
//!   live project before exiting.
//! - **`--ping`**: connect to the running service socket, send a hello
//!   handshake, verify the response, then exit. Suitable as a health check.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use bothost_service::PROTOCOL_VERSION;
use bothost_service::config::{ConfigLoader, SupervisorConfig};
use bothost_service::protocol::{HelloParams, METHOD_HELLO, RequestId, RpcReply, RpcRequest};
use bothost_service::registry::Supervisor;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Health check: handshake with a running service and report its version.
fn ping(config: &SupervisorConfig) -> std::io::Result<()> {
    let path = config.socket_path();
    let stream = UnixStream::connect(&path).map_err(|e| {
        std::io::Error::other(format!("ping: no service at {}: {e}", path.display()))
    })?;
    stream.set_read_timeout(Some(PING_TIMEOUT))?;
    stream.set_write_timeout(Some(PING_TIMEOUT))?;

    let request = RpcRequest {
        id: RequestId::String("ping".to_string()),
        method: METHOD_HELLO.to_string(),
        params: serde_json::to_value(HelloParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            client_version: format!("ping/{}", env!("CARGO_PKG_VERSION")),
        })
        .ok(),
    };
    let mut bytes = serde_json::to_vec(&request).map_err(std::io::Error::other)?;
    bytes.push(b'\n');
    (&stream).write_all(&bytes)?;

    let mut line = String::new();
    BufReader::new(&stream).read_line(&mut line)?;
    let reply: RpcReply = serde_json::from_str(line.trim())
        .map_err(|e| std::io::Error::other(format!("ping: unreadable reply: {e}")))?;
    match reply {
        RpcReply::Ok(ok) => {
            let version = ok
                .result
                .get("service_version")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown");
            eprintln!("ping: bothost-service v{version} is alive at {}", path.display());
            Ok(())
        }
        RpcReply::Err(err) => Err(std::io::Error::other(format!(
            "ping: handshake refused ({}): {}",
            err.error.code, err.error.message
        ))),
    }
}

/// Install the global subscriber. Logs go to `log_file` when configured,
/// stderr otherwise. The returned guard flushes the file writer on drop.
fn init_tracing(config: &SupervisorConfig) -> std::io::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(path) = &config.log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(Some(guard))
}

fn main() -> std::io::Result<()> {
    let config = ConfigLoader::new()
        .load()
        .map_err(|e| std::io::Error::other(format!("Failed to load configuration: {e}")))?;

    if std::env::args().nth(1).as_deref() == Some("--ping") {
        return ping(&config);
    }

    let _guard = init_tracing(&config)?;
    run_service(config)
}

#[tokio::main]
async fn run_service(config: SupervisorConfig) -> std::io::Result<()> {
    tracing::info!("bothost-service v{} starting", env!("CARGO_PKG_VERSION"));

    let socket_path = config.socket_path();
    let supervisor = Supervisor::load(config)
        .map_err(|e| std::io::Error::other(format!("Failed to load projects: {e}")))?;

    let listener = bothost_service::ipc::bind(&socket_path)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received, shutting down"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    bothost_service::ipc::serve(supervisor.clone(), listener, shutdown_rx).await?;

    supervisor.shutdown().await;
    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!("Could not remove socket {}: {e}", socket_path.display());
    }

    tracing::info!("bothost-service exiting cleanly");
    Ok(())
}

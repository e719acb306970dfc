#![allow(clippy::unwrap_used, clippy::expect_used)]
//! CLI commands against a live service on a temp socket.

use std::path::Path;
use std::time::Duration;

use bothost_cli::{Cli, ClientError, RpcClient};
use bothost_service::config::SupervisorConfig;
use bothost_service::protocol::ERR_ALREADY_RUNNING;
use bothost_service::registry::Supervisor;
use clap::Parser;
use pretty_assertions::assert_eq;
use tokio::sync::watch;

/// Parse `args` and run the command from a blocking thread, since the
/// client uses std sockets.
async fn bothost(socket: &Path, args: &[&str]) -> Result<String, ClientError> {
    let mut argv = vec![
        "bothost".to_string(),
        "--socket".to_string(),
        socket.display().to_string(),
    ];
    argv.extend(args.iter().map(ToString::to_string));
    tokio::task::spawn_blocking(move || Cli::try_parse_from(argv).unwrap().run())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn operator_session_over_the_socket() {
    let tmp = tempfile::TempDir::new().unwrap();
    let socket = tmp.path().join("cli.sock");
    let supervisor = Supervisor::load(SupervisorConfig {
        projects_dir: tmp.path().join("projects"),
        logs_dir: tmp.path().join("logs"),
        start_grace: Duration::from_millis(200),
        stop_timeout: Duration::from_secs(2),
        default_command: "sh bot.sh".to_string(),
        ..SupervisorConfig::default()
    })
    .unwrap();
    let listener = bothost_service::ipc::bind(&socket).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(bothost_service::ipc::serve(
        supervisor.clone(),
        listener,
        shutdown_rx,
    ));

    assert_eq!(bothost(&socket, &["list"]).await.unwrap(), "No projects");

    let created = bothost(&socket, &["create", "echo-bot"]).await.unwrap();
    assert!(created.starts_with("Created echo-bot at "), "{created}");
    std::fs::write(
        tmp.path().join("projects/echo-bot/bot.sh"),
        "echo hello from echo-bot\nexec sleep 30\n",
    )
    .unwrap();

    let started = bothost(&socket, &["start", "echo-bot"]).await.unwrap();
    assert!(started.starts_with("echo-bot started with PID "), "{started}");

    let err = bothost(&socket, &["start", "echo-bot"]).await.unwrap_err();
    assert!(matches!(err, ClientError::Rpc { code, .. } if code == ERR_ALREADY_RUNNING));

    let status = bothost(&socket, &["status", "echo-bot"]).await.unwrap();
    assert!(status.starts_with("echo-bot: Running (PID: "), "{status}");
    assert!(status.contains("command: sh bot.sh"), "{status}");

    let mut logs = String::new();
    for _ in 0..40 {
        logs = bothost(&socket, &["logs", "echo-bot", "-n", "20"]).await.unwrap();
        if logs.contains("hello from echo-bot") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(logs.contains("hello from echo-bot"), "{logs}");

    let usage = bothost(&socket, &["usage", "echo-bot", "--json"]).await.unwrap();
    let usage: serde_json::Value = serde_json::from_str(&usage).unwrap();
    assert_eq!(usage["id"], "echo-bot");
    assert!(usage["memory_bytes"].as_u64().unwrap() > 0);

    let service = bothost(&socket, &["service"]).await.unwrap();
    assert!(service.ends_with("1 project(s), 1 live"), "{service}");

    let stopped = bothost(&socket, &["stop", "echo-bot"]).await.unwrap();
    assert_eq!(stopped, "echo-bot stopped successfully");

    let missing = bothost(&socket, &["install", "echo-bot"]).await.unwrap_err();
    assert!(
        missing.to_string().contains("requirements.txt not found"),
        "{missing}"
    );

    let removed = bothost(&socket, &["remove", "echo-bot"]).await.unwrap();
    assert_eq!(removed, "echo-bot removed");
    assert_eq!(bothost(&socket, &["list"]).await.unwrap(), "No projects");

    shutdown_tx.send(true).unwrap();
    server.await.unwrap().unwrap();
    supervisor.shutdown().await;
}

#[test]
fn connect_error_names_the_socket() {
    let tmp = tempfile::TempDir::new().unwrap();
    let socket = tmp.path().join("absent.sock");
    let Err(err) = RpcClient::connect(&socket) else {
        panic!("connect should fail without a service");
    };
    assert!(matches!(err, ClientError::Connect { .. }));
    assert!(err.to_string().contains("absent.sock"), "{err}");
}

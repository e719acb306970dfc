//! `bothost` operator CLI.
//!
//! Thin IPC client that connects to `bothost-service` via Unix socket and
//! dispatches one JSON-RPC-lite request per subcommand.
//!
//! ## Commands
//!
//! - `bothost create <ID>` / `bothost register <ID> <ROOT> [--command CMD]`
//! - `bothost start|stop|restart|status|usage|install|remove <ID>`
//! - `bothost logs <ID> [-n N]`
//! - `bothost set-command <ID> <CMD>`
//! - `bothost list`, `bothost service`

pub mod client;

use std::path::PathBuf;

use bothost_service::lifecycle::LifecycleRecord;
use bothost_service::protocol::{
    InstallResult, LogsParams, LogsResult, METHOD_PROJECT_CREATE, METHOD_PROJECT_GET,
    METHOD_PROJECT_INSTALL, METHOD_PROJECT_LIST, METHOD_PROJECT_LOGS, METHOD_PROJECT_REGISTER,
    METHOD_PROJECT_REMOVE, METHOD_PROJECT_RESTART, METHOD_PROJECT_SET_COMMAND,
    METHOD_PROJECT_START, METHOD_PROJECT_STOP, METHOD_PROJECT_USAGE, METHOD_SERVICE_STATUS,
    ProjectIdParams, ProjectInfo, ProjectListResult, RegisterParams, RemoveResult,
    ServiceStatusResult, SetCommandParams, UsageResult, describe_transition,
};
use clap::{Parser, Subcommand};
use serde::Serialize;

pub use client::{ClientError, RpcClient};

/// Default number of log lines shown by `bothost logs`.
pub const DEFAULT_LOG_LINES: usize = 50;

#[derive(Debug, Parser)]
#[command(name = "bothost", version, about = "Control the bothost-service supervisor")]
pub struct Cli {
    /// Output the raw result as JSON.
    #[arg(long = "json", short = 'j', global = true)]
    pub json: bool,

    /// Override socket path.
    #[arg(long = "socket", global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create an empty project directory and register it.
    Create(IdArgs),
    /// Register an existing directory as a project.
    Register(RegisterArgs),
    /// Unregister a stopped project. Its files are kept.
    Remove(IdArgs),
    /// List all projects with their state.
    List,
    /// Show one project's configuration and state.
    Status(IdArgs),
    /// Start a project.
    Start(IdArgs),
    /// Stop a project.
    Stop(IdArgs),
    /// Stop (if live) and start a project.
    Restart(IdArgs),
    /// Show captured output.
    Logs(LogsArgs),
    /// Sample CPU, memory and uptime of a running project.
    Usage(IdArgs),
    /// Replace a project's run command.
    SetCommand(SetCommandArgs),
    /// Install a project's declared dependencies.
    Install(IdArgs),
    /// Show service uptime and project counts.
    Service,
}

#[derive(Debug, clap::Args)]
pub struct IdArgs {
    /// Project identifier.
    pub id: String,
}

#[derive(Debug, clap::Args)]
pub struct RegisterArgs {
    /// Project identifier.
    pub id: String,

    /// Project root directory.
    pub root: PathBuf,

    /// Run command (defaults to the service's `default_command`).
    #[arg(long = "command", short = 'c')]
    pub command: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct LogsArgs {
    /// Project identifier.
    pub id: String,

    /// Number of most recent lines.
    #[arg(short = 'n', long = "lines", default_value_t = DEFAULT_LOG_LINES)]
    pub lines: usize,
}

#[derive(Debug, clap::Args)]
pub struct SetCommandArgs {
    /// Project identifier.
    pub id: String,

    /// New run command, parsed with shell quoting rules.
    pub command: String,
}

impl Cli {
    pub fn socket_path(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(bothost_service::default_socket_path)
    }

    /// Connect, run the subcommand and return the text to print.
    pub fn run(&self) -> Result<String, ClientError> {
        let mut client = RpcClient::connect(&self.socket_path())?;
        self.execute(&mut client)
    }

    /// Run the subcommand over an already connected client.
    pub fn execute(&self, client: &mut RpcClient) -> Result<String, ClientError> {
        let json = self.json;
        match &self.command {
            Command::Create(args) => {
                let info: ProjectInfo =
                    client.call(METHOD_PROJECT_CREATE, &ProjectIdParams::from(args))?;
                render(json, &info, |info| {
                    format!("Created {} at {}", info.id, info.root.display())
                })
            }
            Command::Register(args) => {
                let params = RegisterParams {
                    id: args.id.clone(),
                    root: args.root.clone(),
                    command: args.command.clone(),
                };
                let info: ProjectInfo = client.call(METHOD_PROJECT_REGISTER, &params)?;
                render(json, &info, |info| format!("Registered {info}"))
            }
            Command::Remove(args) => {
                let result: RemoveResult =
                    client.call(METHOD_PROJECT_REMOVE, &ProjectIdParams::from(args))?;
                render(json, &result, |r| format!("{} removed", r.id))
            }
            Command::List => {
                let result: ProjectListResult =
                    client.call(METHOD_PROJECT_LIST, &serde_json::json!({}))?;
                render(json, &result, ToString::to_string)
            }
            Command::Status(args) => {
                let info: ProjectInfo =
                    client.call(METHOD_PROJECT_GET, &ProjectIdParams::from(args))?;
                render(json, &info, ToString::to_string)
            }
            Command::Start(args) => transition(client, json, METHOD_PROJECT_START, args),
            Command::Stop(args) => transition(client, json, METHOD_PROJECT_STOP, args),
            Command::Restart(args) => transition(client, json, METHOD_PROJECT_RESTART, args),
            Command::Logs(args) => {
                let params = LogsParams {
                    id: args.id.clone(),
                    lines: Some(args.lines),
                };
                let result: LogsResult = client.call(METHOD_PROJECT_LOGS, &params)?;
                render(json, &result, ToString::to_string)
            }
            Command::Usage(args) => {
                let result: UsageResult =
                    client.call(METHOD_PROJECT_USAGE, &ProjectIdParams::from(args))?;
                render(json, &result, |r| format!("{}:\n{}", r.id, r.usage))
            }
            Command::SetCommand(args) => {
                let params = SetCommandParams {
                    id: args.id.clone(),
                    command: args.command.clone(),
                };
                let info: ProjectInfo = client.call(METHOD_PROJECT_SET_COMMAND, &params)?;
                render(json, &info, |info| {
                    format!("{} will run: {}", info.id, info.run_command)
                })
            }
            Command::Install(args) => {
                let result: InstallResult =
                    client.call(METHOD_PROJECT_INSTALL, &ProjectIdParams::from(args))?;
                render(json, &result, ToString::to_string)
            }
            Command::Service => {
                let result: ServiceStatusResult =
                    client.call(METHOD_SERVICE_STATUS, &serde_json::json!({}))?;
                render(json, &result, ToString::to_string)
            }
        }
    }
}

impl From<&IdArgs> for ProjectIdParams {
    fn from(args: &IdArgs) -> Self {
        ProjectIdParams {
            id: args.id.clone(),
        }
    }
}

fn transition(
    client: &mut RpcClient,
    json: bool,
    method: &str,
    args: &IdArgs,
) -> Result<String, ClientError> {
    let record: LifecycleRecord = client.call(method, &ProjectIdParams::from(args))?;
    render(json, &record, describe_transition)
}

fn render<T, F>(json: bool, value: &T, text: F) -> Result<String, ClientError>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    if json {
        serde_json::to_string_pretty(value)
            .map_err(|e| ClientError::Protocol(format!("serialize result: {e}")))
    } else {
        Ok(text(value))
    }
}

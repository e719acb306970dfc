//! IPC protocol types for the control socket.
//!
//! Newline-delimited JSON-RPC-lite: every request is one line
//! `{"id", "method", "params"}`, answered by one line carrying either
//! `result` or `error`.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::{LifecycleRecord, LifecycleState};
use crate::log_sink::LogEntry;
use crate::sampler::UsageSample;

// ─────────────────────────────────────────────────────────────────────────────
// Error codes (JSON-RPC error.code)
// ─────────────────────────────────────────────────────────────────────────────

/// Standard JSON-RPC errors.
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;

/// Supervisor error codes.
pub const ERR_INVALID_IDENTIFIER: i64 = 100;
pub const ERR_DUPLICATE_PROJECT: i64 = 101;
pub const ERR_NOT_FOUND: i64 = 102;
pub const ERR_ALREADY_RUNNING: i64 = 103;
pub const ERR_NOT_RUNNING: i64 = 104;
pub const ERR_SPAWN: i64 = 110;
pub const ERR_STARTUP_FAILED: i64 = 111;
pub const ERR_PROCESS_GONE: i64 = 112;
pub const ERR_TIMEOUT: i64 = 113;
pub const ERR_DEPENDENCY_INSTALL: i64 = 120;
pub const ERR_INVALID_COMMAND: i64 = 121;
pub const ERR_INFRA: i64 = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Method names
// ─────────────────────────────────────────────────────────────────────────────

pub const METHOD_HELLO: &str = "hello";
pub const METHOD_PROJECT_CREATE: &str = "project.create";
pub const METHOD_PROJECT_REGISTER: &str = "project.register";
pub const METHOD_PROJECT_REMOVE: &str = "project.remove";
pub const METHOD_PROJECT_LIST: &str = "project.list";
pub const METHOD_PROJECT_GET: &str = "project.get";
pub const METHOD_PROJECT_SET_COMMAND: &str = "project.set_command";
pub const METHOD_PROJECT_START: &str = "project.start";
pub const METHOD_PROJECT_STOP: &str = "project.stop";
pub const METHOD_PROJECT_RESTART: &str = "project.restart";
pub const METHOD_PROJECT_STATUS: &str = "project.status";
pub const METHOD_PROJECT_LOGS: &str = "project.logs";
pub const METHOD_PROJECT_USAGE: &str = "project.usage";
pub const METHOD_PROJECT_INSTALL: &str = "project.install";
pub const METHOD_SERVICE_STATUS: &str = "service.status";

/// Every method the service answers, advertised in the handshake.
pub const CAPABILITIES: &[&str] = &[
    METHOD_PROJECT_CREATE,
    METHOD_PROJECT_REGISTER,
    METHOD_PROJECT_REMOVE,
    METHOD_PROJECT_LIST,
    METHOD_PROJECT_GET,
    METHOD_PROJECT_SET_COMMAND,
    METHOD_PROJECT_START,
    METHOD_PROJECT_STOP,
    METHOD_PROJECT_RESTART,
    METHOD_PROJECT_STATUS,
    METHOD_PROJECT_LOGS,
    METHOD_PROJECT_USAGE,
    METHOD_PROJECT_INSTALL,
    METHOD_SERVICE_STATUS,
];

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: RequestId,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorResponse {
    pub id: RequestId,
    pub error: RpcError,
}

/// Either reply shape, as seen by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcReply {
    Ok(RpcResponse),
    Err(RpcErrorResponse),
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: String,
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: String,
    pub service_version: String,
    pub capabilities: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// project.*
// ─────────────────────────────────────────────────────────────────────────────

/// Params for every method that only names a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectIdParams {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterParams {
    pub id: String,
    pub root: PathBuf,
    /// Defaults to the configured `default_command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetCommandParams {
    pub id: String,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsParams {
    pub id: String,
    /// Defaults to the retained window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<usize>,
}

/// A project's configuration together with its lifecycle snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: String,
    pub root: PathBuf,
    pub run_command: String,
    pub created_at: DateTime<Utc>,
    pub status: LifecycleRecord,
}

impl std::fmt::Display for ProjectInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}: {}", self.id, self.status)?;
        writeln!(f, "  root:    {}", self.root.display())?;
        write!(f, "  command: {}", self.run_command)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectListResult {
    pub projects: Vec<ProjectInfo>,
}

impl std::fmt::Display for ProjectListResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.projects.is_empty() {
            return f.write_str("No projects");
        }
        let width = self.projects.iter().map(|p| p.id.len()).max().unwrap_or(0);
        for (i, project) in self.projects.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{:width$}  {}", project.id, project.status)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveResult {
    pub id: String,
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResult {
    pub id: String,
    pub entries: Vec<LogEntry>,
}

impl std::fmt::Display for LogsResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("Logs are empty");
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageResult {
    pub id: String,
    #[serde(flatten)]
    pub usage: UsageSample,
}

/// Outcome of a successful dependency install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallResult {
    pub id: String,
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
}

impl std::fmt::Display for InstallResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Dependencies installed successfully")?;
        for line in &self.output {
            write!(f, "\n{line}")?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// service.status
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusResult {
    pub service_version: String,
    pub uptime_s: u64,
    pub projects: usize,
    pub running: usize,
}

impl std::fmt::Display for ServiceStatusResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bothost-service v{}: up {}s, {} project(s), {} live",
            self.service_version, self.uptime_s, self.projects, self.running
        )
    }
}

/// Count of live projects in a set of records.
pub fn count_live(records: &[LifecycleRecord]) -> usize {
    records.iter().filter(|r| r.state.is_live()).count()
}

/// Short operator text for a lifecycle state change result.
pub fn describe_transition(record: &LifecycleRecord) -> String {
    match record.state {
        LifecycleState::Running => match record.pid {
            Some(pid) => format!("{} started with PID {pid}", record.project_id),
            None => format!("{} started", record.project_id),
        },
        LifecycleState::Stopped => format!("{} stopped successfully", record.project_id),
        _ => format!("{}: {record}", record.project_id),
    }
}

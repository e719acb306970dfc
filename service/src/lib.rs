//! `bothost-service`: multi-project bot supervisor.
//!
//! Owns the lifecycle of many independently runnable bot programs
//! ("projects"): spawn, monitor, stop, restart and auto-recover, with
//! per-project log capture and on-demand resource sampling.
//!
//! The [`registry::Supervisor`] is the only entry point callers need. The
//! daemon binary exposes it over a Unix domain socket speaking
//! JSON-RPC-lite (see [`ipc`] and [`protocol`]).
//!
//! ## Layering
//!
//! ```text
//! registry ──► lifecycle ──► runner ──► log_sink
//!    │             ▲
//!    ├──► restart ─┘
//!    └──► sampler
//! ```

pub mod config;
pub mod error;
pub mod ipc;
pub mod lifecycle;
pub mod log_sink;
pub mod persistence;
pub mod project;
pub mod protocol;
pub mod registry;
pub mod restart;
pub mod runner;
pub mod sampler;

/// Protocol version for the control socket.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default socket filename.
pub const SOCKET_FILENAME: &str = "bothost.sock";

/// Get the default socket path using XDG_RUNTIME_DIR.
///
/// Falls back to `/tmp/bothost-<username>.sock` if XDG_RUNTIME_DIR is not set.
pub fn default_socket_path() -> std::path::PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        std::path::PathBuf::from(runtime_dir).join(SOCKET_FILENAME)
    } else {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        std::path::PathBuf::from(format!("/tmp/bothost-{user}.sock"))
    }
}

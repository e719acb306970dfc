//! Blocking IPC client for the `bothost-service` control socket.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bothost_service::PROTOCOL_VERSION;
use bothost_service::protocol::{
    HelloParams, HelloResult, METHOD_HELLO, RequestId, RpcReply, RpcRequest,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Long enough for a dependency install plus a stop escalation.
const READ_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(
        "cannot connect to bothost-service at {}: {source}\nHint: start it with `bothost-service`",
        path.display()
    )]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The service answered with an error.
    #[error("{message}")]
    Rpc { code: i64, message: String },
}

/// One connection, handshake already done.
pub struct RpcClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
    next_id: i64,
    service_version: String,
}

impl RpcClient {
    /// Connect to `socket_path` and perform the `hello` handshake.
    pub fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path).map_err(|source| ClientError::Connect {
            path: socket_path.to_path_buf(),
            source,
        })?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let writer = stream.try_clone()?;
        let mut client = Self {
            writer,
            reader: BufReader::new(stream),
            next_id: 0,
            service_version: String::new(),
        };

        let hello: HelloResult = client.call(
            METHOD_HELLO,
            &HelloParams {
                protocol_version: PROTOCOL_VERSION.to_string(),
                client_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        )?;
        client.service_version = hello.service_version;
        Ok(client)
    }

    pub fn service_version(&self) -> &str {
        &self.service_version
    }

    /// Send one request and decode its result as `T`.
    pub fn call<P, T>(&mut self, method: &str, params: &P) -> Result<T, ClientError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let value = self.call_value(method, params)?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("unexpected {method} result: {e}")))
    }

    /// Send one request and return the raw `result`.
    pub fn call_value<P: Serialize>(
        &mut self,
        method: &str,
        params: &P,
    ) -> Result<serde_json::Value, ClientError> {
        self.next_id += 1;
        let request = RpcRequest {
            id: RequestId::Integer(self.next_id),
            method: method.to_string(),
            params: Some(
                serde_json::to_value(params)
                    .map_err(|e| ClientError::Protocol(format!("serialize params: {e}")))?,
            ),
        };
        let mut bytes = serde_json::to_vec(&request)
            .map_err(|e| ClientError::Protocol(format!("serialize request: {e}")))?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;

        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(ClientError::Protocol(
                "service closed the connection".to_string(),
            ));
        }
        let reply: RpcReply = serde_json::from_str(line.trim())
            .map_err(|e| ClientError::Protocol(format!("parse response: {e}")))?;
        match reply {
            RpcReply::Ok(resp) => Ok(resp.result),
            RpcReply::Err(resp) => Err(ClientError::Rpc {
                code: resp.error.code,
                message: resp.error.message,
            }),
        }
    }
}

//! Token-protocol engine running as a child process, spoken to over
//! line-delimited JSON on its stdin/stdout.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::TokenBridge;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::rpc::types::{JsonRpcError, JsonRpcRequest};

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug)]
struct Channel {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

/// Calls are serialized: one request is outstanding at a time.
#[derive(Debug)]
pub struct ProcessBridge {
    channel: Mutex<Channel>,
    _child: Child,
}

impl ProcessBridge {
    pub fn spawn(config: &BridgeConfig) -> BridgeResult<Self> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().ok_or(BridgeError::Closed)?;
        let stdout = child.stdout.take().ok_or(BridgeError::Closed)?;
        tracing::info!("Started token bridge {}", config.program.display());

        Ok(Self {
            channel: Mutex::new(Channel {
                stdin,
                stdout: BufReader::new(stdout).lines(),
                next_id: 1,
            }),
            _child: child,
        })
    }
}

#[async_trait]
impl TokenBridge for ProcessBridge {
    async fn call(&self, method: &str, params: Vec<Value>) -> BridgeResult<Value> {
        let mut channel = self.channel.lock().await;
        let id = channel.next_id;
        channel.next_id += 1;

        let mut line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        line.push('\n');
        channel.stdin.write_all(line.as_bytes()).await?;
        channel.stdin.flush().await?;

        let reply = channel.stdout.next_line().await?.ok_or(BridgeError::Closed)?;
        let response: BridgeResponse = serde_json::from_str(&reply)
            .map_err(|e| BridgeError::Protocol(format!("{method}: {e}")))?;
        tracing::trace!("Bridge {} answered", method);

        match response.error {
            Some(error) => Err(BridgeError::Remote {
                code: error.code,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }
}

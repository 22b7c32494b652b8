//! Bridge to the external token-protocol engine.
//!
//! The engine keeps its own projection of the ledger and is told about
//! connected blocks, rollbacks and rescans so it stays in step with the
//! wallet. It is a black box: each call returns a result or an error.

mod process;

use async_trait::async_trait;
use serde_json::{Value, json};

use hc_wire::BlockHash;

use crate::error::{BridgeError, BridgeResult};

pub use process::ProcessBridge;

#[async_trait]
pub trait TokenBridge: Send + Sync {
    /// Issues one request and waits for its response.
    async fn call(&self, method: &str, params: Vec<Value>) -> BridgeResult<Value>;

    async fn on_block_connected(&self, height: u32, hash: &BlockHash, time: i64) -> BridgeResult<()> {
        self.call("omni_onblockconnected", vec![json!(height), json!(hash.to_string()), json!(time)])
            .await
            .map(|_| ())
    }

    /// Discards everything the engine derived from blocks at or above `height`.
    async fn rollback(&self, height: u32) -> BridgeResult<()> {
        self.call("omni_rollback", vec![json!(height), json!([])]).await.map(|_| ())
    }

    /// Height the engine has processed through; zero when it has nothing.
    async fn watermark(&self) -> BridgeResult<u32> {
        let value = self.call("omni_getwaterline", Vec::new()).await?;
        parse_height(&value)
    }

    async fn clear(&self) -> BridgeResult<()> {
        self.call("omni_clear", Vec::new()).await.map(|_| ())
    }
}

/// Heights arrive either as numbers or as numeric strings. Negative values
/// mean nothing has been processed.
fn parse_height(value: &Value) -> BridgeResult<u32> {
    let height = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Null => Some(0),
        _ => None,
    }
    .ok_or_else(|| BridgeError::Protocol(format!("watermark is not a height: {value}")))?;
    Ok(u32::try_from(height.max(0)).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingBridge;

    #[test]
    fn test_parse_height() {
        assert_eq!(parse_height(&json!(120)).unwrap(), 120);
        assert_eq!(parse_height(&json!("88")).unwrap(), 88);
        assert_eq!(parse_height(&json!(-1)).unwrap(), 0);
        assert!(parse_height(&json!({"h": 1})).is_err());
    }

    #[tokio::test]
    async fn test_hooks_issue_expected_requests() {
        let bridge = RecordingBridge::new();
        let hash = BlockHash::hash(b"b");
        bridge.on_block_connected(10, &hash, 1_700_000_000).await.unwrap();
        bridge.rollback(8).await.unwrap();

        let calls = bridge.calls();
        assert_eq!(calls[0].0, "omni_onblockconnected");
        assert_eq!(calls[0].1, vec![json!(10), json!(hash.to_string()), json!(1_700_000_000)]);
        assert_eq!(calls[1], ("omni_rollback".to_string(), vec![json!(8), json!([])]));
    }
}

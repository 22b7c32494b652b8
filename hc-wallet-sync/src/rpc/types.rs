//! JSON-RPC 1.0 wire types spoken by the node and decoding of its push
//! notifications.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hc_wire::{BlockHash, BlockHeaderData, OutPoint, TxHash};

use crate::error::{RpcError, RpcResult};
use crate::notifications::{ChainNotification, VotingNotification};

pub const JSONRPC_VERSION: &str = "1.0";

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// Anything the node sends: a response (id set) or a notification (method
/// set, id null).
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Request id of a response.
    pub fn response_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    pub fn into_result(self) -> RpcResult<Value> {
        if let Some(error) = self.error {
            return Err(RpcError::Server {
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RescannedBlockDto {
    pub hash: String,
    #[serde(default)]
    pub transactions: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RescanResult {
    #[serde(default)]
    pub discovereddata: Vec<RescannedBlockDto>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxRawResult {
    pub hex: String,
    pub txid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockhash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockheight: Option<u32>,
    #[serde(default)]
    pub confirmations: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutPointDto {
    pub hash: String,
    pub tree: i8,
    pub index: u32,
}

impl From<&OutPoint> for OutPointDto {
    fn from(outpoint: &OutPoint) -> Self {
        OutPointDto {
            hash: outpoint.hash.to_string(),
            tree: outpoint.tree as i8,
            index: outpoint.index,
        }
    }
}

/// A decoded push notification, routed to one of the two dispatcher streams.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeNotification {
    Chain(ChainNotification),
    Voting(VotingNotification),
}

fn invalid(method: &str, reason: impl Into<String>) -> RpcError {
    RpcError::InvalidNotification {
        method: method.to_string(),
        reason: reason.into(),
    }
}

fn param<'a>(method: &str, params: &'a [Value], index: usize) -> RpcResult<&'a Value> {
    params.get(index).ok_or_else(|| invalid(method, format!("missing parameter {index}")))
}

fn str_param<'a>(method: &str, params: &'a [Value], index: usize) -> RpcResult<&'a str> {
    param(method, params, index)?
        .as_str()
        .ok_or_else(|| invalid(method, format!("parameter {index} is not a string")))
}

fn u32_param(method: &str, params: &[Value], index: usize) -> RpcResult<u32> {
    param(method, params, index)?
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| invalid(method, format!("parameter {index} is not a height")))
}

fn hex_param(method: &str, params: &[Value], index: usize) -> RpcResult<Vec<u8>> {
    hex::decode(str_param(method, params, index)?)
        .map_err(|e| invalid(method, format!("parameter {index}: {e}")))
}

fn parse_hash<H: FromStr>(method: &str, s: &str) -> RpcResult<H>
where
    H::Err: std::fmt::Display,
{
    s.parse().map_err(|e: H::Err| invalid(method, format!("hash {s}: {e}")))
}

fn hash_param<H: FromStr>(method: &str, params: &[Value], index: usize) -> RpcResult<H>
where
    H::Err: std::fmt::Display,
{
    parse_hash(method, str_param(method, params, index)?)
}

/// Decodes a push notification. Unknown methods yield `None`.
pub fn decode_notification(method: &str, params: &[Value]) -> RpcResult<Option<NodeNotification>> {
    let notification = match method {
        "blockconnected" => {
            let raw = hex_param(method, params, 0)?;
            let header = BlockHeaderData::from_raw(&raw)?;
            let transactions = param(method, params, 1)?
                .as_array()
                .ok_or_else(|| invalid(method, "transactions are not an array"))?
                .iter()
                .map(|tx| {
                    tx.as_str()
                        .ok_or_else(|| invalid(method, "transaction is not a string"))
                        .and_then(|s| hex::decode(s).map_err(|e| invalid(method, e.to_string())))
                })
                .collect::<RpcResult<Vec<_>>>()?;
            NodeNotification::Chain(ChainNotification::BlockConnected {
                header,
                transactions,
            })
        }
        "reorganization" => NodeNotification::Chain(ChainNotification::Reorganization {
            old_hash: hash_param(method, params, 0)?,
            old_height: u32_param(method, params, 1)?,
            new_hash: hash_param(method, params, 2)?,
            new_height: u32_param(method, params, 3)?,
        }),
        "relevanttxaccepted" => NodeNotification::Chain(ChainNotification::RelevantTxAccepted {
            transaction: hex_param(method, params, 0)?,
        }),
        "winningtickets" => {
            let block_hash: BlockHash = hash_param(method, params, 0)?;
            let height = u32_param(method, params, 1)?;
            let map = param(method, params, 2)?
                .as_object()
                .ok_or_else(|| invalid(method, "tickets are not an object"))?;
            // Keys are the ticket's position in the winning list.
            let mut ordered = BTreeMap::new();
            for (key, value) in map {
                let position: u32 =
                    key.parse().map_err(|_| invalid(method, format!("ticket key {key}")))?;
                let hash = value.as_str().ok_or_else(|| invalid(method, "ticket is not a string"))?;
                ordered.insert(position, parse_hash::<TxHash>(method, hash)?);
            }
            NodeNotification::Voting(VotingNotification::WinningTickets {
                block_hash,
                height,
                tickets: ordered.into_values().collect(),
            })
        }
        "spentandmissedtickets" => {
            let block_hash: BlockHash = hash_param(method, params, 0)?;
            let height = u32_param(method, params, 1)?;
            let map = param(method, params, 3)?
                .as_object()
                .ok_or_else(|| invalid(method, "tickets are not an object"))?;
            let mut tickets = Vec::new();
            for (ticket, state) in map {
                if state.as_str() == Some("missed") {
                    tickets.push(parse_hash::<TxHash>(method, ticket)?);
                }
            }
            tickets.sort();
            NodeNotification::Chain(ChainNotification::MissedTickets {
                block_hash,
                height,
                tickets,
            })
        }
        "newinstanttx" => {
            let transaction = hex_param(method, params, 0)?;
            let tickets = param(method, params, 1)?
                .as_array()
                .ok_or_else(|| invalid(method, "tickets are not an array"))?
                .iter()
                .map(|t| {
                    t.as_str()
                        .ok_or_else(|| invalid(method, "ticket is not a string"))
                        .and_then(|s| parse_hash::<TxHash>(method, s))
                })
                .collect::<RpcResult<Vec<_>>>()?;
            let resend = param(method, params, 2)?.as_bool().unwrap_or(false);
            NodeNotification::Chain(ChainNotification::NewInstantTx {
                transaction,
                tickets,
                resend,
            })
        }
        "instanttxvote" => NodeNotification::Chain(ChainNotification::InstantTxVote {
            vote_hash: hash_param(method, params, 0)?,
            instant_tx_hash: hash_param(method, params, 1)?,
            ticket_hash: hash_param(method, params, 2)?,
            vote: param(method, params, 3)?
                .as_bool()
                .ok_or_else(|| invalid(method, "vote is not a bool"))?,
            signature: hex_param(method, params, 4)?,
        }),
        _ => return Ok(None),
    };
    Ok(Some(notification))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ChainBuilder;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let req = JsonRpcRequest::new(7, "rescan", vec![json!(["00"])]);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value, json!({"jsonrpc": "1.0", "id": 7, "method": "rescan", "params": [["00"]]}));
    }

    #[test]
    fn test_response_and_notification_are_distinguished() {
        let response: JsonRpcMessage =
            serde_json::from_str(r#"{"result":{"discovereddata":[]},"error":null,"id":3}"#).unwrap();
        assert_eq!(response.response_id(), Some(3));
        let result: RescanResult = serde_json::from_value(response.into_result().unwrap()).unwrap();
        assert!(result.discovereddata.is_empty());

        let failed: JsonRpcMessage =
            serde_json::from_str(r#"{"result":null,"error":{"code":-5,"message":"no tx"},"id":4}"#).unwrap();
        assert!(matches!(failed.into_result(), Err(RpcError::Server { code: -5, .. })));

        let ntfn: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"1.0","method":"relevanttxaccepted","params":["00"],"id":null}"#)
                .unwrap();
        assert_eq!(ntfn.response_id(), None);
        assert_eq!(ntfn.method.as_deref(), Some("relevanttxaccepted"));
    }

    #[test]
    fn test_decode_block_connected() {
        let block = ChainBuilder::new().next_block();
        let params = vec![json!(hex::encode(block.raw_header.as_bytes())), json!(["0102"])];
        match decode_notification("blockconnected", &params).unwrap() {
            Some(NodeNotification::Chain(ChainNotification::BlockConnected {
                header,
                transactions,
            })) => {
                assert_eq!(header, block);
                assert_eq!(transactions, vec![vec![1, 2]]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_tickets_notifications() {
        let block = BlockHash::hash(b"block");
        let t1 = TxHash::hash(b"t1");
        let t2 = TxHash::hash(b"t2");
        let params = vec![
            json!(block.to_string()),
            json!(200),
            json!({"1": t2.to_string(), "0": t1.to_string()}),
        ];
        assert_eq!(
            decode_notification("winningtickets", &params).unwrap(),
            Some(NodeNotification::Voting(VotingNotification::WinningTickets {
                block_hash: block,
                height: 200,
                tickets: vec![t1, t2],
            }))
        );

        let params = vec![
            json!(block.to_string()),
            json!(200),
            json!(12345),
            json!({t1.to_string(): "spent", t2.to_string(): "missed"}),
        ];
        assert_eq!(
            decode_notification("spentandmissedtickets", &params).unwrap(),
            Some(NodeNotification::Chain(ChainNotification::MissedTickets {
                block_hash: block,
                height: 200,
                tickets: vec![t2],
            }))
        );
    }

    #[test]
    fn test_malformed_and_unknown() {
        assert!(matches!(
            decode_notification("reorganization", &[json!("zz")]),
            Err(RpcError::InvalidNotification { .. })
        ));
        assert!(decode_notification("txaccepted", &[]).unwrap().is_none());
    }
}

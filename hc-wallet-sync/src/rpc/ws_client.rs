//! Websocket JSON-RPC transport to the node.
//!
//! One writer task drains outgoing frames; one reader task resolves
//! responses by request id and forwards decoded notifications to the two
//! dispatcher streams.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_util::sync::CancellationToken;

use hc_wire::{Address, BlockHash, OutPoint, Transaction, TxHash};

use super::types::{JsonRpcMessage, JsonRpcRequest, OutPointDto, RescanResult, TxRawResult};
use super::{ChainClient, InstantTxVote, NodeNotification, RawTransaction, RescannedBlock, decode_notification};
use crate::config::WalletConfig;
use crate::error::{RpcError, RpcResult};
use crate::notifications::{ChainNotification, VotingNotification};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResult<Value>>>>>;

/// Notification receivers handed to the dispatcher.
#[derive(Debug)]
pub struct NotificationStreams {
    pub chain: mpsc::Receiver<ChainNotification>,
    pub voting: mpsc::Receiver<VotingNotification>,
}

pub struct WsChainClient {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl WsChainClient {
    /// Connects, authenticates and registers for block, winning-ticket and
    /// missed-ticket notifications.
    pub async fn connect(config: &WalletConfig) -> RpcResult<(Self, NotificationStreams)> {
        let url = format!("ws://{}/ws", config.node_endpoint);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RpcError::ConnectionFailed(format!("{url}: {e}")))?;
        let credentials = STANDARD.encode(format!("{}:{}", config.node_user, config.node_password));
        let auth = HeaderValue::from_str(&format!("Basic {credentials}"))
            .map_err(|e| RpcError::ConnectionFailed(format!("authorization header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| RpcError::ConnectionFailed(format!("{url}: {e}")))?;
        tracing::info!("Connected to node at {}", config.node_endpoint);
        let (mut sink, mut source) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (chain_tx, chain_rx) = mpsc::channel(config.tx_notification_buffer);
        let (voting_tx, voting_rx) = mpsc::channel(config.tx_notification_buffer);
        let pending: Pending = Arc::default();
        let shutdown = CancellationToken::new();

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    next = outgoing_rx.recv() => match next {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                tracing::warn!("Failed to write to node: {}", e);
                                writer_shutdown.cancel();
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        chain_tx
            .send(ChainNotification::ClientConnected)
            .await
            .map_err(|_| RpcError::Closed)?;

        let reader_pending = pending.clone();
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    next = source.next() => next,
                };
                match next {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&text, &reader_pending, &chain_tx, &voting_tx).await
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Node connection error: {}", e);
                        break;
                    }
                }
            }
            tracing::info!("Node connection closed");
            reader_shutdown.cancel();
            reader_pending.lock().await.clear();
        });

        let client = Self {
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            shutdown,
        };
        for method in ["notifyblocks", "notifywinningtickets", "notifyspentandmissedtickets"] {
            client.call(method, Vec::new()).await?;
        }
        Ok((
            client,
            NotificationStreams {
                chain: chain_rx,
                voting: voting_rx,
            },
        ))
    }

    pub fn disconnect(&self) {
        self.shutdown.cancel();
    }

    pub fn is_connected(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        if self.shutdown.is_cancelled() {
            return Err(RpcError::NotConnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        if self.outgoing.send(Message::Text(request)).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::Closed);
        }
        tracing::trace!("Sent {} (id {})", method, id);

        tokio::select! {
            response = rx => response.map_err(|_| RpcError::Closed)?,
            _ = self.shutdown.cancelled() => Err(RpcError::Closed),
        }
    }
}

impl Drop for WsChainClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for WsChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsChainClient").field("connected", &self.is_connected()).finish()
    }
}

async fn handle_text(
    text: &str,
    pending: &Pending,
    chain_tx: &mpsc::Sender<ChainNotification>,
    voting_tx: &mpsc::Sender<VotingNotification>,
) {
    let message: JsonRpcMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Malformed message from node: {}", e);
            return;
        }
    };

    if let Some(id) = message.response_id() {
        match pending.lock().await.remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(message.into_result());
            }
            None => tracing::debug!("Response for unknown request id {}", id),
        }
        return;
    }

    let Some(method) = message.method.as_deref() else {
        return;
    };
    match decode_notification(method, &message.params) {
        Ok(Some(NodeNotification::Chain(notification))) => {
            if chain_tx.send(notification).await.is_err() {
                tracing::debug!("No consumer for chain notification {}", method);
            }
        }
        Ok(Some(NodeNotification::Voting(notification))) => {
            if voting_tx.send(notification).await.is_err() {
                tracing::debug!("No consumer for voting notification {}", method);
            }
        }
        Ok(None) => tracing::trace!("Ignoring notification {}", method),
        Err(e) => tracing::warn!("Dropping notification {}: {}", method, e),
    }
}

fn decode_hex(s: &str) -> RpcResult<Vec<u8>> {
    hex::decode(s).map_err(|e| RpcError::Protocol(format!("invalid hex: {e}")))
}

#[async_trait]
impl ChainClient for WsChainClient {
    async fn rescan(&self, block_hashes: &[BlockHash]) -> RpcResult<Vec<RescannedBlock>> {
        let hashes: Vec<String> = block_hashes.iter().map(ToString::to_string).collect();
        let value = self.call("rescan", vec![json!(hashes)]).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        let result: RescanResult = serde_json::from_value(value)?;
        result
            .discovereddata
            .into_iter()
            .map(|block| {
                let hash = block
                    .hash
                    .parse::<BlockHash>()
                    .map_err(|e| RpcError::Protocol(format!("rescan block hash {}: {e}", block.hash)))?;
                let transactions =
                    block.transactions.iter().map(|tx| decode_hex(tx)).collect::<RpcResult<Vec<_>>>()?;
                Ok(RescannedBlock {
                    hash,
                    transactions,
                })
            })
            .collect()
    }

    async fn get_raw_transaction_verbose(&self, hash: &TxHash) -> RpcResult<RawTransaction> {
        let value = self.call("getrawtransaction", vec![json!(hash.to_string()), json!(1)]).await?;
        let result: TxRawResult = serde_json::from_value(value)?;
        let tx = Transaction::from_bytes(&decode_hex(&result.hex)?)?;
        let block_hash = result
            .blockhash
            .filter(|h| !h.is_empty())
            .map(|h| h.parse::<BlockHash>().map_err(|e| RpcError::Protocol(format!("block hash {h}: {e}"))))
            .transpose()?;
        Ok(RawTransaction {
            tx,
            block_hash,
            block_height: result.blockheight,
            confirmations: result.confirmations,
        })
    }

    async fn send_raw_transaction(&self, tx: &Transaction, allow_high_fees: bool) -> RpcResult<TxHash> {
        let value = self
            .call("sendrawtransaction", vec![json!(hex::encode(tx.to_bytes())), json!(allow_high_fees)])
            .await?;
        let hash = value
            .as_str()
            .ok_or_else(|| RpcError::Protocol("sendrawtransaction did not return a hash".into()))?;
        hash.parse::<TxHash>().map_err(|e| RpcError::Protocol(format!("transaction hash {hash}: {e}")))
    }

    async fn load_tx_filter(
        &self,
        reload: bool,
        addresses: &[Address],
        outpoints: &[OutPoint],
    ) -> RpcResult<()> {
        let addresses: Vec<String> = addresses.iter().map(ToString::to_string).collect();
        let outpoints: Vec<OutPointDto> = outpoints.iter().map(OutPointDto::from).collect();
        self.call("loadtxfilter", vec![json!(reload), json!(addresses), serde_json::to_value(outpoints)?])
            .await?;
        Ok(())
    }

    async fn send_instant_tx_vote(&self, vote: &InstantTxVote) -> RpcResult<()> {
        self.call(
            "sendinstanttxvote",
            vec![
                json!(vote.instant_tx_hash.to_string()),
                json!(vote.ticket_hash.to_string()),
                json!(vote.vote),
                json!(hex::encode(&vote.pubkey)),
                json!(hex::encode(&vote.signature)),
            ],
        )
        .await?;
        Ok(())
    }
}

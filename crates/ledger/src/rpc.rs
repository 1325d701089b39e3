//! Ethereum JSON-RPC implementation of [`LedgerClient`].
//!
//! Every request goes through the same pipeline:
//!
//! ```text
//! circuit breaker check -> retry with backoff (bounded by call_timeout) -> HTTP POST
//! ```
//!
//! Submissions use `eth_sendTransaction`, so the node signs with the sender's
//! unlocked account. Reads use `eth_call`. Subscriptions poll `eth_blockNumber`
//! and `eth_getLogs` from a background task feeding a bounded channel.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    abi::{self, Word},
    circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics},
    client::{
        EventKind, EventPosition, EventSubscription, LedgerClient, OnChainDrug, ReceivedEvent,
        StartFrom, TxHash,
    },
    config::RpcLedgerConfig,
    error::{DecodeError, LedgerError, LedgerResult},
    retry::with_retry_timeout,
};

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    topics: Vec<String>,
    data: String,
    block_number: Option<String>,
    log_index: Option<String>,
    transaction_hash: Option<String>,
    #[serde(default)]
    removed: bool,
}

#[derive(Debug)]
struct Inner {
    http: reqwest::Client,
    config: RpcLedgerConfig,
    breaker: CircuitBreaker,
    next_request_id: AtomicU64,
}

/// JSON-RPC ledger client. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct RpcLedgerClient {
    inner: Arc<Inner>,
}

impl RpcLedgerClient {
    /// Creates a client for the configured node and contract.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(config: RpcLedgerConfig) -> LedgerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()
            .map_err(|e| LedgerError::unavailable_with_source("failed to build HTTP client", e))?;
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        Ok(Self {
            inner: Arc::new(Inner { http, config, breaker, next_request_id: AtomicU64::new(1) }),
        })
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &RpcLedgerConfig {
        &self.inner.config
    }

    /// Returns a snapshot of the circuit breaker counters.
    pub fn circuit_breaker_metrics(&self) -> CircuitBreakerMetrics {
        self.inner.breaker.metrics()
    }

    /// A read: every transient failure is retried.
    async fn call<T: DeserializeOwned>(&self, method: &'static str, params: Value) -> LedgerResult<T> {
        self.call_retrying(method, params, LedgerError::is_transient).await
    }

    /// A state-changing request: only retried when it never reached the node.
    async fn transact<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> LedgerResult<T> {
        self.call_retrying(method, params, LedgerError::is_unsent).await
    }

    async fn call_retrying<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
        retryable: fn(&LedgerError) -> bool,
    ) -> LedgerResult<T> {
        self.inner.breaker.check()?;
        let config = &self.inner.config;
        let result = with_retry_timeout(&config.retry, config.call_timeout, method, retryable, || {
            self.send_once(method, &params)
        })
        .await;
        self.inner.breaker.record(&result);
        result
    }

    async fn send_once<T: DeserializeOwned>(&self, method: &str, params: &Value) -> LedgerResult<T> {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let response = self
            .inner
            .http
            .post(&self.inner.config.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::unavailable_with_source(format!("{method} request failed"), e))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LedgerError::unavailable(format!("{method}: node returned {status}")));
        }
        if !status.is_success() {
            return Err(LedgerError::rejected(format!("{method}: node returned {status}")));
        }

        let envelope: RpcResponse<T> = response.json().await.map_err(|e| {
            LedgerError::unavailable_with_source(format!("{method}: unreadable response"), e)
        })?;
        if let Some(err) = envelope.error {
            return Err(LedgerError::from_rpc(err.code, &err.message));
        }
        envelope.result.ok_or(LedgerError::Decode(DecodeError::MalformedField { field: "result" }))
    }

    async fn send_transaction(&self, data: Vec<u8>, sender: &str) -> LedgerResult<TxHash> {
        let config = &self.inner.config;
        let tx = json!({
            "from": sender,
            "to": config.contract_address,
            "gas": format!("0x{:x}", config.gas_limit),
            "data": abi::to_hex(&data),
        });
        let hash: String = self.transact("eth_sendTransaction", json!([tx])).await?;
        Ok(TxHash(hash))
    }

    async fn block_number(&self) -> LedgerResult<u64> {
        let hex: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&hex).ok_or(LedgerError::Decode(DecodeError::MalformedField { field: "blockNumber" }))
    }

    async fn logs(&self, kinds: &[EventKind], from: u64, to: u64) -> LedgerResult<Vec<RpcLog>> {
        let topics: Vec<String> = kinds
            .iter()
            .map(|kind| {
                let signature = match kind {
                    EventKind::DrugAdded => abi::DRUG_ADDED_SIGNATURE,
                    EventKind::HistoryUpdated => abi::HISTORY_UPDATED_SIGNATURE,
                };
                abi::to_hex(&abi::event_topic(signature))
            })
            .collect();
        let filter = json!({
            "address": self.inner.config.contract_address,
            "fromBlock": format!("0x{from:x}"),
            "toBlock": format!("0x{to:x}"),
            "topics": [topics],
        });
        self.call("eth_getLogs", json!([filter])).await
    }

    /// Polls the node until cancelled or a transport error ends the stream.
    async fn poll_logs(
        self,
        kinds: Vec<EventKind>,
        mut next_block: u64,
        tx: mpsc::Sender<LedgerResult<ReceivedEvent>>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {},
            }

            let batch = match self.block_number().await {
                Ok(head) if head < next_block => continue,
                Ok(head) => self.logs(&kinds, next_block, head).await.map(|logs| (head, logs)),
                Err(err) => Err(err),
            };
            let (head, mut logs) = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(error = %err, next_block, "event poll failed, closing subscription");
                    let _ = tx.send(Err(err)).await;
                    return;
                },
            };

            logs.retain(|log| !log.removed);
            let mut received: Vec<ReceivedEvent> = logs.into_iter().filter_map(into_received).collect();
            received.sort_by_key(|event| event.position);
            for event in received {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            next_block = head + 1;
        }
    }
}

fn parse_quantity(hex: &str) -> Option<u64> {
    u64::from_str_radix(hex.strip_prefix("0x")?, 16).ok()
}

fn parse_topic(topic: &str) -> Result<Word, DecodeError> {
    let bytes = abi::from_hex(topic)?;
    let mut word = [0u8; abi::WORD];
    if bytes.len() != abi::WORD {
        return Err(DecodeError::MalformedField { field: "topics" });
    }
    word.copy_from_slice(&bytes);
    Ok(word)
}

/// Converts a raw log; logs without a usable chain position are dropped.
fn into_received(log: RpcLog) -> Option<ReceivedEvent> {
    let position = match (
        log.block_number.as_deref().and_then(parse_quantity),
        log.log_index.as_deref().and_then(parse_quantity),
    ) {
        (Some(block), Some(log_index)) => EventPosition { block, log_index },
        _ => {
            tracing::warn!(tx_hash = ?log.transaction_hash, "dropping log without block position");
            return None;
        },
    };
    let event = log
        .topics
        .iter()
        .map(|t| parse_topic(t))
        .collect::<Result<Vec<_>, _>>()
        .and_then(|topics| Ok((topics, abi::from_hex(&log.data)?)))
        .and_then(|(topics, data)| abi::decode_log(&topics, &data));
    Some(ReceivedEvent {
        tx_hash: TxHash(log.transaction_hash.unwrap_or_default()),
        position,
        event,
    })
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    #[instrument(skip(self, name), fields(drug_id = %id, sender = %sender))]
    async fn submit_add_drug(&self, id: &str, name: &str, sender: &str) -> LedgerResult<TxHash> {
        let word = abi::parse_uint256(id)?;
        let data = abi::encode_id_string_call(abi::ADD_DRUG_SIGNATURE, &word, name);
        self.send_transaction(data, sender).await
    }

    #[instrument(skip(self, event_detail), fields(drug_id = %id, sender = %sender))]
    async fn submit_history_update(
        &self,
        id: &str,
        event_detail: &str,
        sender: &str,
    ) -> LedgerResult<TxHash> {
        let word = abi::parse_uint256(id)?;
        let data = abi::encode_id_string_call(abi::UPDATE_HISTORY_SIGNATURE, &word, event_detail);
        self.send_transaction(data, sender).await
    }

    #[instrument(skip(self), fields(drug_id = %id))]
    async fn query_drug(&self, id: &str) -> LedgerResult<Option<OnChainDrug>> {
        let word = abi::parse_uint256(id)?;
        let call = json!({
            "to": self.inner.config.contract_address,
            "data": abi::to_hex(&abi::encode_get_drug(&word)),
        });
        let raw: String = match self.call("eth_call", json!([call, "latest"])).await {
            Ok(raw) => raw,
            // A contract that guards getDrug with a require() reverts for unknown ids.
            Err(LedgerError::TransactionRejected { reason }) => {
                tracing::debug!(%reason, "getDrug reverted, treating as absent");
                return Ok(None);
            },
            Err(err) => return Err(err),
        };
        let drug = abi::decode_get_drug(&abi::from_hex(&raw)?)?;
        Ok((drug.id != "0").then_some(drug))
    }

    #[instrument(skip(self))]
    async fn default_sender(&self) -> LedgerResult<Option<String>> {
        let accounts: Vec<String> = self.call("eth_accounts", json!([])).await?;
        Ok(accounts.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn subscribe_events(
        &self,
        kinds: &[EventKind],
        from: StartFrom,
    ) -> LedgerResult<EventSubscription> {
        let next_block = match from {
            StartFrom::Block(block) => block,
            StartFrom::Latest => self.block_number().await? + 1,
        };
        let (tx, rx) = mpsc::channel(self.inner.config.subscription_buffer);
        let cancel = CancellationToken::new();
        tokio::spawn(self.clone().poll_logs(kinds.to_vec(), next_block, tx, cancel.clone()));
        tracing::info!(next_block, "event subscription opened");
        Ok(EventSubscription::new(rx, cancel, next_block))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x0"), Some(0));
        assert_eq!(parse_quantity("0x1a"), Some(26));
        assert_eq!(parse_quantity("1a"), None);
        assert_eq!(parse_quantity("0xzz"), None);
    }

    #[test]
    fn test_into_received_decodes_payload() {
        let event = crate::LedgerEvent::HistoryUpdated { id: "5".into(), event_detail: "Shipped".into() };
        let (topics, data) = abi::encode_log(&event).unwrap();
        let log = RpcLog {
            topics: topics.iter().map(|t| abi::to_hex(t)).collect(),
            data: abi::to_hex(&data),
            block_number: Some("0x10".into()),
            log_index: Some("0x2".into()),
            transaction_hash: Some("0xabc".into()),
            removed: false,
        };
        let received = into_received(log).unwrap();
        assert_eq!(received.position, EventPosition { block: 16, log_index: 2 });
        assert_eq!(received.event, Ok(event));
        assert_eq!(received.tx_hash.as_str(), "0xabc");
    }

    #[test]
    fn test_into_received_keeps_undecodable_payload() {
        let log = RpcLog {
            topics: vec![abi::to_hex(&abi::event_topic(abi::DRUG_ADDED_SIGNATURE))],
            data: "0x1234".into(),
            block_number: Some("0x1".into()),
            log_index: Some("0x0".into()),
            transaction_hash: Some("0xdef".into()),
            removed: false,
        };
        let received = into_received(log).unwrap();
        assert!(matches!(received.event, Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_into_received_drops_pending_logs() {
        let log = RpcLog {
            topics: vec![],
            data: "0x".into(),
            block_number: None,
            log_index: None,
            transaction_hash: None,
            removed: false,
        };
        assert!(into_received(log).is_none());
    }
}

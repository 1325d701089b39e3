//! The ledger client contract.
//!
//! [`LedgerClient`] is the seam between the reconciliation core and the
//! blockchain. The contract behind it is a black box that stores drugs under
//! `uint256` ids, keeps a list of history strings per drug and emits a
//! [`LedgerEvent`] for every accepted transaction.
//!
//! | Method | Description |
//! |--------|-------------|
//! | [`submit_add_drug`](LedgerClient::submit_add_drug) | Register a drug on chain |
//! | [`submit_history_update`](LedgerClient::submit_history_update) | Append a history string |
//! | [`query_drug`](LedgerClient::query_drug) | Read a drug, `None` if absent |
//! | [`default_sender`](LedgerClient::default_sender) | The node's first account, if any |
//! | [`subscribe_events`](LedgerClient::subscribe_events) | Stream contract events |

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{DecodeError, LedgerError, LedgerResult};

/// A ledger transaction hash (`0x`-prefixed hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl TxHash {
    /// Returns the hash as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<TxHash> for String {
    fn from(hash: TxHash) -> Self {
        hash.0
    }
}

/// A drug as the ledger reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainDrug {
    /// Canonical decimal id.
    pub id: String,
    /// Product name.
    pub name: String,
    /// Address of the account that registered the drug.
    pub manufacturer: String,
    /// History strings in the order they were appended.
    pub history_raw: Vec<String>,
}

/// Kinds of contract events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `DrugAdded(uint256,string,address)`.
    DrugAdded,
    /// `HistoryUpdated(uint256,string)`.
    HistoryUpdated,
}

impl EventKind {
    /// Both kinds.
    pub const ALL: [EventKind; 2] = [EventKind::DrugAdded, EventKind::HistoryUpdated];
}

/// A decoded contract event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    /// A drug was registered.
    DrugAdded {
        /// Canonical decimal id.
        id: String,
        /// Product name.
        name: String,
        /// Registering account.
        manufacturer: String,
    },
    /// A history string was appended.
    HistoryUpdated {
        /// Canonical decimal id.
        id: String,
        /// The appended history string.
        event_detail: String,
    },
}

impl LedgerEvent {
    /// The event's kind.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DrugAdded { .. } => EventKind::DrugAdded,
            Self::HistoryUpdated { .. } => EventKind::HistoryUpdated,
        }
    }

    /// The drug id the event refers to.
    pub fn drug_id(&self) -> &str {
        match self {
            Self::DrugAdded { id, .. } | Self::HistoryUpdated { id, .. } => id,
        }
    }
}

/// Position of an event in the chain: `(block, log index)`.
///
/// Ordering follows the chain, so a subscriber can skip anything at or before
/// the last position it handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EventPosition {
    /// Block number.
    pub block: u64,
    /// Index of the log within the block.
    pub log_index: u64,
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.log_index)
    }
}

/// One item delivered by an [`EventSubscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    /// Transaction that emitted the event.
    pub tx_hash: TxHash,
    /// Where the event sits in the chain.
    pub position: EventPosition,
    /// The decoded event, or why it could not be decoded.
    pub event: Result<LedgerEvent, DecodeError>,
}

/// Where a subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    /// Only events produced after subscribing.
    #[default]
    Latest,
    /// Every event from this block on (inclusive).
    Block(u64),
}

/// A live stream of ledger events.
///
/// Backed by a producer task feeding a bounded channel. A transport failure
/// is delivered once as `Err(LedgerError::Unavailable)` and ends the stream;
/// callers resubscribe to continue. Dropping the subscription stops the
/// producer.
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::Receiver<LedgerResult<ReceivedEvent>>,
    cancel: CancellationToken,
    start_block: u64,
    finished: bool,
}

impl EventSubscription {
    /// Creates a subscription fed by `rx` that covers every block from
    /// `start_block` on; `cancel` stops the producer.
    pub fn new(
        rx: mpsc::Receiver<LedgerResult<ReceivedEvent>>,
        cancel: CancellationToken,
        start_block: u64,
    ) -> Self {
        Self { rx, cancel, start_block, finished: false }
    }

    /// The first block this subscription covers. [`StartFrom::Latest`] is
    /// resolved to a concrete block when subscribing, so a caller can resume
    /// from here without a gap.
    pub fn start_block(&self) -> u64 {
        self.start_block
    }

    /// Waits for the next item.
    ///
    /// Returns `None` once the stream has ended: after an error item, or when
    /// the producer went away.
    pub async fn next(&mut self) -> Option<LedgerResult<ReceivedEvent>> {
        if self.finished {
            return None;
        }
        let item = self.rx.recv().await;
        match &item {
            Some(Err(_)) => self.finish(),
            None => {
                self.finished = true;
                // A producer that vanished without saying why is a transport failure.
                return Some(Err(LedgerError::unavailable("event subscription closed")));
            },
            Some(Ok(_)) => {},
        }
        item
    }

    fn finish(&mut self) {
        self.finished = true;
        self.cancel.cancel();
        self.rx.close();
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Access to the drug registry contract.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submits `addDrug(id, name)` from `sender`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidDrugId`] if `id` is not a decimal `uint256`.
    /// - [`LedgerError::TransactionRejected`] if the contract refuses (e.g. duplicate id).
    /// - [`LedgerError::Unavailable`] on transport failure or timeout.
    async fn submit_add_drug(&self, id: &str, name: &str, sender: &str) -> LedgerResult<TxHash>;

    /// Submits `updateHistory(id, event_detail)` from `sender`.
    ///
    /// # Errors
    ///
    /// Same as [`submit_add_drug`](LedgerClient::submit_add_drug).
    async fn submit_history_update(
        &self,
        id: &str,
        event_detail: &str,
        sender: &str,
    ) -> LedgerResult<TxHash>;

    /// Reads a drug. The contract's zero-id sentinel maps to `None`.
    async fn query_drug(&self, id: &str) -> LedgerResult<Option<OnChainDrug>>;

    /// The node's default signing account, used when the acting user has no
    /// wallet.
    async fn default_sender(&self) -> LedgerResult<Option<String>>;

    /// Opens a stream of events of the given kinds.
    async fn subscribe_events(
        &self,
        kinds: &[EventKind],
        from: StartFrom,
    ) -> LedgerResult<EventSubscription>;
}

#[async_trait]
impl<L: LedgerClient + ?Sized> LedgerClient for std::sync::Arc<L> {
    async fn submit_add_drug(&self, id: &str, name: &str, sender: &str) -> LedgerResult<TxHash> {
        (**self).submit_add_drug(id, name, sender).await
    }

    async fn submit_history_update(
        &self,
        id: &str,
        event_detail: &str,
        sender: &str,
    ) -> LedgerResult<TxHash> {
        (**self).submit_history_update(id, event_detail, sender).await
    }

    async fn query_drug(&self, id: &str) -> LedgerResult<Option<OnChainDrug>> {
        (**self).query_drug(id).await
    }

    async fn default_sender(&self) -> LedgerResult<Option<String>> {
        (**self).default_sender().await
    }

    async fn subscribe_events(
        &self,
        kinds: &[EventKind],
        from: StartFrom,
    ) -> LedgerResult<EventSubscription> {
        (**self).subscribe_events(kinds, from).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn received(block: u64) -> ReceivedEvent {
        ReceivedEvent {
            tx_hash: TxHash(format!("0x{block:064x}")),
            position: EventPosition { block, log_index: 0 },
            event: Ok(LedgerEvent::HistoryUpdated { id: "1".into(), event_detail: "x".into() }),
        }
    }

    #[test]
    fn test_positions_order_by_block_then_index() {
        let a = EventPosition { block: 1, log_index: 9 };
        let b = EventPosition { block: 2, log_index: 0 };
        let c = EventPosition { block: 2, log_index: 1 };
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_error_item_ends_subscription() {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let mut sub = EventSubscription::new(rx, cancel.clone(), 1);

        tx.send(Ok(received(1))).await.unwrap();
        tx.send(Err(LedgerError::unavailable("gone"))).await.unwrap();

        assert!(sub.next().await.unwrap().is_ok());
        assert!(sub.next().await.unwrap().is_err());
        assert!(cancel.is_cancelled());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_producer_reports_unavailable_once() {
        let (tx, rx) = mpsc::channel(1);
        let mut sub = EventSubscription::new(rx, CancellationToken::new(), 1);
        drop(tx);

        assert!(matches!(sub.next().await, Some(Err(LedgerError::Unavailable { .. }))));
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn test_drop_cancels_producer() {
        let (_tx, rx) = mpsc::channel::<LedgerResult<ReceivedEvent>>(1);
        let cancel = CancellationToken::new();
        drop(EventSubscription::new(rx, cancel.clone(), 1));
        assert!(cancel.is_cancelled());
    }
}

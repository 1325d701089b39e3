//! In-memory [`LedgerClient`] for tests.
//!
//! [`MockLedger`] behaves like the drug registry contract: it rejects
//! duplicate ids, appends history strings and emits one event per accepted
//! transaction, each in its own block. Every transaction is logged, so
//! subscriptions starting at an earlier block see it again.
//!
//! Faults are injected per instance:
//!
//! | Method | Effect |
//! |--------|--------|
//! | [`set_unavailable`](MockLedger::set_unavailable) | Every call fails with `Unavailable` |
//! | [`reject_next_submission`](MockLedger::reject_next_submission) | Next submission is reverted |
//! | [`override_query`](MockLedger::override_query) | `query_drug` returns a fixed answer |
//! | [`inject_malformed_event`](MockLedger::inject_malformed_event) | Emit an undecodable log |
//! | [`drop_subscriptions`](MockLedger::drop_subscriptions) | Break every open stream |
//! | [`set_commit_latency`](MockLedger::set_commit_latency) | Delay receipts past their events |

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    abi::canonical_drug_id,
    client::{
        EventKind, EventPosition, EventSubscription, LedgerClient, LedgerEvent, OnChainDrug,
        ReceivedEvent, StartFrom, TxHash,
    },
    error::{DecodeError, LedgerError, LedgerResult},
};

const SUBSCRIBER_BUFFER: usize = 1024;

/// Account returned by [`LedgerClient::default_sender`] unless overridden.
pub const MOCK_NODE_ACCOUNT: &str = "0x00000000000000000000000000000000000000aa";

#[derive(Debug)]
struct Subscriber {
    kinds: Vec<EventKind>,
    tx: mpsc::Sender<LedgerResult<ReceivedEvent>>,
}

#[derive(Debug)]
struct State {
    drugs: BTreeMap<String, OnChainDrug>,
    log: Vec<ReceivedEvent>,
    subscribers: Vec<Subscriber>,
    next_block: u64,
    unavailable: bool,
    reject_next: Option<String>,
    query_overrides: HashMap<String, Option<OnChainDrug>>,
    default_sender: Option<String>,
    submissions: Vec<Submission>,
    queries: u64,
    subscriptions_opened: u64,
    commit_latency: Duration,
}

/// A transaction the mock accepted or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Contract method, `addDrug` or `updateHistory`.
    pub method: &'static str,
    /// Canonical drug id.
    pub id: String,
    /// Name or history string.
    pub payload: String,
    /// Sending account.
    pub sender: String,
    /// Whether the contract accepted it.
    pub accepted: bool,
}

impl State {
    fn check_available(&self) -> LedgerResult<()> {
        if self.unavailable {
            return Err(LedgerError::unavailable("mock ledger unavailable"));
        }
        Ok(())
    }

    fn emit(&mut self, event: Result<LedgerEvent, DecodeError>) -> TxHash {
        let block = self.next_block;
        self.next_block += 1;
        let received = ReceivedEvent {
            tx_hash: TxHash(format!("0x{block:064x}")),
            position: EventPosition { block, log_index: 0 },
            event,
        };
        self.subscribers.retain(|sub| {
            let wanted = match &received.event {
                Ok(event) => sub.kinds.contains(&event.kind()),
                Err(_) => true,
            };
            !wanted || sub.tx.try_send(Ok(received.clone())).is_ok()
        });
        let hash = received.tx_hash.clone();
        self.log.push(received);
        hash
    }

    fn submit(
        &mut self,
        method: &'static str,
        id: &str,
        payload: &str,
        sender: &str,
    ) -> LedgerResult<String> {
        self.check_available()?;
        let id = canonical_drug_id(id)?;
        let rejection = self.reject_next.take();
        self.submissions.push(Submission {
            method,
            id: id.clone(),
            payload: payload.to_owned(),
            sender: sender.to_owned(),
            accepted: rejection.is_none(),
        });
        match rejection {
            Some(reason) => Err(LedgerError::rejected(reason)),
            None => Ok(id),
        }
    }

    fn add_drug(&mut self, id: &str, name: &str, sender: &str) -> LedgerResult<TxHash> {
        let id = self.submit("addDrug", id, name, sender)?;
        if self.drugs.contains_key(&id) {
            if let Some(last) = self.submissions.last_mut() {
                last.accepted = false;
            }
            return Err(LedgerError::rejected("execution reverted: Drug already exists"));
        }
        self.drugs.insert(
            id.clone(),
            OnChainDrug {
                id: id.clone(),
                name: name.to_owned(),
                manufacturer: sender.to_owned(),
                history_raw: Vec::new(),
            },
        );
        Ok(self.emit(Ok(LedgerEvent::DrugAdded {
            id,
            name: name.to_owned(),
            manufacturer: sender.to_owned(),
        })))
    }

    fn update_history(
        &mut self,
        id: &str,
        event_detail: &str,
        sender: &str,
    ) -> LedgerResult<TxHash> {
        let id = self.submit("updateHistory", id, event_detail, sender)?;
        let Some(drug) = self.drugs.get_mut(&id) else {
            if let Some(last) = self.submissions.last_mut() {
                last.accepted = false;
            }
            return Err(LedgerError::rejected("execution reverted: Drug does not exist"));
        };
        drug.history_raw.push(event_detail.to_owned());
        Ok(self.emit(Ok(LedgerEvent::HistoryUpdated { id, event_detail: event_detail.to_owned() })))
    }
}

/// In-memory drug registry contract. Cheaply cloneable; clones share state.
#[derive(Debug, Clone)]
pub struct MockLedger {
    state: Arc<Mutex<State>>,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLedger {
    /// Creates an empty ledger whose node account is [`MOCK_NODE_ACCOUNT`].
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                drugs: BTreeMap::new(),
                log: Vec::new(),
                subscribers: Vec::new(),
                next_block: 1,
                unavailable: false,
                reject_next: None,
                query_overrides: HashMap::new(),
                default_sender: Some(MOCK_NODE_ACCOUNT.to_owned()),
                submissions: Vec::new(),
                queries: 0,
                subscriptions_opened: 0,
                commit_latency: Duration::ZERO,
            })),
        }
    }

    /// Makes every call fail with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Reverts the next submission with `reason`.
    pub fn reject_next_submission(&self, reason: impl Into<String>) {
        self.state.lock().reject_next = Some(reason.into());
    }

    /// Answers `query_drug(id)` with `answer` instead of the contract state.
    pub fn override_query(&self, id: &str, answer: Option<OnChainDrug>) {
        self.state.lock().query_overrides.insert(id.to_owned(), answer);
    }

    /// Delays the answer to every accepted submission by `latency`. The
    /// transaction and its event are committed before the delay, like a node
    /// that is slow to return the receipt.
    pub fn set_commit_latency(&self, latency: Duration) {
        self.state.lock().commit_latency = latency;
    }

    async fn confirm(
        &self,
        result: LedgerResult<TxHash>,
        latency: Duration,
    ) -> LedgerResult<TxHash> {
        if result.is_ok() && !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        result
    }

    /// Sets the node's default account.
    pub fn set_default_sender(&self, sender: Option<&str>) {
        self.state.lock().default_sender = sender.map(str::to_owned);
    }

    /// Emits an event without touching contract state, as if another
    /// contract instance or a replayed block produced it.
    pub fn emit(&self, event: LedgerEvent) -> TxHash {
        self.state.lock().emit(Ok(event))
    }

    /// Emits a log that cannot be decoded.
    pub fn inject_malformed_event(&self) -> TxHash {
        self.state.lock().emit(Err(DecodeError::UnknownTopic("0xdeadbeef".to_owned())))
    }

    /// Ends every open subscription with an `Unavailable` error.
    pub fn drop_subscriptions(&self) {
        let subscribers = std::mem::take(&mut self.state.lock().subscribers);
        for sub in subscribers {
            let _ = sub.tx.try_send(Err(LedgerError::unavailable("connection reset")));
        }
    }

    /// Returns the contract's view of a drug.
    pub fn drug(&self, id: &str) -> Option<OnChainDrug> {
        self.state.lock().drugs.get(id).cloned()
    }

    /// Returns every submission seen so far, accepted or not.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Number of `query_drug` calls that reached the contract.
    pub fn query_count(&self) -> u64 {
        self.state.lock().queries
    }

    /// Number of subscriptions opened so far.
    pub fn subscriptions_opened(&self) -> u64 {
        self.state.lock().subscriptions_opened
    }

    /// Number of subscriptions currently attached.
    pub fn active_subscriptions(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state.subscribers.len()
    }

    /// Block the next transaction will land in.
    pub fn next_block(&self) -> u64 {
        self.state.lock().next_block
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn submit_add_drug(&self, id: &str, name: &str, sender: &str) -> LedgerResult<TxHash> {
        let (result, latency) = {
            let mut state = self.state.lock();
            (state.add_drug(id, name, sender), state.commit_latency)
        };
        self.confirm(result, latency).await
    }

    async fn submit_history_update(
        &self,
        id: &str,
        event_detail: &str,
        sender: &str,
    ) -> LedgerResult<TxHash> {
        let (result, latency) = {
            let mut state = self.state.lock();
            (state.update_history(id, event_detail, sender), state.commit_latency)
        };
        self.confirm(result, latency).await
    }

    async fn query_drug(&self, id: &str) -> LedgerResult<Option<OnChainDrug>> {
        let mut state = self.state.lock();
        state.check_available()?;
        let id = canonical_drug_id(id)?;
        state.queries += 1;
        if let Some(answer) = state.query_overrides.get(&id) {
            return Ok(answer.clone().filter(|drug| drug.id != "0"));
        }
        Ok(state.drugs.get(&id).cloned())
    }

    async fn default_sender(&self) -> LedgerResult<Option<String>> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.default_sender.clone())
    }

    async fn subscribe_events(
        &self,
        kinds: &[EventKind],
        from: StartFrom,
    ) -> LedgerResult<EventSubscription> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.subscriptions_opened += 1;

        let start_block = match from {
            StartFrom::Block(block) => block,
            StartFrom::Latest => state.next_block,
        };
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        if let StartFrom::Block(start) = from {
            let backlog = state.log.iter().filter(|received| {
                received.position.block >= start
                    && received.event.as_ref().map_or(true, |event| kinds.contains(&event.kind()))
            });
            for received in backlog {
                if tx.try_send(Ok(received.clone())).is_err() {
                    return Err(LedgerError::unavailable("subscription backlog exceeds buffer"));
                }
            }
        }
        state.subscribers.push(Subscriber { kinds: kinds.to_vec(), tx });
        Ok(EventSubscription::new(rx, CancellationToken::new(), start_block))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_then_query() {
        let ledger = MockLedger::new();
        ledger.submit_add_drug("007", "Aspirin", "0xabc").await.unwrap();
        let drug = ledger.query_drug("7").await.unwrap().unwrap();
        assert_eq!(drug.name, "Aspirin");
        assert_eq!(drug.manufacturer, "0xabc");
    }

    #[tokio::test]
    async fn test_duplicate_add_is_rejected() {
        let ledger = MockLedger::new();
        ledger.submit_add_drug("1", "A", "0xabc").await.unwrap();
        let err = ledger.submit_add_drug("1", "B", "0xabc").await.unwrap_err();
        assert!(matches!(err, LedgerError::TransactionRejected { .. }));
        let submissions = ledger.submissions();
        assert_eq!(submissions.len(), 2);
        assert!(!submissions[1].accepted);
    }

    #[tokio::test]
    async fn test_history_for_unknown_drug_is_rejected() {
        let ledger = MockLedger::new();
        let err = ledger.submit_history_update("9", "Shipped", "0xabc").await.unwrap_err();
        assert!(matches!(err, LedgerError::TransactionRejected { .. }));
    }

    #[tokio::test]
    async fn test_subscribers_see_live_events_in_order() {
        let ledger = MockLedger::new();
        let mut sub = ledger.subscribe_events(&EventKind::ALL, StartFrom::Latest).await.unwrap();
        ledger.submit_add_drug("1", "A", "0xabc").await.unwrap();
        ledger.submit_history_update("1", "Shipped", "0xabc").await.unwrap();

        let first = sub.next().await.unwrap().unwrap();
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(first.event.unwrap().kind(), EventKind::DrugAdded);
        assert!(first.position < second.position);
    }

    #[tokio::test]
    async fn test_latest_subscription_reports_its_start_block() {
        let ledger = MockLedger::new();
        ledger.submit_add_drug("1", "A", "0xabc").await.unwrap();
        let sub = ledger.subscribe_events(&EventKind::ALL, StartFrom::Latest).await.unwrap();
        assert_eq!(sub.start_block(), 2);
        assert_eq!(sub.start_block(), ledger.next_block());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_latency_delivers_event_before_receipt() {
        let ledger = MockLedger::new();
        ledger.set_commit_latency(Duration::from_millis(50));
        let mut sub = ledger.subscribe_events(&EventKind::ALL, StartFrom::Latest).await.unwrap();

        let submit = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.submit_add_drug("1", "A", "0xabc").await }
        });
        let event = sub.next().await.unwrap().unwrap();
        assert!(!submit.is_finished());
        assert_eq!(submit.await.unwrap().unwrap(), event.tx_hash);
    }

    #[tokio::test]
    async fn test_subscription_from_block_replays_backlog() {
        let ledger = MockLedger::new();
        ledger.submit_add_drug("1", "A", "0xabc").await.unwrap();
        ledger.submit_history_update("1", "Shipped", "0xabc").await.unwrap();

        let mut sub =
            ledger.subscribe_events(&[EventKind::HistoryUpdated], StartFrom::Block(1)).await.unwrap();
        let only = sub.next().await.unwrap().unwrap();
        assert_eq!(
            only.event.unwrap(),
            LedgerEvent::HistoryUpdated { id: "1".into(), event_detail: "Shipped".into() }
        );
    }

    #[tokio::test]
    async fn test_drop_subscriptions_ends_streams() {
        let ledger = MockLedger::new();
        let mut sub = ledger.subscribe_events(&EventKind::ALL, StartFrom::Latest).await.unwrap();
        ledger.drop_subscriptions();
        assert!(matches!(sub.next().await, Some(Err(LedgerError::Unavailable { .. }))));
        assert!(sub.next().await.is_none());
        assert_eq!(ledger.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_and_overrides() {
        let ledger = MockLedger::new();
        ledger.set_unavailable(true);
        assert!(ledger.query_drug("1").await.unwrap_err().is_transient());
        ledger.set_unavailable(false);

        ledger.override_query(
            "5",
            Some(OnChainDrug {
                id: "0".into(),
                name: String::new(),
                manufacturer: String::new(),
                history_raw: vec![],
            }),
        );
        assert!(ledger.query_drug("5").await.unwrap().is_none());
    }
}

//! Ledger event sync engine.
//!
//! A background task subscribes to `DrugAdded` and `HistoryUpdated` and
//! mirrors them into the record store:
//!
//! - `DrugAdded` upserts the drug (seeded as `Manufactured (On-Chain)` on
//!   insert, verification fields merged otherwise).
//! - `HistoryUpdated` appends to an existing drug's history; an unknown drug
//!   is audited as a failure and nothing is fabricated.
//! - Undecodable events and store failures are audited and skipped.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────────┐      ┌────────────┐  subscribed  ┌───────────┐
//! │ Disconnected │ ───→ │ Connecting │ ───────────→ │ Listening │
//! └──────────────┘      └────────────┘              └───────────┘
//!        ↑                    ↑  │ failed                 │ stream error
//!        │              ┌─────────┐                       │
//!        │              │ Backoff │ ←─────────────────────┘
//!        └───────────── └─────────┘
//!
//! any state ── shutdown ──→ Stopped
//! ```
//!
//! The engine remembers the position of the last handled event. A
//! resubscription starts at that block and skips everything at or before it,
//! so redelivered events are never applied twice. Before any event is
//! handled, resubscriptions start at the block the first subscription
//! resolved `Latest` to, so events emitted while reconnecting are not lost.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use pharmatrace_ledger::{
    EventKind, EventPosition, EventSubscription, LedgerClient, LedgerError, LedgerEvent,
    ReceivedEvent, StartFrom,
};
use pharmatrace_store::{
    AppendOutcome, AuditAction, AuditEntry, AuditStatus, AuditTrail, DocumentBackend, DrugPatch,
    DrugRecords, HistoryEntry, StorageResult,
};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;

/// Name recorded as the actor of every change the engine makes.
pub const LISTENER_NAME: &str = "Blockchain Listener";

/// Status seeded on drugs first seen through a `DrugAdded` event.
pub const ON_CHAIN_MANUFACTURED_STATUS: &str = "Manufactured (On-Chain)";

/// Connection state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not subscribed.
    Disconnected,
    /// Opening a subscription.
    Connecting,
    /// Receiving events.
    Listening,
    /// Waiting before the next connection attempt.
    Backoff {
        /// Zero-based reconnect attempt.
        attempt: u32,
        /// How long the engine waits.
        delay: Duration,
    },
    /// Shut down; terminal.
    Stopped,
}

/// Counters describing the engine's work so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStats {
    /// Events handled (applied, rejected or audited as errors).
    pub events_handled: u64,
    /// Redelivered events skipped by the resume cursor.
    pub events_skipped: u64,
    /// Drugs created from `DrugAdded`.
    pub drugs_inserted: u64,
    /// History entries appended from `HistoryUpdated`.
    pub history_appended: u64,
    /// `HistoryUpdated` events whose transaction was already in the history.
    pub echoes_suppressed: u64,
    /// `HistoryUpdated` events for unknown drugs.
    pub drugs_not_found: u64,
    /// Events that could not be decoded.
    pub decode_errors: u64,
    /// Events whose handling failed in the store.
    pub handler_errors: u64,
    /// Subscriptions opened.
    pub subscriptions: u64,
    /// Position of the last handled event.
    pub last_position: Option<EventPosition>,
}

#[derive(Debug, Default)]
struct Counters {
    events_handled: AtomicU64,
    events_skipped: AtomicU64,
    drugs_inserted: AtomicU64,
    history_appended: AtomicU64,
    echoes_suppressed: AtomicU64,
    drugs_not_found: AtomicU64,
    decode_errors: AtomicU64,
    handler_errors: AtomicU64,
    subscriptions: AtomicU64,
    last_position: Mutex<Option<EventPosition>>,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SyncStats {
        SyncStats {
            events_handled: self.events_handled.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            drugs_inserted: self.drugs_inserted.load(Ordering::Relaxed),
            history_appended: self.history_appended.load(Ordering::Relaxed),
            echoes_suppressed: self.echoes_suppressed.load(Ordering::Relaxed),
            drugs_not_found: self.drugs_not_found.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            last_position: *self.last_position.lock(),
        }
    }
}

/// Handle to a running engine.
///
/// Dropping the handle cancels the engine without waiting for it.
#[derive(Debug)]
pub struct SyncHandle {
    state: watch::Receiver<SyncState>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// The current state.
    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// A receiver observing every state change.
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    /// Waits until the state satisfies `predicate` and returns it.
    ///
    /// Returns the last state if the engine exits first.
    pub async fn wait_for(&self, predicate: impl Fn(&SyncState) -> bool) -> SyncState {
        let mut rx = self.state.clone();
        if let Ok(state) = rx.wait_for(|state| predicate(state)).await {
            return *state;
        }
        *rx.borrow()
    }

    /// A snapshot of the engine's counters.
    pub fn stats(&self) -> SyncStats {
        self.counters.snapshot()
    }

    /// The token that stops the engine; link it to a process-wide shutdown.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stops the engine and waits for the task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            tracing::warn!(error = %err, "event sync task panicked");
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Mirrors ledger events into the record store.
pub struct EventSyncEngine<B, L> {
    records: DrugRecords<B>,
    audit: AuditTrail<B>,
    ledger: L,
    config: SyncConfig,
    state: watch::Sender<SyncState>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    cursor: Option<EventPosition>,
    /// First block of the first subscription, used until the cursor is set.
    resume_from: Option<u64>,
}

impl<B, L> EventSyncEngine<B, L>
where
    B: DocumentBackend + 'static,
    L: LedgerClient + 'static,
{
    /// Starts the engine on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn spawn(
        records: DrugRecords<B>,
        audit: AuditTrail<B>,
        ledger: L,
        config: SyncConfig,
    ) -> SyncHandle {
        let (state, state_rx) = watch::channel(SyncState::Disconnected);
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();
        let engine = Self {
            records,
            audit,
            ledger,
            config,
            state,
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
            cursor: None,
            resume_from: None,
        };
        let task = tokio::spawn(engine.run());
        SyncHandle { state: state_rx, counters, cancel, task: Some(task) }
    }

    async fn run(mut self) {
        let mut attempt: u32 = 0;
        while !self.cancel.is_cancelled() {
            self.set_state(SyncState::Connecting);
            let from = match (self.cursor, self.resume_from.or(self.config.start_block())) {
                (Some(position), _) => StartFrom::Block(position.block),
                (None, Some(block)) => StartFrom::Block(block),
                (None, None) => StartFrom::Latest,
            };

            let subscribed = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.ledger.subscribe_events(&EventKind::ALL, from) => result,
            };
            let failure = match subscribed {
                Ok(mut subscription) => {
                    Counters::bump(&self.counters.subscriptions);
                    if self.resume_from.is_none() {
                        self.resume_from = Some(subscription.start_block());
                    }
                    self.set_state(SyncState::Listening);
                    attempt = 0;
                    match self.listen(&mut subscription).await {
                        Some(err) => err,
                        None => break,
                    }
                },
                Err(err) => err,
            };

            tracing::warn!(error = %failure, "event subscription lost");
            self.set_state(SyncState::Disconnected);
            let delay = self.config.backoff(attempt);
            self.set_state(SyncState::Backoff { attempt, delay });
            attempt = attempt.saturating_add(1);
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {},
            }
        }
        self.set_state(SyncState::Stopped);
        tracing::info!("event sync engine stopped");
    }

    /// Handles events until the stream fails (returns the error) or the
    /// engine is cancelled (returns `None`).
    async fn listen(&mut self, subscription: &mut EventSubscription) -> Option<LedgerError> {
        loop {
            let item = tokio::select! {
                () = self.cancel.cancelled() => return None,
                item = subscription.next() => item,
            };
            match item {
                Some(Ok(received)) => self.handle(received).await,
                Some(Err(err)) => return Some(err),
                None => return Some(LedgerError::unavailable("event stream ended")),
            }
        }
    }

    fn set_state(&self, state: SyncState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(from = ?previous, to = ?state, "sync state changed");
        }
    }

    async fn handle(&mut self, received: ReceivedEvent) {
        let ReceivedEvent { tx_hash, position, event } = received;
        if self.cursor.is_some_and(|cursor| position <= cursor) {
            tracing::debug!(%position, "skipping already handled event");
            Counters::bump(&self.counters.events_skipped);
            return;
        }

        let tx_hash = tx_hash.0;
        let result = match event {
            Ok(LedgerEvent::DrugAdded { id, name, manufacturer }) => {
                self.on_drug_added(&id, &name, &manufacturer, &tx_hash).await
            },
            Ok(LedgerEvent::HistoryUpdated { id, event_detail }) => {
                self.on_history_updated(&id, &event_detail, &tx_hash).await
            },
            Err(err) => {
                tracing::warn!(error = %err, %tx_hash, "undecodable ledger event");
                Counters::bump(&self.counters.decode_errors);
                self.record_audit(
                    AuditAction::ErrorProcessingLedgerEvent,
                    format!("Error: {err}"),
                    &tx_hash,
                    AuditStatus::Failed,
                )
                .await
            },
        };

        if let Err(err) = result {
            tracing::error!(error = %err, %tx_hash, %position, "failed to apply ledger event");
            Counters::bump(&self.counters.handler_errors);
            if let Err(audit_err) = self
                .record_audit(
                    AuditAction::ErrorProcessingLedgerEvent,
                    format!("Error: {err}"),
                    &tx_hash,
                    AuditStatus::Failed,
                )
                .await
            {
                tracing::error!(error = %audit_err, %tx_hash, "failed to audit ledger event error");
            }
        }

        self.cursor = Some(position);
        *self.counters.last_position.lock() = Some(position);
        Counters::bump(&self.counters.events_handled);
    }

    async fn on_drug_added(
        &self,
        id: &str,
        name: &str,
        manufacturer: &str,
        tx_hash: &str,
    ) -> StorageResult<()> {
        let patch = DrugPatch::builder()
            .name(name)
            .manufacturer(manufacturer)
            .is_verified(true)
            .is_flagged(false)
            .build();
        let seed = HistoryEntry::builder()
            .status(ON_CHAIN_MANUFACTURED_STATUS)
            .updated_by(LISTENER_NAME)
            .owner(manufacturer)
            .tx_hash(tx_hash)
            .build();
        let outcome = self.records.upsert_drug(id, &patch, &seed).await?;
        if outcome.is_inserted() {
            Counters::bump(&self.counters.drugs_inserted);
        }
        tracing::info!(drug_id = id, inserted = outcome.is_inserted(), "drug synced from ledger");
        self.record_audit(
            AuditAction::DrugSyncedFromBlockchain,
            format!("ID: {id}, Name: {name}, Manufacturer: {manufacturer}"),
            tx_hash,
            AuditStatus::Upserted,
        )
        .await
    }

    async fn on_history_updated(
        &self,
        id: &str,
        event_detail: &str,
        tx_hash: &str,
    ) -> StorageResult<()> {
        let details = format!("Drug ID: {id}, Event: {event_detail}");
        let Some(drug) = self.records.find_by_id(id).await? else {
            tracing::warn!(drug_id = id, "history update for unknown drug");
            Counters::bump(&self.counters.drugs_not_found);
            return self
                .record_audit(
                    AuditAction::HistoryUpdateFailedDrugNotFound,
                    details,
                    tx_hash,
                    AuditStatus::Failed,
                )
                .await;
        };

        let entry = HistoryEntry::builder()
            .status(event_detail)
            .updated_by(LISTENER_NAME)
            .owner(drug.current_owner())
            .tx_hash(tx_hash)
            .build();
        match self.records.append_history(id, entry).await? {
            AppendOutcome::Appended(_) => {
                Counters::bump(&self.counters.history_appended);
                self.record_audit(
                    AuditAction::DrugHistoryUpdatedOnChain,
                    details,
                    tx_hash,
                    AuditStatus::Success,
                )
                .await
            },
            AppendOutcome::Duplicate(_) | AppendOutcome::Replaced(_) => {
                tracing::debug!(drug_id = id, tx_hash, "transaction already in history");
                Counters::bump(&self.counters.echoes_suppressed);
                Ok(())
            },
        }
    }

    async fn record_audit(
        &self,
        action: AuditAction,
        details: String,
        tx_hash: &str,
        status: AuditStatus,
    ) -> StorageResult<()> {
        let entry = AuditEntry::builder()
            .user_name(LISTENER_NAME)
            .action(action)
            .details(details)
            .tx_hash(tx_hash)
            .status(status)
            .build();
        self.audit.record(entry).await
    }
}

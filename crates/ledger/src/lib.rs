//! Drug registry ledger client for Pharmatrace.
//!
//! The reconciliation engine talks to the blockchain only through the
//! [`LedgerClient`] trait. This crate provides the trait, an Ethereum
//! JSON-RPC implementation and, behind the `testutil` feature, an in-memory
//! contract for tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    LedgerClient trait                       │
//! │  (submit add/update, query, default sender, subscribe)      │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │       RpcLedgerClient        │     MockLedger (testutil)    │
//! │ circuit breaker, retry,      │  in-memory contract with     │
//! │ eth_getLogs poll task        │  fault injection             │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │        abi: keccak selectors, uint256 ids, log decoding     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `mock` module with [`MockLedger`](mock::MockLedger).
//! - **`failpoints`**: Compiles the `fail` fail point in the retry loop.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod abi;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
#[cfg(any(test, feature = "testutil"))]
pub mod mock;
mod retry;
pub mod rpc;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_HALF_OPEN_SUCCESS_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT,
};
pub use client::{
    EventKind, EventPosition, EventSubscription, LedgerClient, LedgerEvent, OnChainDrug,
    ReceivedEvent, StartFrom, TxHash,
};
pub use config::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_GAS_LIMIT, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF,
    DEFAULT_MAX_RETRIES, DEFAULT_POLL_INTERVAL, DEFAULT_SUBSCRIPTION_BUFFER, RetryConfig,
    RpcLedgerConfig,
};
pub use error::{BoxError, DecodeError, LedgerError, LedgerResult};
pub use rpc::RpcLedgerClient;

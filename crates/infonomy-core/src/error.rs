//! Error taxonomy shared by every component.
//!
//! `StoreError` is what `infonomy-store` raises; `MarketError` is the
//! surface-level taxonomy the HTTP layer maps to status codes. Both derive
//! `thiserror::Error` the way the rest of this corpus defines error enums.

use thiserror::Error;

/// Errors from the persistence layer (§4.1).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    /// Recoverable store error (deadlock, connection drop). Callers retry
    /// up to 3 times with exponential backoff; never retried automatically.
    #[error("transient store error: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Errors from the agent bridge (§4.6, §7).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent request failed: {0}")]
    Request(String),
    #[error("agent response failed schema validation: {0}")]
    SchemaInvalid(String),
    #[error("agent exhausted retries")]
    RetriesExhausted,
}

/// Surface-level taxonomy the HTTP layer maps onto status codes (§7).
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not authorized")]
    Authorization,
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("transient error: {0}")]
    Transient(String),
    #[error("agent error: {0}")]
    Agent(String),
}

impl From<StoreError> for MarketError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => MarketError::NotFound,
            StoreError::Conflict(msg) => MarketError::Conflict(msg),
            StoreError::Transient(msg) => MarketError::Transient(msg),
        }
    }
}

impl From<AgentError> for MarketError {
    fn from(err: AgentError) -> Self {
        MarketError::Agent(err.to_string())
    }
}

//! Error taxonomy for the bracket engine.
//!
//! Component modules define their own `thiserror` enums. This module maps them
//! onto a single machine-readable [`ErrorCode`] so rejections can be reported
//! back through the intent acknowledgement path.
//!
//! | Code | Severity | Meaning |
//! |------|----------|---------|
//! | `CONNECTION_EXHAUSTED` | Fatal | Session could not be (re)established |
//! | `CONTRACT_QUALIFICATION_FAILED` | Recoverable | Ticker did not resolve, intent rejected |
//! | `INVALID_INPUT` | Recoverable | Malformed intent, rejected before any broker call |
//! | `PRICE_UNAVAILABLE` | Recoverable | No entry price through the fallback chain |
//! | `DUPLICATE_FILL_EVENT` | Expected | Redelivered fill, dropped silently |
//! | `ORDER_PLACEMENT_FAILED` | Recoverable | Broker refused or timed out, marker released |
//! | `PARTIAL_RECONCILIATION_FAILURE` | Recoverable | One symbol failed, batch continued |
//! | `STORE_FAILURE` | Recoverable | Durable store read/write failed |
//! | `SHUTTING_DOWN` | Expected | Engine is stopping, no new work accepted |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::{BrokerError, SessionError};
use crate::guard::GuardError;
use crate::persistence::StoreError;
use crate::reconciliation::ReconciliationError;
use crate::sizing::SizingError;

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Connection attempts exhausted.
    ConnectionExhausted,
    /// Broker could not qualify the contract.
    ContractQualificationFailed,
    /// Trade intent failed validation.
    InvalidInput,
    /// No entry price could be resolved.
    PriceUnavailable,
    /// Fill notification already handled.
    DuplicateFillEvent,
    /// Order submission failed.
    OrderPlacementFailed,
    /// Part of a reconciliation or liquidation batch failed.
    PartialReconciliationFailure,
    /// Durable store failure.
    StoreFailure,
    /// Engine is shutting down.
    ShuttingDown,
}

/// How callers should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Not a fault; drop silently.
    Expected,
    /// Log, report and allow a retry.
    Recoverable,
    /// Surface to the process owner.
    Fatal,
}

impl ErrorCode {
    /// Get the reason string reported to intent submitters.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::ConnectionExhausted => "CONNECTION_EXHAUSTED",
            Self::ContractQualificationFailed => "CONTRACT_QUALIFICATION_FAILED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::PriceUnavailable => "PRICE_UNAVAILABLE",
            Self::DuplicateFillEvent => "DUPLICATE_FILL_EVENT",
            Self::OrderPlacementFailed => "ORDER_PLACEMENT_FAILED",
            Self::PartialReconciliationFailure => "PARTIAL_RECONCILIATION_FAILURE",
            Self::StoreFailure => "STORE_FAILURE",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Get the severity class of this code.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::ConnectionExhausted => Severity::Fatal,
            Self::DuplicateFillEvent | Self::ShuttingDown => Severity::Expected,
            Self::ContractQualificationFailed
            | Self::InvalidInput
            | Self::PriceUnavailable
            | Self::OrderPlacementFailed
            | Self::PartialReconciliationFailure
            | Self::StoreFailure => Severity::Recoverable,
        }
    }

    /// Whether the failed operation may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.severity(), Severity::Recoverable)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

/// An error with a code and audit context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct EngineError {
    code: ErrorCode,
    message: String,
    context: Vec<(String, String)>,
}

impl EngineError {
    /// Create a new engine error.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: Vec::new(),
        }
    }

    /// Add context to the error.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.push((key.into(), value.to_string()));
        self
    }

    /// Get the error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the context.
    #[must_use]
    pub fn context(&self) -> &[(String, String)] {
        &self.context
    }

    /// Malformed trade intent.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// No price through the fallback chain.
    #[must_use]
    pub fn price_unavailable(symbol: &str) -> Self {
        Self::new(
            ErrorCode::PriceUnavailable,
            format!("no entry price available for {symbol}"),
        )
        .with_context("symbol", symbol)
    }

    /// Contract did not qualify.
    #[must_use]
    pub fn qualification_failed(symbol: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::ContractQualificationFailed, reason).with_context("symbol", symbol)
    }

    /// Order placement failed.
    #[must_use]
    pub fn placement_failed(symbol: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::OrderPlacementFailed, reason).with_context("symbol", symbol)
    }

    /// Engine is stopping.
    #[must_use]
    pub fn shutting_down() -> Self {
        Self::new(ErrorCode::ShuttingDown, "engine is shutting down")
    }
}

impl From<SizingError> for EngineError {
    fn from(err: SizingError) -> Self {
        Self::invalid_input(err.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        Self::new(ErrorCode::StoreFailure, err.to_string())
    }
}

impl From<SessionError> for EngineError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::ConnectionExhausted { .. } => {
                Self::new(ErrorCode::ConnectionExhausted, err.to_string())
            }
            SessionError::ShuttingDown => Self::shutting_down(),
            SessionError::Broker(inner) => Self::from(inner),
        }
    }
}

impl From<BrokerError> for EngineError {
    fn from(err: BrokerError) -> Self {
        match &err {
            BrokerError::QualificationFailed { symbol, .. } => {
                Self::qualification_failed(symbol, err.to_string())
            }
            _ => Self::new(ErrorCode::OrderPlacementFailed, err.to_string()),
        }
    }
}

impl From<GuardError> for EngineError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Session(inner) => Self::from(inner),
            GuardError::NoClosePrice(symbol) => Self::new(
                ErrorCode::PriceUnavailable,
                format!("no close price available for {symbol}"),
            )
            .with_context("symbol", &symbol),
        }
    }
}

impl From<ReconciliationError> for EngineError {
    fn from(err: ReconciliationError) -> Self {
        match err {
            ReconciliationError::Broker(inner) => Self::from(inner),
            ReconciliationError::Store(inner) => Self::from(inner),
        }
    }
}

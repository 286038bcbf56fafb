//! Reconciliation error types.

use crate::broker::SessionError;
use crate::persistence::StoreError;

/// Errors that abort a reconciliation pass.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconciliationError {
    /// Broker state could not be fetched.
    #[error("broker error: {0}")]
    Broker(#[from] SessionError),

    /// Local state could not be read.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_error_display() {
        let err = ReconciliationError::from(SessionError::ShuttingDown);
        assert_eq!(err.to_string(), "broker error: session is shutting down");
    }
}

//! Typed failure taxonomy for execution paths.
//!
//! Every failure a caller can act on is a variant here; nothing in the
//! execution layer surfaces an opaque error. `Validation` and `Placement`
//! are resolved locally and safe to retry later. `PartialFill` and
//! `Invariant` escalate to the risk controller. `Connectivity` is absorbed
//! by the market-data retry logic unless its deadline is exhausted.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// Pre-flight rejection: budget, depth, slippage, or staleness.
    /// Recoverable; no orders were sent.
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// The exchange rejected an order submission. Recoverable; triggers
    /// abort-and-cancel with no position change.
    #[error("placement failed on {instrument}: {reason}")]
    Placement { instrument: String, reason: String },

    /// A leg filled partially while the basket could not complete. The
    /// filled quantity was liquidated; never silently retried.
    #[error("partial fill on {instrument}: {filled}/{wanted} contracts")]
    PartialFill {
        instrument: String,
        filled: i64,
        wanted: i64,
    },

    /// Feed or exchange connectivity failure past internal retry budget.
    #[error("connectivity: {detail}")]
    Connectivity { detail: String },

    /// State the system cannot reconcile (e.g. rehydrated positions
    /// disagree with exchange balances). Fatal; forces the kill switch.
    #[error("invariant violation: {detail}")]
    Invariant { detail: String },
}

impl ExecError {
    pub fn validation(reason: impl Into<String>) -> Self {
        ExecError::Validation {
            reason: reason.into(),
        }
    }

    pub fn placement(instrument: impl Into<String>, reason: impl Into<String>) -> Self {
        ExecError::Placement {
            instrument: instrument.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the operation later without operator
    /// intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::Validation { .. }
                | ExecError::Placement { .. }
                | ExecError::Connectivity { .. }
        )
    }

    /// Whether this failure requires human review before trading resumes.
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            ExecError::PartialFill { .. } | ExecError::Invariant { .. }
        )
    }
}

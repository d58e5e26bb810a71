//! Domain error model.

use thiserror::Error;

use crate::id::MemberId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Every variant is a precondition violation: deterministic, surfaced to the
/// caller immediately, never retried internally. Infrastructure failures
/// (storage, custody) have their own error types in `creditunion-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The union does not exist.
    #[error("union not initialized")]
    NotInitialized,

    /// The union already exists.
    #[error("union already initialized")]
    AlreadyInitialized,

    #[error("{0} is already a member")]
    AlreadyMember(MemberId),

    #[error("{0} is not a member")]
    NotMember(MemberId),

    #[error("insufficient balance (available: {available}, requested: {requested})")]
    InsufficientBalance { available: u64, requested: u64 },

    /// A withdrawal would leave the balance below the staked amount.
    #[error("cannot withdraw staked funds (balance: {balance}, staked: {staked}, requested: {requested})")]
    CannotWithdrawStaked {
        balance: u64,
        staked: u64,
        requested: u64,
    },

    #[error("interest rate {rate} outside [{min}, {max}]")]
    InterestRateOutOfBounds { rate: u64, min: u64, max: u64 },

    #[error("invalid interest rate bounds: min {min} > max {max}")]
    InvalidRateBounds { min: u64, max: u64 },

    #[error("amount must be positive")]
    InvalidAmount,

    #[error("{0} already has an open loan")]
    LoanAlreadyRequested(MemberId),

    #[error("no loan found for {0}")]
    LoanNotFound(MemberId),

    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A conflict occurred (stale revision / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Short machine-readable code (used as a structured log field).
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::AlreadyInitialized => "already_initialized",
            Self::AlreadyMember(_) => "already_member",
            Self::NotMember(_) => "not_member",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::CannotWithdrawStaked { .. } => "cannot_withdraw_staked",
            Self::InterestRateOutOfBounds { .. } => "interest_rate_out_of_bounds",
            Self::InvalidRateBounds { .. } => "invalid_rate_bounds",
            Self::InvalidAmount => "invalid_amount",
            Self::LoanAlreadyRequested(_) => "loan_already_requested",
            Self::LoanNotFound(_) => "loan_not_found",
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
        }
    }
}

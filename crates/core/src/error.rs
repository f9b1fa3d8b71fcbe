//! Domain error model.

use thiserror::Error;

use crate::id::AggregateId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, illegal transitions, budget shortfalls). Infrastructure
/// concerns belong elsewhere.
///
/// Recovery semantics:
/// - `Validation` / `EmptyRequest`: input rejected before any state change;
///   caller may resubmit corrected data.
/// - `InvalidTransition`: caller bug (state machine misuse); never retried.
/// - `InsufficientFunds`: business condition surfaced to the approver for a
///   decision; the engine performs no automatic retry.
/// - `UnknownCommitment` / `AlreadySettled`: data-integrity faults; callers
///   should alarm rather than continue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input, negative quantity).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A request was submitted without any line items.
    #[error("request has no line items")]
    EmptyRequest,

    /// A state machine was asked to perform an illegal transition.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// A budget commit was larger than the line's available funds.
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: i64, available: i64 },

    /// A ledger operation referenced a commitment that does not exist.
    #[error("unknown commitment: {0}")]
    UnknownCommitment(AggregateId),

    /// A commitment was settled twice.
    #[error("commitment already settled: {0}")]
    AlreadySettled(AggregateId),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. entity already exists).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn invalid_transition(from: &'static str, to: &'static str) -> Self {
        Self::InvalidTransition { from, to }
    }

    /// Stable error-kind label for audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::EmptyRequest => "empty_request",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::UnknownCommitment(_) => "unknown_commitment",
            Self::AlreadySettled(_) => "already_settled",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::InvalidId(_) => "invalid_id",
            Self::NotFound => "not_found",
            Self::Conflict(_) => "conflict",
        }
    }
}

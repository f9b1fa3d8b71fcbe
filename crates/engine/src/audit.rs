//! Append-only audit trail of financial transitions.
//!
//! Every state-changing engine operation lands here: successful transitions
//! with the commitment delta they caused, rejected ones with the stable
//! error kind. The log is the source of truth; the event bus re-publishes
//! entries for live consumers (at-least-once, see `procflow_events::bus`).

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procflow_core::{AggregateId, DomainError, UserId};

/// What happened to the operation that produced an audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The transition was applied; `commitment_delta` is the signed change
    /// to the budget line's committed balance (0 for non-monetary moves).
    Applied { commitment_delta: i64 },
    /// The transition was rejected before any state change.
    Rejected { error_kind: String },
}

/// One audit trail entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub entity_id: AggregateId,
    pub entity_type: String,
    /// Transition label, e.g. `request.approved`.
    pub transition: String,
    #[serde(flatten)]
    pub outcome: AuditOutcome,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn is_rejection(&self) -> bool {
        matches!(self.outcome, AuditOutcome::Rejected { .. })
    }
}

/// Append-only, in-memory audit log.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEvent>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> DomainError {
        DomainError::conflict("audit log lock poisoned")
    }

    pub fn append(&self, event: AuditEvent) -> Result<(), DomainError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        entries.push(event);
        Ok(())
    }

    /// Point-in-time copy of the trail, oldest first.
    pub fn entries(&self) -> Result<Vec<AuditEvent>, DomainError> {
        let entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        Ok(entries.clone())
    }

    pub fn len(&self) -> Result<usize, DomainError> {
        let entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        Ok(entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, DomainError> {
        Ok(self.len()? == 0)
    }

    /// Serialize the whole trail for export (durable storage is a
    /// collaborator, not this crate's concern).
    pub fn export_json(&self) -> Result<String, DomainError> {
        let entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        serde_json::to_string_pretty(&*entries)
            .map_err(|e| DomainError::invariant(format!("audit export failed: {e}")))
    }
}

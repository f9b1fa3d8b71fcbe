//! Procurement engine: the orchestration facade tying the domain
//! aggregates, the budget ledger, the goods-receipt reconciler and the
//! audit trail together behind one synchronous API.

pub mod audit;
pub mod engine;
pub mod store;


pub use audit::{AuditEvent, AuditLog, AuditOutcome};
pub use engine::ProcurementEngine;
pub use store::EntityStore;

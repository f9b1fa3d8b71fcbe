//! Budget ledger: per-line balances (total / committed / spent / available)
//! and the commitment lifecycle (held -> released | settled).
//!
//! All money movement in the procurement workflow goes through the three
//! ledger operations `commit`, `release` and `settle`; balances are never
//! written directly.

pub mod line;
pub mod store;

pub use line::{
    AlertLevel, BudgetLine, BudgetLineId, BudgetScope, BudgetSnapshot, Commitment, CommitmentId,
    CommitmentOwner, CommitmentState, Settlement,
};
pub use store::BudgetLedger;

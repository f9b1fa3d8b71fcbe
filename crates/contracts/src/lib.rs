//! Contract lifecycle domain module.
//!
//! Stored status never includes the time-derived states; `expiring_soon`
//! and `expired` are recomputed from `(status, end_date, now)` on read so
//! they can never drift.

pub mod contract;

pub use contract::{
    ActivateContract, CancelContract, Contract, ContractCommand, ContractEvent, ContractId,
    ContractStatus, ContractType, CreateContract, EffectiveStatus, RecordOrderSpend,
    RenewContract, SuspendContract, EXPIRY_WARNING_DAYS,
};

//! Goods receiving: receipt records and the reconciler that matches them
//! against purchase order lines.

pub mod receipt;
pub mod reconcile;

pub use receipt::{
    DiscrepancyType, GoodsReceipt, InspectionStatus, LineCondition, ReceiptId, ReceiptLine,
};
pub use reconcile::{reconcile, LineDelta, Reconciliation};

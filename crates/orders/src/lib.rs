//! Purchase order domain module (event-sourced).
//!
//! Orders carry their budget commitment (inherited from the originating
//! request or freshly committed) and move through the supplier-driven
//! delivery lifecycle until settlement.

pub mod order;

pub use order::{
    AcknowledgeOrder, ApplyReceipt, CancelOrder, CommitmentSource, CompleteOrder, CreateOrder,
    IssueOrder, OrderLine, OrderOrigin, PurchaseOrder, PurchaseOrderCommand, PurchaseOrderEvent,
    PurchaseOrderId, PurchaseOrderStatus, ReceivedQuantity, ShipOrder,
};

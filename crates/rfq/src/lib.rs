//! RFQ domain module (request-for-quotation, event-sourced).
//!
//! Tracks the RFQ lifecycle plus an independent per-supplier sub-state
//! machine (invited -> viewed -> quoted | declined | no_response).

pub mod rfq;

pub use rfq::{
    Award, AwardRfq, CancelRfq, CloseBidding, CreateRfq, EvaluateBids, IssueRfq, OpenBidding,
    Quote, RecordDecline, RecordQuote, RecordView, Rfq, RfqCommand, RfqEvent, RfqId, RfqLineItem,
    RfqStatus, SupplierInvitation, SupplierState, SweepDueDate,
};

//! Procurement request domain module (event-sourced).
//!
//! This crate contains business rules for procurement requests, implemented
//! purely as deterministic domain logic (no IO, no HTTP, no storage).

pub mod request;

pub use request::{
    AddItem, ApproveRequest, CancelRequest, CreateRequest, LinkOrder, ProcurementRequest,
    RejectRequest, RequestCommand, RequestEvent, RequestId, RequestLineItem, RequestStatus,
    SubmitRequest,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, UserId};
use procflow_events::Event;
use procflow_ledger::{BudgetLineId, CommitmentId};

/// Procurement request identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub AggregateId);

impl RequestId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for RequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Request status lifecycle.
///
/// Terminal states: `Rejected`, `Cancelled`, and `Ordered` once the linked
/// order has consumed the commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Draft,
    PendingApproval,
    Approved,
    Rejected,
    Ordered,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Draft => "draft",
            RequestStatus::PendingApproval => "pending_approval",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Ordered => "ordered",
            RequestStatus::Cancelled => "cancelled",
        }
    }
}

/// One requested item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLineItem {
    pub name: String,
    pub quantity: i64,
    /// Smallest currency unit.
    pub unit_price: i64,
}

impl RequestLineItem {
    pub fn amount(&self) -> i64 {
        self.quantity * self.unit_price
    }
}

/// Aggregate root: ProcurementRequest.
///
/// Requests are never purged; cancellation is a soft delete that keeps the
/// full history for audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcurementRequest {
    id: RequestId,
    requester: Option<UserId>,
    department: String,
    budget_line_id: Option<BudgetLineId>,
    items: Vec<RequestLineItem>,
    status: RequestStatus,
    commitment_id: Option<CommitmentId>,
    linked_order: Option<AggregateId>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl ProcurementRequest {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: RequestId) -> Self {
        Self {
            id,
            requester: None,
            department: String::new(),
            budget_line_id: None,
            items: Vec::new(),
            status: RequestStatus::Draft,
            commitment_id: None,
            linked_order: None,
            created_at: None,
            updated_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> RequestId {
        self.id
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn requester(&self) -> Option<UserId> {
        self.requester
    }

    pub fn department(&self) -> &str {
        &self.department
    }

    pub fn budget_line_id(&self) -> Option<BudgetLineId> {
        self.budget_line_id
    }

    pub fn items(&self) -> &[RequestLineItem] {
        &self.items
    }

    pub fn commitment_id(&self) -> Option<CommitmentId> {
        self.commitment_id
    }

    pub fn linked_order(&self) -> Option<AggregateId> {
        self.linked_order
    }

    /// Sum of all line item amounts.
    pub fn total_amount(&self) -> i64 {
        self.items.iter().map(RequestLineItem::amount).sum()
    }

    /// Guard used by the engine before it moves money: approval is only
    /// legal from `PendingApproval`. The budget commit happens between this
    /// check and the `ApproveRequest` command, so a shortfall leaves the
    /// request exactly where it was.
    pub fn ensure_can_approve(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.status != RequestStatus::PendingApproval {
            return Err(DomainError::invalid_transition(
                self.status.as_str(),
                RequestStatus::Approved.as_str(),
            ));
        }
        Ok(())
    }
}

impl AggregateRoot for ProcurementRequest {
    type Id = RequestId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateRequest (starts in `Draft`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub request_id: RequestId,
    pub requester: UserId,
    pub department: String,
    pub budget_line_id: BudgetLineId,
    pub items: Vec<RequestLineItem>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddItem (only allowed in `Draft`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddItem {
    pub request_id: RequestId,
    pub item: RequestLineItem,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SubmitRequest (draft -> pending_approval).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub request_id: RequestId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApproveRequest (pending_approval -> approved).
///
/// Carries the commitment granted by the budget ledger; the engine commits
/// funds first and only then issues this command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveRequest {
    pub request_id: RequestId,
    pub commitment_id: CommitmentId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RejectRequest (pending_approval -> rejected, no budget effect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectRequest {
    pub request_id: RequestId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: LinkOrder (approved -> ordered).
///
/// Invoked when a purchase order is created from this request; moves no
/// money (the order re-uses the existing commitment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOrder {
    pub request_id: RequestId,
    pub order_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelRequest (draft | pending_approval | approved -> cancelled).
///
/// Idempotent: cancelling an already-cancelled request emits no events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub request_id: RequestId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestCommand {
    CreateRequest(CreateRequest),
    AddItem(AddItem),
    SubmitRequest(SubmitRequest),
    ApproveRequest(ApproveRequest),
    RejectRequest(RejectRequest),
    LinkOrder(LinkOrder),
    CancelRequest(CancelRequest),
}

/// Event: RequestCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCreated {
    pub request_id: RequestId,
    pub requester: UserId,
    pub department: String,
    pub budget_line_id: BudgetLineId,
    pub items: Vec<RequestLineItem>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestItemAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestItemAdded {
    pub request_id: RequestId,
    pub item: RequestLineItem,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestSubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSubmitted {
    pub request_id: RequestId,
    pub total_amount: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestApproved (budget held under `commitment_id`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestApproved {
    pub request_id: RequestId,
    pub commitment_id: CommitmentId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRejected {
    pub request_id: RequestId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderLinked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLinked {
    pub request_id: RequestId,
    pub order_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestCancelled (soft delete).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCancelled {
    pub request_id: RequestId,
    /// Commitment the engine must release, if one was held.
    pub held_commitment: Option<CommitmentId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestEvent {
    RequestCreated(RequestCreated),
    RequestItemAdded(RequestItemAdded),
    RequestSubmitted(RequestSubmitted),
    RequestApproved(RequestApproved),
    RequestRejected(RequestRejected),
    OrderLinked(OrderLinked),
    RequestCancelled(RequestCancelled),
}

impl Event for RequestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RequestEvent::RequestCreated(_) => "requests.request.created",
            RequestEvent::RequestItemAdded(_) => "requests.request.item_added",
            RequestEvent::RequestSubmitted(_) => "requests.request.submitted",
            RequestEvent::RequestApproved(_) => "requests.request.approved",
            RequestEvent::RequestRejected(_) => "requests.request.rejected",
            RequestEvent::OrderLinked(_) => "requests.request.order_linked",
            RequestEvent::RequestCancelled(_) => "requests.request.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RequestEvent::RequestCreated(e) => e.occurred_at,
            RequestEvent::RequestItemAdded(e) => e.occurred_at,
            RequestEvent::RequestSubmitted(e) => e.occurred_at,
            RequestEvent::RequestApproved(e) => e.occurred_at,
            RequestEvent::RequestRejected(e) => e.occurred_at,
            RequestEvent::OrderLinked(e) => e.occurred_at,
            RequestEvent::RequestCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for ProcurementRequest {
    type Command = RequestCommand;
    type Event = RequestEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RequestEvent::RequestCreated(e) => {
                self.id = e.request_id;
                self.requester = Some(e.requester);
                self.department = e.department.clone();
                self.budget_line_id = Some(e.budget_line_id);
                self.items = e.items.clone();
                self.status = RequestStatus::Draft;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            RequestEvent::RequestItemAdded(e) => {
                self.items.push(e.item.clone());
            }
            RequestEvent::RequestSubmitted(_) => {
                self.status = RequestStatus::PendingApproval;
            }
            RequestEvent::RequestApproved(e) => {
                self.status = RequestStatus::Approved;
                self.commitment_id = Some(e.commitment_id);
            }
            RequestEvent::RequestRejected(_) => {
                self.status = RequestStatus::Rejected;
            }
            RequestEvent::OrderLinked(e) => {
                self.status = RequestStatus::Ordered;
                self.linked_order = Some(e.order_id);
            }
            RequestEvent::RequestCancelled(_) => {
                self.status = RequestStatus::Cancelled;
            }
        }

        self.updated_at = Some(event.occurred_at());
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            RequestCommand::CreateRequest(cmd) => self.handle_create(cmd),
            RequestCommand::AddItem(cmd) => self.handle_add_item(cmd),
            RequestCommand::SubmitRequest(cmd) => self.handle_submit(cmd),
            RequestCommand::ApproveRequest(cmd) => self.handle_approve(cmd),
            RequestCommand::RejectRequest(cmd) => self.handle_reject(cmd),
            RequestCommand::LinkOrder(cmd) => self.handle_link_order(cmd),
            RequestCommand::CancelRequest(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl ProcurementRequest {
    fn ensure_exists(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        Ok(())
    }

    fn ensure_status(
        &self,
        expected: RequestStatus,
        to: RequestStatus,
    ) -> Result<(), DomainError> {
        if self.status != expected {
            return Err(DomainError::invalid_transition(
                self.status.as_str(),
                to.as_str(),
            ));
        }
        Ok(())
    }

    fn validate_item(item: &RequestLineItem) -> Result<(), DomainError> {
        if item.name.trim().is_empty() {
            return Err(DomainError::validation("item name must not be empty"));
        }
        if item.quantity <= 0 {
            return Err(DomainError::validation("item quantity must be positive"));
        }
        if item.unit_price < 0 {
            return Err(DomainError::validation("item unit price must be >= 0"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateRequest) -> Result<Vec<RequestEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("request already exists"));
        }
        if cmd.department.trim().is_empty() {
            return Err(DomainError::validation("department must not be empty"));
        }
        for item in &cmd.items {
            Self::validate_item(item)?;
        }

        Ok(vec![RequestEvent::RequestCreated(RequestCreated {
            request_id: cmd.request_id,
            requester: cmd.requester,
            department: cmd.department.clone(),
            budget_line_id: cmd.budget_line_id,
            items: cmd.items.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_item(&self, cmd: &AddItem) -> Result<Vec<RequestEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(RequestStatus::Draft, RequestStatus::Draft)?;
        Self::validate_item(&cmd.item)?;

        Ok(vec![RequestEvent::RequestItemAdded(RequestItemAdded {
            request_id: cmd.request_id,
            item: cmd.item.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_submit(&self, cmd: &SubmitRequest) -> Result<Vec<RequestEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(RequestStatus::Draft, RequestStatus::PendingApproval)?;

        if self.items.is_empty() {
            return Err(DomainError::EmptyRequest);
        }

        Ok(vec![RequestEvent::RequestSubmitted(RequestSubmitted {
            request_id: cmd.request_id,
            total_amount: self.total_amount(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &ApproveRequest) -> Result<Vec<RequestEvent>, DomainError> {
        self.ensure_can_approve()?;

        Ok(vec![RequestEvent::RequestApproved(RequestApproved {
            request_id: cmd.request_id,
            commitment_id: cmd.commitment_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reject(&self, cmd: &RejectRequest) -> Result<Vec<RequestEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(RequestStatus::PendingApproval, RequestStatus::Rejected)?;

        Ok(vec![RequestEvent::RequestRejected(RequestRejected {
            request_id: cmd.request_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_link_order(&self, cmd: &LinkOrder) -> Result<Vec<RequestEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(RequestStatus::Approved, RequestStatus::Ordered)?;

        Ok(vec![RequestEvent::OrderLinked(OrderLinked {
            request_id: cmd.request_id,
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelRequest) -> Result<Vec<RequestEvent>, DomainError> {
        self.ensure_exists()?;

        match self.status {
            // Idempotent: a second cancel is a no-op, not an error.
            RequestStatus::Cancelled => Ok(vec![]),
            RequestStatus::Draft | RequestStatus::PendingApproval | RequestStatus::Approved => {
                Ok(vec![RequestEvent::RequestCancelled(RequestCancelled {
                    request_id: cmd.request_id,
                    held_commitment: self.commitment_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
            RequestStatus::Rejected | RequestStatus::Ordered => Err(
                DomainError::invalid_transition(self.status.as_str(), "cancelled"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procflow_core::AggregateId;
    use procflow_events::execute;

    fn test_request_id() -> RequestId {
        RequestId::new(AggregateId::new())
    }

    fn test_item(name: &str, quantity: i64, unit_price: i64) -> RequestLineItem {
        RequestLineItem {
            name: name.to_string(),
            quantity,
            unit_price,
        }
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn created_request(items: Vec<RequestLineItem>) -> ProcurementRequest {
        let id = test_request_id();
        let mut request = ProcurementRequest::empty(id);
        execute(
            &mut request,
            &RequestCommand::CreateRequest(CreateRequest {
                request_id: id,
                requester: UserId::new(),
                department: "operations".to_string(),
                budget_line_id: BudgetLineId::new(AggregateId::new()),
                items,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        request
    }

    #[test]
    fn submit_computes_total_from_line_items() {
        let mut request =
            created_request(vec![test_item("brake pads", 10, 1_500), test_item("oil", 5, 300)]);
        let request_id = request.id_typed();

        let events = execute(
            &mut request,
            &RequestCommand::SubmitRequest(SubmitRequest {
                request_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        match &events[0] {
            RequestEvent::RequestSubmitted(e) => assert_eq!(e.total_amount, 16_500),
            other => panic!("Expected RequestSubmitted, got {other:?}"),
        }
        assert_eq!(request.status(), RequestStatus::PendingApproval);
    }

    #[test]
    fn submit_without_items_fails_empty_request() {
        let mut request = created_request(vec![]);
        let request_id = request.id_typed();

        let err = execute(
            &mut request,
            &RequestCommand::SubmitRequest(SubmitRequest {
                request_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();

        assert_eq!(err, DomainError::EmptyRequest);
        assert_eq!(request.status(), RequestStatus::Draft);
    }

    #[test]
    fn approve_from_draft_is_an_invalid_transition() {
        let mut request = created_request(vec![test_item("filters", 2, 800)]);
        let request_id = request.id_typed();

        let err = execute(
            &mut request,
            &RequestCommand::ApproveRequest(ApproveRequest {
                request_id,
                commitment_id: CommitmentId::new(AggregateId::new()),
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();

        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: "draft",
                to: "approved"
            }
        );
    }

    #[test]
    fn approved_request_records_its_commitment() {
        let mut request = created_request(vec![test_item("tyres", 4, 9_000)]);
        let request_id = request.id_typed();
        let commitment_id = CommitmentId::new(AggregateId::new());

        execute(
            &mut request,
            &RequestCommand::SubmitRequest(SubmitRequest {
                request_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        execute(
            &mut request,
            &RequestCommand::ApproveRequest(ApproveRequest {
                request_id,
                commitment_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(request.status(), RequestStatus::Approved);
        assert_eq!(request.commitment_id(), Some(commitment_id));
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut request = created_request(vec![test_item("bulbs", 20, 120)]);
        let request_id = request.id_typed();

        let first = execute(
            &mut request,
            &RequestCommand::CancelRequest(CancelRequest {
                request_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(request.status(), RequestStatus::Cancelled);

        let second = execute(
            &mut request,
            &RequestCommand::CancelRequest(CancelRequest {
                request_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert!(second.is_empty());
        assert_eq!(request.status(), RequestStatus::Cancelled);
    }

    #[test]
    fn cancel_after_ordering_is_rejected() {
        let mut request = created_request(vec![test_item("coolant", 3, 700)]);
        let request_id = request.id_typed();
        let commitment_id = CommitmentId::new(AggregateId::new());

        for cmd in [
            RequestCommand::SubmitRequest(SubmitRequest {
                request_id,
                occurred_at: test_time(),
            }),
            RequestCommand::ApproveRequest(ApproveRequest {
                request_id,
                commitment_id,
                occurred_at: test_time(),
            }),
            RequestCommand::LinkOrder(LinkOrder {
                request_id,
                order_id: AggregateId::new(),
                occurred_at: test_time(),
            }),
        ] {
            execute(&mut request, &cmd).unwrap();
        }

        let err = execute(
            &mut request,
            &RequestCommand::CancelRequest(CancelRequest {
                request_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: "ordered",
                to: "cancelled"
            }
        );
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, SupplierId};
use procflow_events::Event;
use procflow_requests::RequestId;

/// RFQ identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RfqId(pub AggregateId);

impl RfqId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for RfqId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// RFQ status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RfqStatus {
    Draft,
    Issued,
    BiddingOpen,
    BiddingClosed,
    Evaluated,
    Awarded,
    Cancelled,
}

impl RfqStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RfqStatus::Draft => "draft",
            RfqStatus::Issued => "issued",
            RfqStatus::BiddingOpen => "bidding_open",
            RfqStatus::BiddingClosed => "bidding_closed",
            RfqStatus::Evaluated => "evaluated",
            RfqStatus::Awarded => "awarded",
            RfqStatus::Cancelled => "cancelled",
        }
    }
}

/// Per-supplier sub-state, independent of the RFQ state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplierState {
    Invited,
    Viewed,
    Quoted,
    Declined,
    NoResponse,
}

impl SupplierState {
    /// Still waiting on the supplier (subject to due-date coercion).
    pub fn is_unresolved(self) -> bool {
        matches!(self, SupplierState::Invited | SupplierState::Viewed)
    }
}

/// A supplier's quote (the only price data on an RFQ).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub total_amount: i64,
    pub submitted_at: DateTime<Utc>,
}

/// One invited supplier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierInvitation {
    pub supplier_id: SupplierId,
    pub state: SupplierState,
    pub quote: Option<Quote>,
}

/// A line item sourced from the originating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfqLineItem {
    pub name: String,
    pub quantity: i64,
}

/// One awarded supplier and the amount read from their quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Award {
    pub supplier_id: SupplierId,
    pub amount: i64,
}

/// Aggregate root: Rfq.
///
/// Holds a weak back-reference to the originating request (no ownership).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfq {
    id: RfqId,
    request_id: Option<RequestId>,
    items: Vec<RfqLineItem>,
    suppliers: Vec<SupplierInvitation>,
    issue_date: Option<DateTime<Utc>>,
    due_date: Option<DateTime<Utc>>,
    status: RfqStatus,
    version: u64,
    created: bool,
}

impl Rfq {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: RfqId) -> Self {
        Self {
            id,
            request_id: None,
            items: Vec::new(),
            suppliers: Vec::new(),
            issue_date: None,
            due_date: None,
            status: RfqStatus::Draft,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> RfqId {
        self.id
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    pub fn status(&self) -> RfqStatus {
        self.status
    }

    pub fn items(&self) -> &[RfqLineItem] {
        &self.items
    }

    pub fn suppliers(&self) -> &[SupplierInvitation] {
        &self.suppliers
    }

    pub fn due_date(&self) -> Option<DateTime<Utc>> {
        self.due_date
    }

    pub fn issue_date(&self) -> Option<DateTime<Utc>> {
        self.issue_date
    }

    fn supplier(&self, id: SupplierId) -> Result<&SupplierInvitation, DomainError> {
        self.suppliers
            .iter()
            .find(|s| s.supplier_id == id)
            .ok_or_else(|| DomainError::validation("supplier was not invited to this RFQ"))
    }

    fn supplier_mut(&mut self, id: SupplierId) -> Option<&mut SupplierInvitation> {
        self.suppliers.iter_mut().find(|s| s.supplier_id == id)
    }
}

impl AggregateRoot for Rfq {
    type Id = RfqId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateRfq (sourced from an approved request's items).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRfq {
    pub rfq_id: RfqId,
    pub request_id: RequestId,
    pub items: Vec<RfqLineItem>,
    pub suppliers: Vec<SupplierId>,
    pub due_date: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: IssueRfq (draft -> issued; stamps the issue date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRfq {
    pub rfq_id: RfqId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: OpenBidding (issued -> bidding_open).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenBidding {
    pub rfq_id: RfqId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordView (supplier invited -> viewed; idempotent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordView {
    pub rfq_id: RfqId,
    pub supplier_id: SupplierId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordQuote (supplier invited|viewed -> quoted, bidding open only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuote {
    pub rfq_id: RfqId,
    pub supplier_id: SupplierId,
    pub total_amount: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordDecline (supplier invited|viewed -> declined).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDecline {
    pub rfq_id: RfqId,
    pub supplier_id: SupplierId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CloseBidding (bidding_open -> bidding_closed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseBidding {
    pub rfq_id: RfqId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SweepDueDate.
///
/// At or after the due date, coerces unresolved suppliers
/// (invited/viewed) to `no_response`. Never fires early; before the due
/// date it is a no-op. This is a scheduled sweep, not a blocking wait, and
/// it only flips supplier sub-states — never financial state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepDueDate {
    pub rfq_id: RfqId,
    pub now: DateTime<Utc>,
}

/// Command: EvaluateBids (bidding_closed -> evaluated).
///
/// Refused while any supplier is still unresolved unless `override_unresolved`
/// is set (the sweep is the normal way to resolve late non-responses).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluateBids {
    pub rfq_id: RfqId,
    pub override_unresolved: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AwardRfq (evaluated -> awarded).
///
/// Selects one or more quoted suppliers; the only transition that reads
/// quote amounts. Each award fans out to one purchase order downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwardRfq {
    pub rfq_id: RfqId,
    pub winners: Vec<SupplierId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelRfq (any pre-award state -> cancelled; idempotent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRfq {
    pub rfq_id: RfqId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RfqCommand {
    CreateRfq(CreateRfq),
    IssueRfq(IssueRfq),
    OpenBidding(OpenBidding),
    RecordView(RecordView),
    RecordQuote(RecordQuote),
    RecordDecline(RecordDecline),
    CloseBidding(CloseBidding),
    SweepDueDate(SweepDueDate),
    EvaluateBids(EvaluateBids),
    AwardRfq(AwardRfq),
    CancelRfq(CancelRfq),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfqCreated {
    pub rfq_id: RfqId,
    pub request_id: RequestId,
    pub items: Vec<RfqLineItem>,
    pub suppliers: Vec<SupplierId>,
    pub due_date: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfqIssued {
    pub rfq_id: RfqId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiddingOpened {
    pub rfq_id: RfqId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierViewed {
    pub rfq_id: RfqId,
    pub supplier_id: SupplierId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteRecorded {
    pub rfq_id: RfqId,
    pub supplier_id: SupplierId,
    pub total_amount: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierDeclined {
    pub rfq_id: RfqId,
    pub supplier_id: SupplierId,
    pub occurred_at: DateTime<Utc>,
}

/// A supplier who never answered, coerced at the due date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierTimedOut {
    pub rfq_id: RfqId,
    pub supplier_id: SupplierId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiddingClosed {
    pub rfq_id: RfqId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfqEvaluated {
    pub rfq_id: RfqId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfqAwarded {
    pub rfq_id: RfqId,
    pub awards: Vec<Award>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfqCancelled {
    pub rfq_id: RfqId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RfqEvent {
    RfqCreated(RfqCreated),
    RfqIssued(RfqIssued),
    BiddingOpened(BiddingOpened),
    SupplierViewed(SupplierViewed),
    QuoteRecorded(QuoteRecorded),
    SupplierDeclined(SupplierDeclined),
    SupplierTimedOut(SupplierTimedOut),
    BiddingClosed(BiddingClosed),
    RfqEvaluated(RfqEvaluated),
    RfqAwarded(RfqAwarded),
    RfqCancelled(RfqCancelled),
}

impl Event for RfqEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RfqEvent::RfqCreated(_) => "rfq.created",
            RfqEvent::RfqIssued(_) => "rfq.issued",
            RfqEvent::BiddingOpened(_) => "rfq.bidding_opened",
            RfqEvent::SupplierViewed(_) => "rfq.supplier_viewed",
            RfqEvent::QuoteRecorded(_) => "rfq.quote_recorded",
            RfqEvent::SupplierDeclined(_) => "rfq.supplier_declined",
            RfqEvent::SupplierTimedOut(_) => "rfq.supplier_timed_out",
            RfqEvent::BiddingClosed(_) => "rfq.bidding_closed",
            RfqEvent::RfqEvaluated(_) => "rfq.evaluated",
            RfqEvent::RfqAwarded(_) => "rfq.awarded",
            RfqEvent::RfqCancelled(_) => "rfq.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RfqEvent::RfqCreated(e) => e.occurred_at,
            RfqEvent::RfqIssued(e) => e.occurred_at,
            RfqEvent::BiddingOpened(e) => e.occurred_at,
            RfqEvent::SupplierViewed(e) => e.occurred_at,
            RfqEvent::QuoteRecorded(e) => e.occurred_at,
            RfqEvent::SupplierDeclined(e) => e.occurred_at,
            RfqEvent::SupplierTimedOut(e) => e.occurred_at,
            RfqEvent::BiddingClosed(e) => e.occurred_at,
            RfqEvent::RfqEvaluated(e) => e.occurred_at,
            RfqEvent::RfqAwarded(e) => e.occurred_at,
            RfqEvent::RfqCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Rfq {
    type Command = RfqCommand;
    type Event = RfqEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RfqEvent::RfqCreated(e) => {
                self.id = e.rfq_id;
                self.request_id = Some(e.request_id);
                self.items = e.items.clone();
                self.suppliers = e
                    .suppliers
                    .iter()
                    .map(|&supplier_id| SupplierInvitation {
                        supplier_id,
                        state: SupplierState::Invited,
                        quote: None,
                    })
                    .collect();
                self.due_date = Some(e.due_date);
                self.status = RfqStatus::Draft;
                self.created = true;
            }
            RfqEvent::RfqIssued(e) => {
                self.issue_date = Some(e.occurred_at);
                self.status = RfqStatus::Issued;
            }
            RfqEvent::BiddingOpened(_) => {
                self.status = RfqStatus::BiddingOpen;
            }
            RfqEvent::SupplierViewed(e) => {
                if let Some(s) = self.supplier_mut(e.supplier_id) {
                    s.state = SupplierState::Viewed;
                }
            }
            RfqEvent::QuoteRecorded(e) => {
                if let Some(s) = self.supplier_mut(e.supplier_id) {
                    s.state = SupplierState::Quoted;
                    s.quote = Some(Quote {
                        total_amount: e.total_amount,
                        submitted_at: e.occurred_at,
                    });
                }
            }
            RfqEvent::SupplierDeclined(e) => {
                if let Some(s) = self.supplier_mut(e.supplier_id) {
                    s.state = SupplierState::Declined;
                }
            }
            RfqEvent::SupplierTimedOut(e) => {
                if let Some(s) = self.supplier_mut(e.supplier_id) {
                    s.state = SupplierState::NoResponse;
                }
            }
            RfqEvent::BiddingClosed(_) => {
                self.status = RfqStatus::BiddingClosed;
            }
            RfqEvent::RfqEvaluated(_) => {
                self.status = RfqStatus::Evaluated;
            }
            RfqEvent::RfqAwarded(_) => {
                self.status = RfqStatus::Awarded;
            }
            RfqEvent::RfqCancelled(_) => {
                self.status = RfqStatus::Cancelled;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            RfqCommand::CreateRfq(cmd) => self.handle_create(cmd),
            RfqCommand::IssueRfq(cmd) => self.handle_issue(cmd),
            RfqCommand::OpenBidding(cmd) => self.handle_open_bidding(cmd),
            RfqCommand::RecordView(cmd) => self.handle_record_view(cmd),
            RfqCommand::RecordQuote(cmd) => self.handle_record_quote(cmd),
            RfqCommand::RecordDecline(cmd) => self.handle_record_decline(cmd),
            RfqCommand::CloseBidding(cmd) => self.handle_close_bidding(cmd),
            RfqCommand::SweepDueDate(cmd) => self.handle_sweep(cmd),
            RfqCommand::EvaluateBids(cmd) => self.handle_evaluate(cmd),
            RfqCommand::AwardRfq(cmd) => self.handle_award(cmd),
            RfqCommand::CancelRfq(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Rfq {
    fn ensure_exists(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        Ok(())
    }

    fn ensure_status(&self, expected: RfqStatus, to: RfqStatus) -> Result<(), DomainError> {
        if self.status != expected {
            return Err(DomainError::invalid_transition(
                self.status.as_str(),
                to.as_str(),
            ));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateRfq) -> Result<Vec<RfqEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("rfq already exists"));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation("rfq must source at least one item"));
        }
        let mut seen = Vec::with_capacity(cmd.suppliers.len());
        for supplier in &cmd.suppliers {
            if seen.contains(supplier) {
                return Err(DomainError::validation("duplicate supplier invitation"));
            }
            seen.push(*supplier);
        }

        Ok(vec![RfqEvent::RfqCreated(RfqCreated {
            rfq_id: cmd.rfq_id,
            request_id: cmd.request_id,
            items: cmd.items.clone(),
            suppliers: cmd.suppliers.clone(),
            due_date: cmd.due_date,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_issue(&self, cmd: &IssueRfq) -> Result<Vec<RfqEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(RfqStatus::Draft, RfqStatus::Issued)?;
        if self.suppliers.is_empty() {
            return Err(DomainError::validation(
                "cannot issue an rfq with no invited suppliers",
            ));
        }

        Ok(vec![RfqEvent::RfqIssued(RfqIssued {
            rfq_id: cmd.rfq_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_open_bidding(&self, cmd: &OpenBidding) -> Result<Vec<RfqEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(RfqStatus::Issued, RfqStatus::BiddingOpen)?;

        Ok(vec![RfqEvent::BiddingOpened(BiddingOpened {
            rfq_id: cmd.rfq_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_view(&self, cmd: &RecordView) -> Result<Vec<RfqEvent>, DomainError> {
        self.ensure_exists()?;
        if !matches!(self.status, RfqStatus::Issued | RfqStatus::BiddingOpen) {
            return Err(DomainError::invariant(
                "supplier views are only recorded while the rfq is open",
            ));
        }

        match self.supplier(cmd.supplier_id)?.state {
            SupplierState::Invited => Ok(vec![RfqEvent::SupplierViewed(SupplierViewed {
                rfq_id: cmd.rfq_id,
                supplier_id: cmd.supplier_id,
                occurred_at: cmd.occurred_at,
            })]),
            // Re-viewing is harmless.
            SupplierState::Viewed | SupplierState::Quoted => Ok(vec![]),
            SupplierState::Declined | SupplierState::NoResponse => Err(DomainError::invariant(
                "supplier has already resolved their invitation",
            )),
        }
    }

    fn handle_record_quote(&self, cmd: &RecordQuote) -> Result<Vec<RfqEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(RfqStatus::BiddingOpen, RfqStatus::BiddingOpen)?;
        if cmd.total_amount <= 0 {
            return Err(DomainError::validation("quote amount must be positive"));
        }

        match self.supplier(cmd.supplier_id)?.state {
            SupplierState::Invited | SupplierState::Viewed => {
                Ok(vec![RfqEvent::QuoteRecorded(QuoteRecorded {
                    rfq_id: cmd.rfq_id,
                    supplier_id: cmd.supplier_id,
                    total_amount: cmd.total_amount,
                    occurred_at: cmd.occurred_at,
                })])
            }
            SupplierState::Quoted => Err(DomainError::conflict("quote already recorded")),
            SupplierState::Declined | SupplierState::NoResponse => Err(DomainError::invariant(
                "supplier has already resolved their invitation",
            )),
        }
    }

    fn handle_record_decline(&self, cmd: &RecordDecline) -> Result<Vec<RfqEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(RfqStatus::BiddingOpen, RfqStatus::BiddingOpen)?;

        match self.supplier(cmd.supplier_id)?.state {
            SupplierState::Invited | SupplierState::Viewed => {
                Ok(vec![RfqEvent::SupplierDeclined(SupplierDeclined {
                    rfq_id: cmd.rfq_id,
                    supplier_id: cmd.supplier_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
            SupplierState::Declined => Ok(vec![]),
            SupplierState::Quoted | SupplierState::NoResponse => Err(DomainError::invariant(
                "supplier has already resolved their invitation",
            )),
        }
    }

    fn handle_close_bidding(&self, cmd: &CloseBidding) -> Result<Vec<RfqEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(RfqStatus::BiddingOpen, RfqStatus::BiddingClosed)?;

        Ok(vec![RfqEvent::BiddingClosed(BiddingClosed {
            rfq_id: cmd.rfq_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_sweep(&self, cmd: &SweepDueDate) -> Result<Vec<RfqEvent>, DomainError> {
        self.ensure_exists()?;
        if matches!(
            self.status,
            RfqStatus::Draft | RfqStatus::Evaluated | RfqStatus::Awarded | RfqStatus::Cancelled
        ) {
            return Ok(vec![]);
        }

        // Late non-responses are coerced at the due date, never earlier.
        let due = self
            .due_date
            .ok_or_else(|| DomainError::invariant("rfq has no due date"))?;
        if cmd.now < due {
            return Ok(vec![]);
        }

        Ok(self
            .suppliers
            .iter()
            .filter(|s| s.state.is_unresolved())
            .map(|s| {
                RfqEvent::SupplierTimedOut(SupplierTimedOut {
                    rfq_id: cmd.rfq_id,
                    supplier_id: s.supplier_id,
                    occurred_at: cmd.now,
                })
            })
            .collect())
    }

    fn handle_evaluate(&self, cmd: &EvaluateBids) -> Result<Vec<RfqEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(RfqStatus::BiddingClosed, RfqStatus::Evaluated)?;

        let unresolved = self.suppliers.iter().filter(|s| s.state.is_unresolved()).count();
        if unresolved > 0 && !cmd.override_unresolved {
            return Err(DomainError::invariant(format!(
                "{unresolved} supplier invitation(s) unresolved; run the due-date sweep first"
            )));
        }

        Ok(vec![RfqEvent::RfqEvaluated(RfqEvaluated {
            rfq_id: cmd.rfq_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_award(&self, cmd: &AwardRfq) -> Result<Vec<RfqEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(RfqStatus::Evaluated, RfqStatus::Awarded)?;
        if cmd.winners.is_empty() {
            return Err(DomainError::validation("award requires at least one winner"));
        }

        let mut awards = Vec::with_capacity(cmd.winners.len());
        for winner in &cmd.winners {
            if awards.iter().any(|a: &Award| a.supplier_id == *winner) {
                return Err(DomainError::validation("duplicate award winner"));
            }
            let invitation = self.supplier(*winner)?;
            let quote = match (invitation.state, invitation.quote) {
                (SupplierState::Quoted, Some(quote)) => quote,
                _ => {
                    return Err(DomainError::invariant(
                        "only suppliers with a recorded quote can be awarded",
                    ));
                }
            };
            awards.push(Award {
                supplier_id: *winner,
                amount: quote.total_amount,
            });
        }

        Ok(vec![RfqEvent::RfqAwarded(RfqAwarded {
            rfq_id: cmd.rfq_id,
            awards,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelRfq) -> Result<Vec<RfqEvent>, DomainError> {
        self.ensure_exists()?;

        match self.status {
            RfqStatus::Cancelled => Ok(vec![]),
            RfqStatus::Awarded => Err(DomainError::invalid_transition("awarded", "cancelled")),
            _ => Ok(vec![RfqEvent::RfqCancelled(RfqCancelled {
                rfq_id: cmd.rfq_id,
                occurred_at: cmd.occurred_at,
            })]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use procflow_core::AggregateId;
    use procflow_events::execute;

    fn test_rfq_id() -> RfqId {
        RfqId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    /// RFQ in `BiddingOpen` with three invited suppliers.
    fn open_rfq(suppliers: &[SupplierId], due_date: DateTime<Utc>) -> Rfq {
        let id = test_rfq_id();
        let mut rfq = Rfq::empty(id);
        for cmd in [
            RfqCommand::CreateRfq(CreateRfq {
                rfq_id: id,
                request_id: RequestId::new(AggregateId::new()),
                items: vec![RfqLineItem {
                    name: "workshop lift".to_string(),
                    quantity: 2,
                }],
                suppliers: suppliers.to_vec(),
                due_date,
                occurred_at: test_time(),
            }),
            RfqCommand::IssueRfq(IssueRfq {
                rfq_id: id,
                occurred_at: test_time(),
            }),
            RfqCommand::OpenBidding(OpenBidding {
                rfq_id: id,
                occurred_at: test_time(),
            }),
        ] {
            execute(&mut rfq, &cmd).unwrap();
        }
        rfq
    }

    #[test]
    fn sweep_before_due_date_is_a_no_op() {
        let due = Utc::now() + Duration::days(7);
        let suppliers = [SupplierId::new(), SupplierId::new()];
        let mut rfq = open_rfq(&suppliers, due);
        let rfq_id = rfq.id_typed();

        let events = execute(
            &mut rfq,
            &RfqCommand::SweepDueDate(SweepDueDate {
                rfq_id,
                now: due - Duration::hours(1),
            }),
        )
        .unwrap();

        assert!(events.is_empty());
        assert!(rfq.suppliers().iter().all(|s| s.state == SupplierState::Invited));
    }

    #[test]
    fn sweep_coerces_unresolved_suppliers_and_unblocks_evaluation() {
        // Three invited, one quotes, due date passes with two unresolved.
        let due = Utc::now() + Duration::days(7);
        let suppliers = [SupplierId::new(), SupplierId::new(), SupplierId::new()];
        let mut rfq = open_rfq(&suppliers, due);
        let rfq_id = rfq.id_typed();

        execute(
            &mut rfq,
            &RfqCommand::RecordQuote(RecordQuote {
                rfq_id,
                supplier_id: suppliers[0],
                total_amount: 42_000,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        execute(
            &mut rfq,
            &RfqCommand::CloseBidding(CloseBidding {
                rfq_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        // Evaluation is blocked while two invitations remain unresolved.
        let err = execute(
            &mut rfq,
            &RfqCommand::EvaluateBids(EvaluateBids {
                rfq_id,
                override_unresolved: false,
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));

        let events = execute(
            &mut rfq,
            &RfqCommand::SweepDueDate(SweepDueDate {
                rfq_id,
                now: due + Duration::hours(1),
            }),
        )
        .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            rfq.suppliers()
                .iter()
                .filter(|s| s.state == SupplierState::NoResponse)
                .count(),
            2
        );

        execute(
            &mut rfq,
            &RfqCommand::EvaluateBids(EvaluateBids {
                rfq_id,
                override_unresolved: false,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(rfq.status(), RfqStatus::Evaluated);
    }

    #[test]
    fn award_reads_amounts_from_quotes() {
        let due = Utc::now() + Duration::days(7);
        let suppliers = [SupplierId::new(), SupplierId::new()];
        let mut rfq = open_rfq(&suppliers, due);
        let rfq_id = rfq.id_typed();

        for (supplier_id, amount) in [(suppliers[0], 30_000), (suppliers[1], 28_000)] {
            execute(
                &mut rfq,
                &RfqCommand::RecordQuote(RecordQuote {
                    rfq_id,
                    supplier_id,
                    total_amount: amount,
                    occurred_at: test_time(),
                }),
            )
            .unwrap();
        }
        for cmd in [
            RfqCommand::CloseBidding(CloseBidding {
                rfq_id,
                occurred_at: test_time(),
            }),
            RfqCommand::EvaluateBids(EvaluateBids {
                rfq_id,
                override_unresolved: false,
                occurred_at: test_time(),
            }),
        ] {
            execute(&mut rfq, &cmd).unwrap();
        }

        let events = execute(
            &mut rfq,
            &RfqCommand::AwardRfq(AwardRfq {
                rfq_id,
                winners: suppliers.to_vec(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        match &events[0] {
            RfqEvent::RfqAwarded(e) => {
                assert_eq!(e.awards.len(), 2);
                assert_eq!(e.awards[0].amount, 30_000);
                assert_eq!(e.awards[1].amount, 28_000);
            }
            other => panic!("Expected RfqAwarded, got {other:?}"),
        }
        assert_eq!(rfq.status(), RfqStatus::Awarded);
    }

    #[test]
    fn awarding_a_supplier_without_a_quote_is_rejected() {
        let due = Utc::now() + Duration::days(7);
        let suppliers = [SupplierId::new(), SupplierId::new()];
        let mut rfq = open_rfq(&suppliers, due);
        let rfq_id = rfq.id_typed();

        execute(
            &mut rfq,
            &RfqCommand::RecordQuote(RecordQuote {
                rfq_id,
                supplier_id: suppliers[0],
                total_amount: 10_000,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        for cmd in [
            RfqCommand::CloseBidding(CloseBidding {
                rfq_id,
                occurred_at: test_time(),
            }),
            RfqCommand::SweepDueDate(SweepDueDate {
                rfq_id,
                now: due + Duration::hours(1),
            }),
            RfqCommand::EvaluateBids(EvaluateBids {
                rfq_id,
                override_unresolved: false,
                occurred_at: test_time(),
            }),
        ] {
            execute(&mut rfq, &cmd).unwrap();
        }

        let err = execute(
            &mut rfq,
            &RfqCommand::AwardRfq(AwardRfq {
                rfq_id,
                winners: vec![suppliers[1]],
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(rfq.status(), RfqStatus::Evaluated);
    }

    #[test]
    fn quotes_are_rejected_outside_the_bidding_window() {
        let id = test_rfq_id();
        let mut rfq = Rfq::empty(id);
        let supplier = SupplierId::new();
        execute(
            &mut rfq,
            &RfqCommand::CreateRfq(CreateRfq {
                rfq_id: id,
                request_id: RequestId::new(AggregateId::new()),
                items: vec![RfqLineItem {
                    name: "scanner".to_string(),
                    quantity: 1,
                }],
                suppliers: vec![supplier],
                due_date: Utc::now() + Duration::days(3),
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        let err = execute(
            &mut rfq,
            &RfqCommand::RecordQuote(RecordQuote {
                rfq_id: id,
                supplier_id: supplier,
                total_amount: 5_000,
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: "draft",
                to: "bidding_open"
            }
        );
    }
}

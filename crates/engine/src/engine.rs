//! Orchestration facade over the domain aggregates and the budget ledger.
//!
//! The engine owns the entity stores, the ledger, the audit log and the
//! event bus. Every inbound operation follows the same shape:
//!
//! 1. referential-integrity checks against sibling stores;
//! 2. a critical section over the entity (and, for monetary operations,
//!    the budget line) where command handling and ledger movement happen
//!    all-or-nothing;
//! 3. an audit entry appended and published after locks are dropped.
//!
//! Lock ordering is fixed to avoid deadlocks: rfq -> request -> contract,
//! entity before ledger line. No critical section performs IO.

use chrono::{DateTime, Utc};

use procflow_contracts::{
    ActivateContract, CancelContract, Contract, ContractCommand, ContractId, ContractType,
    CreateContract, EffectiveStatus, RecordOrderSpend, RenewContract, SuspendContract,
};
use procflow_core::{Aggregate, AggregateId, DomainError, SupplierId, UserId};
use procflow_events::{EventBus, InMemoryEventBus, Subscription, execute};
use procflow_ledger::{
    AlertLevel, BudgetLedger, BudgetLineId, BudgetScope, BudgetSnapshot, CommitmentOwner,
};
use procflow_orders::{
    AcknowledgeOrder, ApplyReceipt, CancelOrder, CommitmentSource, CompleteOrder, CreateOrder,
    IssueOrder, OrderLine, OrderOrigin, PurchaseOrder, PurchaseOrderCommand, PurchaseOrderEvent,
    PurchaseOrderId, PurchaseOrderStatus, ShipOrder,
};
use procflow_receiving::{GoodsReceipt, InspectionStatus, ReceiptId, ReceiptLine, reconcile};
use procflow_requests::{
    AddItem, ApproveRequest, CancelRequest, CreateRequest, LinkOrder, ProcurementRequest,
    RejectRequest, RequestCommand, RequestEvent, RequestId, RequestLineItem, RequestStatus,
    SubmitRequest,
};
use procflow_rfq::{
    Award, AwardRfq, CancelRfq, CloseBidding, CreateRfq, EvaluateBids, IssueRfq, OpenBidding,
    RecordDecline, RecordQuote, RecordView, Rfq, RfqCommand, RfqEvent, RfqId, RfqLineItem,
    SweepDueDate,
};

use crate::audit::{AuditEvent, AuditLog, AuditOutcome};
use crate::store::EntityStore;

/// The procurement engine: single entry point for all lifecycle operations.
#[derive(Debug, Default)]
pub struct ProcurementEngine {
    ledger: BudgetLedger,
    requests: EntityStore<RequestId, ProcurementRequest>,
    rfqs: EntityStore<RfqId, Rfq>,
    orders: EntityStore<PurchaseOrderId, PurchaseOrder>,
    contracts: EntityStore<ContractId, Contract>,
    receipts: EntityStore<ReceiptId, GoodsReceipt>,
    audit: AuditLog,
    bus: InMemoryEventBus<AuditEvent>,
}

fn poisoned() -> DomainError {
    DomainError::conflict("entity store lock poisoned")
}

impl ProcurementEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Subscribe to the live audit feed (broadcast, at-least-once).
    pub fn subscribe_audit(&self) -> Subscription<AuditEvent> {
        self.bus.subscribe()
    }

    fn record(
        &self,
        entity_id: AggregateId,
        entity_type: &str,
        transition: &str,
        outcome: AuditOutcome,
        actor: UserId,
        occurred_at: DateTime<Utc>,
    ) {
        let event = AuditEvent {
            entity_id,
            entity_type: entity_type.to_string(),
            transition: transition.to_string(),
            outcome,
            actor,
            occurred_at,
        };
        if self.audit.append(event.clone()).is_err() {
            tracing::error!(transition, %entity_id, "audit append failed");
        }
        // The log is the source of truth; a publish failure only affects
        // live consumers, who can re-read the log.
        if let Err(err) = self.bus.publish(event) {
            tracing::warn!(?err, transition, "audit publish failed");
        }
    }

    /// Audit the outcome of an operation and unwrap its payload.
    fn finish<T>(
        &self,
        entity_id: AggregateId,
        entity_type: &str,
        transition: &str,
        actor: UserId,
        occurred_at: DateTime<Utc>,
        result: Result<(T, i64), DomainError>,
    ) -> Result<T, DomainError> {
        match result {
            Ok((value, commitment_delta)) => {
                tracing::info!(transition, %entity_id, commitment_delta, "applied");
                self.record(
                    entity_id,
                    entity_type,
                    transition,
                    AuditOutcome::Applied { commitment_delta },
                    actor,
                    occurred_at,
                );
                Ok(value)
            }
            Err(err) => {
                tracing::info!(transition, %entity_id, error = %err, "rejected");
                self.record(
                    entity_id,
                    entity_type,
                    transition,
                    AuditOutcome::Rejected {
                        error_kind: err.kind().to_string(),
                    },
                    actor,
                    occurred_at,
                );
                Err(err)
            }
        }
    }

    fn note_alert(snapshot: &BudgetSnapshot) {
        if snapshot.alert_level != AlertLevel::Normal {
            tracing::warn!(
                line_id = %snapshot.line_id.0,
                utilization_pct = snapshot.utilization_pct,
                level = ?snapshot.alert_level,
                "budget line alert threshold crossed"
            );
        }
    }

    // ----- budget lines ---------------------------------------------------

    pub fn open_budget_line(
        &self,
        scope: BudgetScope,
        total: i64,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<BudgetSnapshot, DomainError> {
        let id = BudgetLineId::new(AggregateId::new());
        let result = self.ledger.open_line(id, scope, total).map(|s| (s, 0));
        self.finish(id.0, "budget_line", "budget.line_opened", actor, now, result)
    }

    pub fn budget_snapshot(&self, id: BudgetLineId) -> Result<BudgetSnapshot, DomainError> {
        self.ledger.snapshot(id)
    }

    // ----- requests -------------------------------------------------------

    pub fn create_request(
        &self,
        requester: UserId,
        department: impl Into<String>,
        budget_line_id: BudgetLineId,
        items: Vec<RequestLineItem>,
        now: DateTime<Utc>,
    ) -> Result<ProcurementRequest, DomainError> {
        let id = RequestId::new(AggregateId::new());
        let result = (|| {
            // The budget line must exist before anything can be requested
            // against it.
            self.ledger.snapshot(budget_line_id)?;

            let mut request = ProcurementRequest::empty(id);
            execute(
                &mut request,
                &RequestCommand::CreateRequest(CreateRequest {
                    request_id: id,
                    requester,
                    department: department.into(),
                    budget_line_id,
                    items,
                    occurred_at: now,
                }),
            )?;
            self.requests.insert_new(id, request.clone())?;
            Ok((request, 0))
        })();
        self.finish(id.0, "request", "request.created", requester, now, result)
    }

    pub fn add_request_item(
        &self,
        id: RequestId,
        item: RequestLineItem,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<ProcurementRequest, DomainError> {
        let result = self.requests.with(id, |request| {
            execute(
                request,
                &RequestCommand::AddItem(AddItem {
                    request_id: id,
                    item,
                    occurred_at: now,
                }),
            )?;
            Ok((request.clone(), 0))
        });
        self.finish(id.0, "request", "request.item_added", actor, now, result)
    }

    pub fn submit_request(
        &self,
        id: RequestId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<ProcurementRequest, DomainError> {
        let result = self.requests.with(id, |request| {
            execute(
                request,
                &RequestCommand::SubmitRequest(SubmitRequest {
                    request_id: id,
                    occurred_at: now,
                }),
            )?;
            Ok((request.clone(), 0))
        });
        self.finish(id.0, "request", "request.submitted", actor, now, result)
    }

    /// Approve a request, committing its full amount against the budget
    /// line. The hold and the status change succeed or fail together: if
    /// the aggregate rejects the approval after the hold was taken, the
    /// hold is released again (compensation).
    pub fn approve_request(
        &self,
        id: RequestId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<(ProcurementRequest, BudgetSnapshot), DomainError> {
        let result = (|| {
            let handle = self.requests.handle(id)?;
            let mut request = handle.lock().map_err(|_| poisoned())?;

            request.ensure_can_approve()?;
            let line_id = request
                .budget_line_id()
                .ok_or_else(|| DomainError::invariant("request has no budget line"))?;
            let total = request.total_amount();

            let (commitment_id, snapshot) =
                self.ledger
                    .commit(line_id, total, CommitmentOwner::Request(id.0))?;
            Self::note_alert(&snapshot);

            let approved = execute(
                &mut *request,
                &RequestCommand::ApproveRequest(ApproveRequest {
                    request_id: id,
                    commitment_id,
                    occurred_at: now,
                }),
            );
            if let Err(err) = approved {
                if let Err(release_err) = self.ledger.release(commitment_id) {
                    tracing::error!(
                        commitment = %commitment_id.0,
                        error = %release_err,
                        "compensating release failed"
                    );
                }
                return Err(err);
            }
            Ok(((request.clone(), snapshot), total))
        })();
        self.finish(id.0, "request", "request.approved", actor, now, result)
    }

    pub fn reject_request(
        &self,
        id: RequestId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<ProcurementRequest, DomainError> {
        let result = self.requests.with(id, |request| {
            execute(
                request,
                &RequestCommand::RejectRequest(RejectRequest {
                    request_id: id,
                    occurred_at: now,
                }),
            )?;
            Ok((request.clone(), 0))
        });
        self.finish(id.0, "request", "request.rejected", actor, now, result)
    }

    /// Cancel a request; releases its held commitment if one exists.
    /// Idempotent: cancelling a cancelled request is a no-op.
    pub fn cancel_request(
        &self,
        id: RequestId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<(ProcurementRequest, Option<BudgetSnapshot>), DomainError> {
        let result = self.requests.with(id, |request| {
            let command = RequestCommand::CancelRequest(CancelRequest {
                request_id: id,
                occurred_at: now,
            });
            // Decide first, move money second, mutate last: the aggregate
            // is only evolved once the ledger release has succeeded.
            let events = request.handle(&command)?;
            let held = events.iter().find_map(|e| match e {
                RequestEvent::RequestCancelled(c) => c.held_commitment,
                _ => None,
            });

            let mut snapshot = None;
            let mut delta = 0;
            if let Some(commitment_id) = held {
                let (released, snap) = self.ledger.release(commitment_id)?;
                delta = -released;
                snapshot = Some(snap);
            }
            for event in &events {
                request.apply(event);
            }
            Ok(((request.clone(), snapshot), delta))
        });
        self.finish(id.0, "request", "request.cancelled", actor, now, result)
    }

    // ----- rfqs -----------------------------------------------------------

    /// Create an RFQ sourced from a live (non-cancelled, non-rejected)
    /// request; line items are carried over from the request.
    pub fn create_rfq(
        &self,
        request_id: RequestId,
        suppliers: Vec<SupplierId>,
        due_date: DateTime<Utc>,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Rfq, DomainError> {
        let id = RfqId::new(AggregateId::new());
        let result = (|| {
            let request = self.requests.get(request_id)?;
            if matches!(
                request.status(),
                RequestStatus::Cancelled | RequestStatus::Rejected
            ) {
                return Err(DomainError::conflict("rfq requires a live request"));
            }
            let items: Vec<RfqLineItem> = request
                .items()
                .iter()
                .map(|item| RfqLineItem {
                    name: item.name.clone(),
                    quantity: item.quantity,
                })
                .collect();

            let mut rfq = Rfq::empty(id);
            execute(
                &mut rfq,
                &RfqCommand::CreateRfq(CreateRfq {
                    rfq_id: id,
                    request_id,
                    items,
                    suppliers,
                    due_date,
                    occurred_at: now,
                }),
            )?;
            self.rfqs.insert_new(id, rfq.clone())?;
            Ok((rfq, 0))
        })();
        self.finish(id.0, "rfq", "rfq.created", actor, now, result)
    }

    pub fn issue_rfq(
        &self,
        id: RfqId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Rfq, DomainError> {
        let result = self.rfqs.with(id, |rfq| {
            execute(
                rfq,
                &RfqCommand::IssueRfq(IssueRfq {
                    rfq_id: id,
                    occurred_at: now,
                }),
            )?;
            Ok((rfq.clone(), 0))
        });
        self.finish(id.0, "rfq", "rfq.issued", actor, now, result)
    }

    pub fn open_bidding(
        &self,
        id: RfqId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Rfq, DomainError> {
        let result = self.rfqs.with(id, |rfq| {
            execute(
                rfq,
                &RfqCommand::OpenBidding(OpenBidding {
                    rfq_id: id,
                    occurred_at: now,
                }),
            )?;
            Ok((rfq.clone(), 0))
        });
        self.finish(id.0, "rfq", "rfq.bidding_opened", actor, now, result)
    }

    pub fn record_supplier_view(
        &self,
        id: RfqId,
        supplier_id: SupplierId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Rfq, DomainError> {
        let result = self.rfqs.with(id, |rfq| {
            execute(
                rfq,
                &RfqCommand::RecordView(RecordView {
                    rfq_id: id,
                    supplier_id,
                    occurred_at: now,
                }),
            )?;
            Ok((rfq.clone(), 0))
        });
        self.finish(id.0, "rfq", "rfq.supplier_viewed", actor, now, result)
    }

    pub fn record_quote(
        &self,
        id: RfqId,
        supplier_id: SupplierId,
        total_amount: i64,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Rfq, DomainError> {
        let result = self.rfqs.with(id, |rfq| {
            execute(
                rfq,
                &RfqCommand::RecordQuote(RecordQuote {
                    rfq_id: id,
                    supplier_id,
                    total_amount,
                    occurred_at: now,
                }),
            )?;
            Ok((rfq.clone(), 0))
        });
        self.finish(id.0, "rfq", "rfq.quote_recorded", actor, now, result)
    }

    pub fn record_decline(
        &self,
        id: RfqId,
        supplier_id: SupplierId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Rfq, DomainError> {
        let result = self.rfqs.with(id, |rfq| {
            execute(
                rfq,
                &RfqCommand::RecordDecline(RecordDecline {
                    rfq_id: id,
                    supplier_id,
                    occurred_at: now,
                }),
            )?;
            Ok((rfq.clone(), 0))
        });
        self.finish(id.0, "rfq", "rfq.supplier_declined", actor, now, result)
    }

    pub fn close_bidding(
        &self,
        id: RfqId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Rfq, DomainError> {
        let result = self.rfqs.with(id, |rfq| {
            execute(
                rfq,
                &RfqCommand::CloseBidding(CloseBidding {
                    rfq_id: id,
                    occurred_at: now,
                }),
            )?;
            Ok((rfq.clone(), 0))
        });
        self.finish(id.0, "rfq", "rfq.bidding_closed", actor, now, result)
    }

    /// Time out unresolved supplier invitations once the due date has
    /// passed. A no-op before the due date.
    pub fn sweep_rfq_due_date(
        &self,
        id: RfqId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Rfq, DomainError> {
        let result = self.rfqs.with(id, |rfq| {
            execute(
                rfq,
                &RfqCommand::SweepDueDate(SweepDueDate { rfq_id: id, now }),
            )?;
            Ok((rfq.clone(), 0))
        });
        self.finish(id.0, "rfq", "rfq.due_date_swept", actor, now, result)
    }

    pub fn evaluate_bids(
        &self,
        id: RfqId,
        override_unresolved: bool,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Rfq, DomainError> {
        let result = self.rfqs.with(id, |rfq| {
            execute(
                rfq,
                &RfqCommand::EvaluateBids(EvaluateBids {
                    rfq_id: id,
                    override_unresolved,
                    occurred_at: now,
                }),
            )?;
            Ok((rfq.clone(), 0))
        });
        self.finish(id.0, "rfq", "rfq.evaluated", actor, now, result)
    }

    pub fn cancel_rfq(
        &self,
        id: RfqId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Rfq, DomainError> {
        let result = self.rfqs.with(id, |rfq| {
            execute(
                rfq,
                &RfqCommand::CancelRfq(CancelRfq {
                    rfq_id: id,
                    occurred_at: now,
                }),
            )?;
            Ok((rfq.clone(), 0))
        });
        self.finish(id.0, "rfq", "rfq.cancelled", actor, now, result)
    }

    /// Award the RFQ and fan out one purchase order per winner.
    ///
    /// Money policy: a single award whose quote fits inside the request's
    /// held commitment inherits it unchanged; any other shape atomically
    /// rebases the hold into one fresh commitment per awarded order, all
    /// inside the budget line's critical section.
    pub fn award_rfq(
        &self,
        id: RfqId,
        winners: Vec<SupplierId>,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<(Rfq, Vec<PurchaseOrder>, BudgetSnapshot), DomainError> {
        let result = (|| {
            let rfq_handle = self.rfqs.handle(id)?;
            let mut rfq = rfq_handle.lock().map_err(|_| poisoned())?;

            let rfq_events = rfq.handle(&RfqCommand::AwardRfq(AwardRfq {
                rfq_id: id,
                winners,
                occurred_at: now,
            }))?;
            let awards: Vec<Award> = rfq_events
                .iter()
                .find_map(|e| match e {
                    RfqEvent::RfqAwarded(a) => Some(a.awards.clone()),
                    _ => None,
                })
                .ok_or_else(|| DomainError::invariant("award emitted no award event"))?;

            // Plan the orders before moving any money; the planned lines
            // always satisfy order validation (allocation sums exactly).
            let planned: Vec<(PurchaseOrderId, Award, Vec<OrderLine>)> = awards
                .into_iter()
                .map(|award| {
                    let order_id = PurchaseOrderId::new(AggregateId::new());
                    let lines = allocate_order_lines(rfq.items(), award.amount);
                    (order_id, award, lines)
                })
                .collect();
            let awarded_total: i64 = planned.iter().map(|(_, a, _)| a.amount).sum();

            let request_id = rfq
                .request_id()
                .ok_or_else(|| DomainError::invariant("rfq has no originating request"))?;
            let request_handle = self.requests.handle(request_id)?;
            let mut request = request_handle.lock().map_err(|_| poisoned())?;
            // Decide the request transition before any money moves; the
            // rebase below has no compensating path.
            let link_events = request.handle(&RequestCommand::LinkOrder(LinkOrder {
                request_id,
                order_id: planned[0].0.0,
                occurred_at: now,
            }))?;
            let commitment_id = request
                .commitment_id()
                .ok_or_else(|| DomainError::invariant("awarded request holds no commitment"))?;
            let commitment = self.ledger.commitment(commitment_id)?;

            let single_fit = planned.len() == 1 && awarded_total <= commitment.amount;
            let (sources, snapshot, delta) = if single_fit {
                let snapshot = self.ledger.snapshot(commitment.budget_line_id)?;
                (vec![CommitmentSource::Inherited(commitment_id)], snapshot, 0)
            } else {
                let replacements: Vec<(i64, CommitmentOwner)> = planned
                    .iter()
                    .map(|(order_id, award, _)| {
                        (award.amount, CommitmentOwner::Order(order_id.0))
                    })
                    .collect();
                let (fresh, snapshot) = self.ledger.rebase(commitment_id, &replacements)?;
                Self::note_alert(&snapshot);
                let sources = fresh.into_iter().map(CommitmentSource::Fresh).collect();
                (sources, snapshot, awarded_total - commitment.amount)
            };

            let mut orders = Vec::with_capacity(planned.len());
            for ((order_id, award, lines), source) in planned.into_iter().zip(sources) {
                let total_amount = award.amount;
                let mut order = PurchaseOrder::empty(order_id);
                execute(
                    &mut order,
                    &PurchaseOrderCommand::CreateOrder(CreateOrder {
                        order_id,
                        supplier_id: award.supplier_id,
                        origin: OrderOrigin::Rfq(id),
                        commitment: source,
                        contract_id: None,
                        lines,
                        total_amount,
                        expected_delivery: None,
                        occurred_at: now,
                    }),
                )?;
                orders.push(order);
            }

            for event in &link_events {
                request.apply(event);
            }
            for event in &rfq_events {
                rfq.apply(event);
            }
            for order in &orders {
                self.orders.insert_new(order.id_typed(), order.clone())?;
            }
            Ok(((rfq.clone(), orders, snapshot), delta))
        })();
        self.finish(id.0, "rfq", "rfq.awarded", actor, now, result)
    }

    // ----- orders ---------------------------------------------------------

    /// Create an order directly from an approved request (no RFQ round),
    /// inheriting the request's held commitment. When contract-backed, the
    /// contract must still be in force (active, or inside its expiry
    /// warning window).
    pub fn create_order_from_request(
        &self,
        request_id: RequestId,
        supplier_id: SupplierId,
        contract_id: Option<ContractId>,
        expected_delivery: Option<DateTime<Utc>>,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOrder, DomainError> {
        let order_id = PurchaseOrderId::new(AggregateId::new());
        let result = (|| {
            let request_handle = self.requests.handle(request_id)?;
            let mut request = request_handle.lock().map_err(|_| poisoned())?;

            if request.status() != RequestStatus::Approved {
                return Err(DomainError::invalid_transition(
                    request.status().as_str(),
                    "ordered",
                ));
            }
            let commitment_id = request
                .commitment_id()
                .ok_or_else(|| DomainError::invariant("approved request holds no commitment"))?;
            if let Some(contract_id) = contract_id {
                let contract = self.contracts.get(contract_id)?;
                // ExpiringSoon is still in force; only expired or inactive
                // contracts block new orders.
                if !matches!(
                    contract.effective_status(now),
                    EffectiveStatus::Active | EffectiveStatus::ExpiringSoon
                ) {
                    return Err(DomainError::conflict("order requires an active contract"));
                }
            }

            let lines: Vec<OrderLine> = request
                .items()
                .iter()
                .enumerate()
                .map(|(idx, item)| OrderLine {
                    line_no: idx as u32 + 1,
                    name: item.name.clone(),
                    quantity: item.quantity,
                    line_value: item.amount(),
                    received_quantity: 0,
                })
                .collect();

            let mut order = PurchaseOrder::empty(order_id);
            execute(
                &mut order,
                &PurchaseOrderCommand::CreateOrder(CreateOrder {
                    order_id,
                    supplier_id,
                    origin: OrderOrigin::Request(request_id),
                    commitment: CommitmentSource::Inherited(commitment_id),
                    contract_id,
                    lines,
                    total_amount: request.total_amount(),
                    expected_delivery,
                    occurred_at: now,
                }),
            )?;
            execute(
                &mut *request,
                &RequestCommand::LinkOrder(LinkOrder {
                    request_id,
                    order_id: order_id.0,
                    occurred_at: now,
                }),
            )?;
            self.orders.insert_new(order_id, order.clone())?;
            Ok((order, 0))
        })();
        self.finish(order_id.0, "order", "order.created", actor, now, result)
    }

    pub fn issue_order(
        &self,
        id: PurchaseOrderId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOrder, DomainError> {
        let result = self.orders.with(id, |order| {
            execute(
                order,
                &PurchaseOrderCommand::IssueOrder(IssueOrder {
                    order_id: id,
                    occurred_at: now,
                }),
            )?;
            Ok((order.clone(), 0))
        });
        self.finish(id.0, "order", "order.issued", actor, now, result)
    }

    pub fn acknowledge_order(
        &self,
        id: PurchaseOrderId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOrder, DomainError> {
        let result = self.orders.with(id, |order| {
            execute(
                order,
                &PurchaseOrderCommand::AcknowledgeOrder(AcknowledgeOrder {
                    order_id: id,
                    occurred_at: now,
                }),
            )?;
            Ok((order.clone(), 0))
        });
        self.finish(id.0, "order", "order.acknowledged", actor, now, result)
    }

    pub fn ship_order(
        &self,
        id: PurchaseOrderId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOrder, DomainError> {
        let result = self.orders.with(id, |order| {
            execute(
                order,
                &PurchaseOrderCommand::ShipOrder(ShipOrder {
                    order_id: id,
                    occurred_at: now,
                }),
            )?;
            Ok((order.clone(), 0))
        });
        self.finish(id.0, "order", "order.shipped", actor, now, result)
    }

    /// Record a goods receipt against an in-transit order.
    ///
    /// The receipt is reconciled against the order's open lines before
    /// anything changes; good-condition quantities are applied to the
    /// order, damaged/wrong-item lines only flag a discrepancy and await
    /// inspection. A receipt with no good quantities leaves the order's
    /// receiving state untouched.
    pub fn record_goods_receipt(
        &self,
        id: PurchaseOrderId,
        lines: Vec<ReceiptLine>,
        final_receipt: bool,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<(PurchaseOrder, GoodsReceipt), DomainError> {
        let result = (|| {
            let handle = self.orders.handle(id)?;
            let mut order = handle.lock().map_err(|_| poisoned())?;

            if !matches!(
                order.status(),
                PurchaseOrderStatus::InTransit | PurchaseOrderStatus::PartiallyReceived
            ) {
                return Err(DomainError::invalid_transition(
                    order.status().as_str(),
                    "partially_received",
                ));
            }

            let reconciliation = reconcile(order.lines(), &lines, final_receipt)?;
            let receipt_id = ReceiptId::new(AggregateId::new());

            if !reconciliation.accepted.is_empty() {
                execute(
                    &mut *order,
                    &PurchaseOrderCommand::ApplyReceipt(ApplyReceipt {
                        order_id: id,
                        receipt_id: receipt_id.0,
                        received: reconciliation.accepted.clone(),
                        close_short: final_receipt && !reconciliation.complete,
                        occurred_at: now,
                    }),
                )?;
            }

            let receipt = GoodsReceipt::new(
                receipt_id,
                id,
                lines,
                final_receipt,
                reconciliation.discrepancy,
                now,
            );
            self.receipts.insert_new(receipt_id, receipt.clone())?;
            Ok(((order.clone(), receipt), 0))
        })();
        self.finish(id.0, "order", "order.receipt_recorded", actor, now, result)
    }

    pub fn resolve_inspection(
        &self,
        id: ReceiptId,
        outcome: InspectionStatus,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<GoodsReceipt, DomainError> {
        let result = self.receipts.with(id, |receipt| {
            receipt.resolve_inspection(outcome)?;
            Ok((receipt.clone(), 0))
        });
        self.finish(
            id.0,
            "receipt",
            "receipt.inspection_resolved",
            actor,
            now,
            result,
        )
    }

    /// Complete a fully received order: settles its commitment at the
    /// value actually received (residual auto-released) and records the
    /// spend on the backing contract, if any. Blocked while any of the
    /// order's receipts has an unresolved discrepancy.
    pub fn complete_order(
        &self,
        id: PurchaseOrderId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<(PurchaseOrder, BudgetSnapshot), DomainError> {
        let result = (|| {
            let handle = self.orders.handle(id)?;
            let mut order = handle.lock().map_err(|_| poisoned())?;

            for receipt_id in self.receipts.ids()? {
                let receipt = self.receipts.get(receipt_id)?;
                if receipt.order_id() == id && receipt.blocks_completion() {
                    return Err(DomainError::conflict(
                        "order has a receipt awaiting inspection",
                    ));
                }
            }

            let events = order.handle(&PurchaseOrderCommand::CompleteOrder(CompleteOrder {
                order_id: id,
                occurred_at: now,
            }))?;
            let (commitment_id, actual_value) = events
                .iter()
                .find_map(|e| match e {
                    PurchaseOrderEvent::OrderCompleted(c) => {
                        Some((c.commitment_id, c.actual_value))
                    }
                    _ => None,
                })
                .ok_or_else(|| DomainError::invariant("completion emitted no event"))?;

            // Validate the contract spend before settling so either both
            // happen or neither does.
            let snapshot;
            let held;
            if let Some(contract_id) = order.contract_id() {
                let contract_handle = self.contracts.handle(contract_id)?;
                let mut contract = contract_handle.lock().map_err(|_| poisoned())?;
                let contract_events =
                    contract.handle(&ContractCommand::RecordOrderSpend(RecordOrderSpend {
                        contract_id,
                        order_id: id.0,
                        amount: actual_value,
                        occurred_at: now,
                    }))?;
                let (settlement, snap) = self.ledger.settle(commitment_id, actual_value)?;
                held = settlement.settled + settlement.residual;
                snapshot = snap;
                for event in &contract_events {
                    contract.apply(event);
                }
            } else {
                let (settlement, snap) = self.ledger.settle(commitment_id, actual_value)?;
                held = settlement.settled + settlement.residual;
                snapshot = snap;
            }

            for event in &events {
                order.apply(event);
            }
            Ok(((order.clone(), snapshot), -held))
        })();
        self.finish(id.0, "order", "order.completed", actor, now, result)
    }

    /// Cancel an order before goods are in transit; releases its budget
    /// commitment. Idempotent for already-cancelled orders.
    pub fn cancel_order(
        &self,
        id: PurchaseOrderId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<(PurchaseOrder, Option<BudgetSnapshot>), DomainError> {
        let result = (|| {
            let handle = self.orders.handle(id)?;
            let mut order = handle.lock().map_err(|_| poisoned())?;

            let events = order.handle(&PurchaseOrderCommand::CancelOrder(CancelOrder {
                order_id: id,
                occurred_at: now,
            }))?;
            let commitment_id = events.iter().find_map(|e| match e {
                PurchaseOrderEvent::OrderCancelled(c) => Some(c.commitment_id),
                _ => None,
            });

            let mut snapshot = None;
            let mut delta = 0;
            if let Some(commitment_id) = commitment_id {
                let (released, snap) = self.ledger.release(commitment_id)?;
                delta = -released;
                snapshot = Some(snap);
            }
            for event in &events {
                order.apply(event);
            }
            Ok(((order.clone(), snapshot), delta))
        })();
        self.finish(id.0, "order", "order.cancelled", actor, now, result)
    }

    // ----- contracts ------------------------------------------------------

    pub fn create_contract(
        &self,
        supplier_id: SupplierId,
        contract_type: ContractType,
        value: i64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Contract, DomainError> {
        let id = ContractId::new(AggregateId::new());
        let result = (|| {
            let mut contract = Contract::empty(id);
            execute(
                &mut contract,
                &ContractCommand::CreateContract(CreateContract {
                    contract_id: id,
                    supplier_id,
                    contract_type,
                    value,
                    start_date,
                    end_date,
                    occurred_at: now,
                }),
            )?;
            self.contracts.insert_new(id, contract.clone())?;
            Ok((contract, 0))
        })();
        self.finish(id.0, "contract", "contract.created", actor, now, result)
    }

    pub fn activate_contract(
        &self,
        id: ContractId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Contract, DomainError> {
        let result = self.contracts.with(id, |contract| {
            execute(
                contract,
                &ContractCommand::ActivateContract(ActivateContract {
                    contract_id: id,
                    occurred_at: now,
                }),
            )?;
            Ok((contract.clone(), 0))
        });
        self.finish(id.0, "contract", "contract.activated", actor, now, result)
    }

    pub fn suspend_contract(
        &self,
        id: ContractId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Contract, DomainError> {
        let result = self.contracts.with(id, |contract| {
            execute(
                contract,
                &ContractCommand::SuspendContract(SuspendContract {
                    contract_id: id,
                    occurred_at: now,
                }),
            )?;
            Ok((contract.clone(), 0))
        });
        self.finish(id.0, "contract", "contract.suspended", actor, now, result)
    }

    pub fn cancel_contract(
        &self,
        id: ContractId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Contract, DomainError> {
        let result = self.contracts.with(id, |contract| {
            execute(
                contract,
                &ContractCommand::CancelContract(CancelContract {
                    contract_id: id,
                    occurred_at: now,
                }),
            )?;
            Ok((contract.clone(), 0))
        });
        self.finish(id.0, "contract", "contract.cancelled", actor, now, result)
    }

    /// Renew a contract into a successor covering the new window. The
    /// predecessor moves to `Renewed` and chains to the successor, which
    /// starts as a draft; activation stays an explicit step.
    pub fn renew_contract(
        &self,
        id: ContractId,
        new_start_date: DateTime<Utc>,
        new_end_date: DateTime<Utc>,
        new_value: i64,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<(Contract, Contract), DomainError> {
        let successor_id = ContractId::new(AggregateId::new());
        let result = (|| {
            let handle = self.contracts.handle(id)?;
            let mut contract = handle.lock().map_err(|_| poisoned())?;

            let supplier_id = contract
                .supplier_id()
                .ok_or_else(|| DomainError::invariant("contract has no supplier"))?;
            let contract_type = contract.contract_type();

            let events = contract.handle(&ContractCommand::RenewContract(RenewContract {
                contract_id: id,
                successor_id,
                new_start_date,
                new_end_date,
                new_value,
                occurred_at: now,
            }))?;

            let mut successor = Contract::empty(successor_id);
            execute(
                &mut successor,
                &ContractCommand::CreateContract(CreateContract {
                    contract_id: successor_id,
                    supplier_id,
                    contract_type,
                    value: new_value,
                    start_date: new_start_date,
                    end_date: new_end_date,
                    occurred_at: now,
                }),
            )?;

            for event in &events {
                contract.apply(event);
            }
            self.contracts.insert_new(successor_id, successor.clone())?;
            Ok(((contract.clone(), successor), 0))
        })();
        self.finish(id.0, "contract", "contract.renewed", actor, now, result)
    }

    /// Time-derived status for a contract (expiring-soon/expired are
    /// recomputed on read, never stored).
    pub fn contract_effective_status(
        &self,
        id: ContractId,
        now: DateTime<Utc>,
    ) -> Result<EffectiveStatus, DomainError> {
        let contract = self.contracts.get(id)?;
        Ok(contract.effective_status(now))
    }

    /// Contracts currently inside the expiry warning window or past their
    /// end date.
    pub fn expiring_contracts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(ContractId, EffectiveStatus)>, DomainError> {
        let mut hits = Vec::new();
        for id in self.contracts.ids()? {
            let contract = self.contracts.get(id)?;
            let status = contract.effective_status(now);
            if matches!(
                status,
                EffectiveStatus::ExpiringSoon | EffectiveStatus::Expired
            ) {
                hits.push((id, status));
            }
        }
        Ok(hits)
    }
}

/// Spread an award amount over the RFQ's line items, proportional to
/// quantity. Floor division per line with the remainder on the last line,
/// so the values always sum to exactly `total`.
fn allocate_order_lines(items: &[RfqLineItem], total: i64) -> Vec<OrderLine> {
    let total_quantity: i64 = items.iter().map(|item| item.quantity).sum();
    let mut lines = Vec::with_capacity(items.len());
    let mut allocated = 0i64;
    for (idx, item) in items.iter().enumerate() {
        let line_value = if idx + 1 == items.len() {
            total - allocated
        } else {
            ((total as i128 * item.quantity as i128) / total_quantity as i128) as i64
        };
        allocated += line_value;
        lines.push(OrderLine {
            line_no: idx as u32 + 1,
            name: item.name.clone(),
            quantity: item.quantity,
            line_value,
            received_quantity: 0,
        });
    }
    lines
}

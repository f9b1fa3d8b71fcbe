use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procflow_contracts::ContractId;
use procflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, SupplierId};
use procflow_events::Event;
use procflow_ledger::CommitmentId;
use procflow_requests::RequestId;
use procflow_rfq::RfqId;

/// Purchase order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseOrderId(pub AggregateId);

impl PurchaseOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PurchaseOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Purchase order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    Draft,
    Issued,
    Acknowledged,
    InTransit,
    PartiallyReceived,
    Received,
    Completed,
    Cancelled,
}

impl PurchaseOrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PurchaseOrderStatus::Draft => "draft",
            PurchaseOrderStatus::Issued => "issued",
            PurchaseOrderStatus::Acknowledged => "acknowledged",
            PurchaseOrderStatus::InTransit => "in_transit",
            PurchaseOrderStatus::PartiallyReceived => "partially_received",
            PurchaseOrderStatus::Received => "received",
            PurchaseOrderStatus::Completed => "completed",
            PurchaseOrderStatus::Cancelled => "cancelled",
        }
    }
}

/// Where the order came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum OrderOrigin {
    Rfq(RfqId),
    Request(RequestId),
}

/// How the order is budget-backed: exactly one of the two paths, chosen at
/// creation and recorded for audit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "commitment", rename_all = "snake_case")]
pub enum CommitmentSource {
    /// Re-uses the commitment held when the originating request was approved.
    Inherited(CommitmentId),
    /// Committed independently when the order was created.
    Fresh(CommitmentId),
}

impl CommitmentSource {
    pub fn commitment_id(&self) -> CommitmentId {
        match self {
            CommitmentSource::Inherited(id) | CommitmentSource::Fresh(id) => *id,
        }
    }
}

/// One ordered line.
///
/// `line_value` is the monetary value of the full line; received value is
/// pro-rated from it, so partial receipts value out exactly without
/// per-unit rounding drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub line_no: u32,
    pub name: String,
    pub quantity: i64,
    pub line_value: i64,
    pub received_quantity: i64,
}

impl OrderLine {
    pub fn outstanding(&self) -> i64 {
        self.quantity - self.received_quantity
    }

    fn received_value(&self) -> i64 {
        // Floor division: under-valuation is safe, the residual is released
        // back to the budget at settlement.
        ((self.line_value as i128 * self.received_quantity as i128) / self.quantity as i128) as i64
    }
}

/// Quantity received for one order line.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedQuantity {
    pub line_no: u32,
    pub quantity: i64,
}

/// Aggregate root: PurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    supplier_id: Option<SupplierId>,
    origin: Option<OrderOrigin>,
    commitment: Option<CommitmentSource>,
    contract_id: Option<ContractId>,
    lines: Vec<OrderLine>,
    total_amount: i64,
    status: PurchaseOrderStatus,
    expected_delivery: Option<DateTime<Utc>>,
    actual_delivery: Option<DateTime<Utc>>,
    closed_short: bool,
    version: u64,
    created: bool,
}

impl PurchaseOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PurchaseOrderId) -> Self {
        Self {
            id,
            supplier_id: None,
            origin: None,
            commitment: None,
            contract_id: None,
            lines: Vec::new(),
            total_amount: 0,
            status: PurchaseOrderStatus::Draft,
            expected_delivery: None,
            actual_delivery: None,
            closed_short: false,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn supplier_id(&self) -> Option<SupplierId> {
        self.supplier_id
    }

    pub fn origin(&self) -> Option<OrderOrigin> {
        self.origin
    }

    pub fn commitment(&self) -> Option<CommitmentSource> {
        self.commitment
    }

    pub fn contract_id(&self) -> Option<ContractId> {
        self.contract_id
    }

    pub fn status(&self) -> PurchaseOrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn total_amount(&self) -> i64 {
        self.total_amount
    }

    pub fn expected_delivery(&self) -> Option<DateTime<Utc>> {
        self.expected_delivery
    }

    pub fn actual_delivery(&self) -> Option<DateTime<Utc>> {
        self.actual_delivery
    }

    pub fn closed_short(&self) -> bool {
        self.closed_short
    }

    /// Value of everything received so far, pro-rated per line.
    pub fn received_value(&self) -> i64 {
        self.lines.iter().map(OrderLine::received_value).sum()
    }

    fn fully_received(&self) -> bool {
        self.lines.iter().all(|l| l.outstanding() == 0)
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub order_id: PurchaseOrderId,
    pub supplier_id: SupplierId,
    pub origin: OrderOrigin,
    pub commitment: CommitmentSource,
    pub contract_id: Option<ContractId>,
    pub lines: Vec<OrderLine>,
    pub total_amount: i64,
    pub expected_delivery: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: IssueOrder (draft -> issued; requires the budget commitment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueOrder {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AcknowledgeOrder (issued -> acknowledged; supplier-driven).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeOrder {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ShipOrder (acknowledged -> in_transit; supplier-driven).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipOrder {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApplyReceipt.
///
/// Driven by the goods receipt reconciler: adds received quantities and
/// moves the order to `partially_received` or `received`. `close_short`
/// marks a final receipt that closes the order despite a shortfall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReceipt {
    pub order_id: PurchaseOrderId,
    pub receipt_id: AggregateId,
    pub received: Vec<ReceivedQuantity>,
    pub close_short: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteOrder (received -> completed).
///
/// Settles the commitment at the actual received value; quantity shortfalls
/// settle below the held amount and the residual is released automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteOrder {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
///
/// Legal only before goods move (draft | issued | acknowledged). Cancelling
/// an in-transit order needs a reversal workflow handled as a manual
/// exception outside this engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderCommand {
    CreateOrder(CreateOrder),
    IssueOrder(IssueOrder),
    AcknowledgeOrder(AcknowledgeOrder),
    ShipOrder(ShipOrder),
    ApplyReceipt(ApplyReceipt),
    CompleteOrder(CompleteOrder),
    CancelOrder(CancelOrder),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: PurchaseOrderId,
    pub supplier_id: SupplierId,
    pub origin: OrderOrigin,
    pub commitment: CommitmentSource,
    pub contract_id: Option<ContractId>,
    pub lines: Vec<OrderLine>,
    pub total_amount: i64,
    pub expected_delivery: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIssued {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAcknowledged {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptApplied {
    pub order_id: PurchaseOrderId,
    pub receipt_id: AggregateId,
    pub received: Vec<ReceivedQuantity>,
    /// Whether this receipt closed the order (fully received or closed
    /// short by a final receipt).
    pub order_complete: bool,
    pub closed_short: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCompleted {
    pub order_id: PurchaseOrderId,
    pub commitment_id: CommitmentId,
    /// What was actually delivered, valued pro-rata; settles the
    /// commitment.
    pub actual_value: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: PurchaseOrderId,
    pub commitment_id: CommitmentId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderEvent {
    OrderCreated(OrderCreated),
    OrderIssued(OrderIssued),
    OrderAcknowledged(OrderAcknowledged),
    OrderShipped(OrderShipped),
    ReceiptApplied(ReceiptApplied),
    OrderCompleted(OrderCompleted),
    OrderCancelled(OrderCancelled),
}

impl Event for PurchaseOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseOrderEvent::OrderCreated(_) => "orders.order.created",
            PurchaseOrderEvent::OrderIssued(_) => "orders.order.issued",
            PurchaseOrderEvent::OrderAcknowledged(_) => "orders.order.acknowledged",
            PurchaseOrderEvent::OrderShipped(_) => "orders.order.shipped",
            PurchaseOrderEvent::ReceiptApplied(_) => "orders.order.receipt_applied",
            PurchaseOrderEvent::OrderCompleted(_) => "orders.order.completed",
            PurchaseOrderEvent::OrderCancelled(_) => "orders.order.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseOrderEvent::OrderCreated(e) => e.occurred_at,
            PurchaseOrderEvent::OrderIssued(e) => e.occurred_at,
            PurchaseOrderEvent::OrderAcknowledged(e) => e.occurred_at,
            PurchaseOrderEvent::OrderShipped(e) => e.occurred_at,
            PurchaseOrderEvent::ReceiptApplied(e) => e.occurred_at,
            PurchaseOrderEvent::OrderCompleted(e) => e.occurred_at,
            PurchaseOrderEvent::OrderCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PurchaseOrder {
    type Command = PurchaseOrderCommand;
    type Event = PurchaseOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseOrderEvent::OrderCreated(e) => {
                self.id = e.order_id;
                self.supplier_id = Some(e.supplier_id);
                self.origin = Some(e.origin);
                self.commitment = Some(e.commitment);
                self.contract_id = e.contract_id;
                self.lines = e.lines.clone();
                self.total_amount = e.total_amount;
                self.expected_delivery = e.expected_delivery;
                self.status = PurchaseOrderStatus::Draft;
                self.created = true;
            }
            PurchaseOrderEvent::OrderIssued(_) => {
                self.status = PurchaseOrderStatus::Issued;
            }
            PurchaseOrderEvent::OrderAcknowledged(_) => {
                self.status = PurchaseOrderStatus::Acknowledged;
            }
            PurchaseOrderEvent::OrderShipped(_) => {
                self.status = PurchaseOrderStatus::InTransit;
            }
            PurchaseOrderEvent::ReceiptApplied(e) => {
                for received in &e.received {
                    if let Some(line) =
                        self.lines.iter_mut().find(|l| l.line_no == received.line_no)
                    {
                        line.received_quantity += received.quantity;
                    }
                }
                if e.order_complete {
                    self.status = PurchaseOrderStatus::Received;
                    self.actual_delivery = Some(e.occurred_at);
                    self.closed_short = e.closed_short;
                } else {
                    self.status = PurchaseOrderStatus::PartiallyReceived;
                }
            }
            PurchaseOrderEvent::OrderCompleted(_) => {
                self.status = PurchaseOrderStatus::Completed;
            }
            PurchaseOrderEvent::OrderCancelled(_) => {
                self.status = PurchaseOrderStatus::Cancelled;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseOrderCommand::CreateOrder(cmd) => self.handle_create(cmd),
            PurchaseOrderCommand::IssueOrder(cmd) => self.handle_issue(cmd),
            PurchaseOrderCommand::AcknowledgeOrder(cmd) => self.handle_acknowledge(cmd),
            PurchaseOrderCommand::ShipOrder(cmd) => self.handle_ship(cmd),
            PurchaseOrderCommand::ApplyReceipt(cmd) => self.handle_apply_receipt(cmd),
            PurchaseOrderCommand::CompleteOrder(cmd) => self.handle_complete(cmd),
            PurchaseOrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl PurchaseOrder {
    fn ensure_exists(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        Ok(())
    }

    fn ensure_status(
        &self,
        expected: PurchaseOrderStatus,
        to: PurchaseOrderStatus,
    ) -> Result<(), DomainError> {
        if self.status != expected {
            return Err(DomainError::invalid_transition(
                self.status.as_str(),
                to.as_str(),
            ));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateOrder) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("purchase order already exists"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("order must have at least one line"));
        }
        if cmd.total_amount <= 0 {
            return Err(DomainError::validation("order total must be positive"));
        }
        let mut line_total: i64 = 0;
        for line in &cmd.lines {
            if line.quantity <= 0 {
                return Err(DomainError::validation("line quantity must be positive"));
            }
            if line.line_value < 0 {
                return Err(DomainError::validation("line value must be >= 0"));
            }
            if line.received_quantity != 0 {
                return Err(DomainError::validation(
                    "new order lines cannot carry received quantities",
                ));
            }
            if cmd.lines.iter().filter(|l| l.line_no == line.line_no).count() > 1 {
                return Err(DomainError::validation("duplicate order line number"));
            }
            line_total += line.line_value;
        }
        if line_total != cmd.total_amount {
            return Err(DomainError::validation(
                "line values must sum to the order total",
            ));
        }

        Ok(vec![PurchaseOrderEvent::OrderCreated(OrderCreated {
            order_id: cmd.order_id,
            supplier_id: cmd.supplier_id,
            origin: cmd.origin,
            commitment: cmd.commitment,
            contract_id: cmd.contract_id,
            lines: cmd.lines.clone(),
            total_amount: cmd.total_amount,
            expected_delivery: cmd.expected_delivery,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_issue(&self, cmd: &IssueOrder) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(PurchaseOrderStatus::Draft, PurchaseOrderStatus::Issued)?;
        if self.commitment.is_none() {
            return Err(DomainError::invariant(
                "cannot issue an order without a budget commitment",
            ));
        }

        Ok(vec![PurchaseOrderEvent::OrderIssued(OrderIssued {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_acknowledge(
        &self,
        cmd: &AcknowledgeOrder,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(PurchaseOrderStatus::Issued, PurchaseOrderStatus::Acknowledged)?;

        Ok(vec![PurchaseOrderEvent::OrderAcknowledged(
            OrderAcknowledged {
                order_id: cmd.order_id,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_ship(&self, cmd: &ShipOrder) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(
            PurchaseOrderStatus::Acknowledged,
            PurchaseOrderStatus::InTransit,
        )?;

        Ok(vec![PurchaseOrderEvent::OrderShipped(OrderShipped {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_apply_receipt(
        &self,
        cmd: &ApplyReceipt,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_exists()?;
        if !matches!(
            self.status,
            PurchaseOrderStatus::InTransit | PurchaseOrderStatus::PartiallyReceived
        ) {
            return Err(DomainError::invalid_transition(
                self.status.as_str(),
                "partially_received",
            ));
        }
        if cmd.received.is_empty() {
            return Err(DomainError::validation("receipt has no received quantities"));
        }

        // Validate everything up front; nothing below can fail.
        let mut outstanding: Vec<(u32, i64)> = self
            .lines
            .iter()
            .map(|l| (l.line_no, l.outstanding()))
            .collect();
        for received in &cmd.received {
            if received.quantity <= 0 {
                return Err(DomainError::validation(
                    "received quantity must be positive",
                ));
            }
            let slot = outstanding
                .iter_mut()
                .find(|(line_no, _)| *line_no == received.line_no)
                .ok_or_else(|| DomainError::validation("receipt references an unknown line"))?;
            slot.1 -= received.quantity;
            if slot.1 < 0 {
                return Err(DomainError::validation(
                    "received quantity exceeds ordered quantity",
                ));
            }
        }

        let fully_received = outstanding.iter().all(|(_, rest)| *rest == 0);
        let order_complete = fully_received || cmd.close_short;

        Ok(vec![PurchaseOrderEvent::ReceiptApplied(ReceiptApplied {
            order_id: cmd.order_id,
            receipt_id: cmd.receipt_id,
            received: cmd.received.clone(),
            order_complete,
            closed_short: order_complete && !fully_received,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(
        &self,
        cmd: &CompleteOrder,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_exists()?;
        self.ensure_status(PurchaseOrderStatus::Received, PurchaseOrderStatus::Completed)?;

        let commitment = self
            .commitment
            .ok_or_else(|| DomainError::invariant("order has no budget commitment"))?;

        Ok(vec![PurchaseOrderEvent::OrderCompleted(OrderCompleted {
            order_id: cmd.order_id,
            commitment_id: commitment.commitment_id(),
            actual_value: self.received_value(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_exists()?;

        match self.status {
            PurchaseOrderStatus::Cancelled => Ok(vec![]),
            PurchaseOrderStatus::Draft
            | PurchaseOrderStatus::Issued
            | PurchaseOrderStatus::Acknowledged => {
                let commitment = self
                    .commitment
                    .ok_or_else(|| DomainError::invariant("order has no budget commitment"))?;
                Ok(vec![PurchaseOrderEvent::OrderCancelled(OrderCancelled {
                    order_id: cmd.order_id,
                    commitment_id: commitment.commitment_id(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            // Goods are moving: reversal is a manual exception, not an
            // engine transition.
            other => Err(DomainError::invalid_transition(other.as_str(), "cancelled")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procflow_events::execute;

    fn test_order_id() -> PurchaseOrderId {
        PurchaseOrderId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn test_line(line_no: u32, quantity: i64, line_value: i64) -> OrderLine {
        OrderLine {
            line_no,
            name: format!("line {line_no}"),
            quantity,
            line_value,
            received_quantity: 0,
        }
    }

    fn order_in_transit(lines: Vec<OrderLine>) -> PurchaseOrder {
        let id = test_order_id();
        let mut order = PurchaseOrder::empty(id);
        let total = lines.iter().map(|l| l.line_value).sum();
        for cmd in [
            PurchaseOrderCommand::CreateOrder(CreateOrder {
                order_id: id,
                supplier_id: SupplierId::new(),
                origin: OrderOrigin::Request(RequestId::new(AggregateId::new())),
                commitment: CommitmentSource::Inherited(CommitmentId::new(AggregateId::new())),
                contract_id: None,
                lines,
                total_amount: total,
                expected_delivery: None,
                occurred_at: test_time(),
            }),
            PurchaseOrderCommand::IssueOrder(IssueOrder {
                order_id: id,
                occurred_at: test_time(),
            }),
            PurchaseOrderCommand::AcknowledgeOrder(AcknowledgeOrder {
                order_id: id,
                occurred_at: test_time(),
            }),
            PurchaseOrderCommand::ShipOrder(ShipOrder {
                order_id: id,
                occurred_at: test_time(),
            }),
        ] {
            execute(&mut order, &cmd).unwrap();
        }
        order
    }

    #[test]
    fn create_rejects_mismatched_line_values() {
        let id = test_order_id();
        let order = PurchaseOrder::empty(id);

        let err = order
            .handle(&PurchaseOrderCommand::CreateOrder(CreateOrder {
                order_id: id,
                supplier_id: SupplierId::new(),
                origin: OrderOrigin::Request(RequestId::new(AggregateId::new())),
                commitment: CommitmentSource::Fresh(CommitmentId::new(AggregateId::new())),
                contract_id: None,
                lines: vec![test_line(1, 10, 5_000)],
                total_amount: 6_000,
                expected_delivery: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn partial_receipt_keeps_the_order_open() {
        let mut order = order_in_transit(vec![test_line(1, 100, 50_000)]);
        let order_id = order.id_typed();

        execute(
            &mut order,
            &PurchaseOrderCommand::ApplyReceipt(ApplyReceipt {
                order_id,
                receipt_id: AggregateId::new(),
                received: vec![ReceivedQuantity {
                    line_no: 1,
                    quantity: 40,
                }],
                close_short: false,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(order.status(), PurchaseOrderStatus::PartiallyReceived);
        assert_eq!(order.received_value(), 20_000);
    }

    #[test]
    fn full_receipt_marks_the_order_received() {
        let mut order = order_in_transit(vec![test_line(1, 10, 10_000), test_line(2, 5, 2_500)]);
        let order_id = order.id_typed();

        execute(
            &mut order,
            &PurchaseOrderCommand::ApplyReceipt(ApplyReceipt {
                order_id,
                receipt_id: AggregateId::new(),
                received: vec![
                    ReceivedQuantity {
                        line_no: 1,
                        quantity: 10,
                    },
                    ReceivedQuantity {
                        line_no: 2,
                        quantity: 5,
                    },
                ],
                close_short: false,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        assert_eq!(order.status(), PurchaseOrderStatus::Received);
        assert!(!order.closed_short());
        assert!(order.actual_delivery().is_some());
    }

    #[test]
    fn short_shipped_order_completes_at_received_value() {
        // Ordered 120 units valued 60_000; 110 arrive and the receipt
        // closes the order short: settle at 55_000.
        let mut order = order_in_transit(vec![test_line(1, 120, 60_000)]);
        let order_id = order.id_typed();

        execute(
            &mut order,
            &PurchaseOrderCommand::ApplyReceipt(ApplyReceipt {
                order_id,
                receipt_id: AggregateId::new(),
                received: vec![ReceivedQuantity {
                    line_no: 1,
                    quantity: 110,
                }],
                close_short: true,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.status(), PurchaseOrderStatus::Received);
        assert!(order.closed_short());

        let events = execute(
            &mut order,
            &PurchaseOrderCommand::CompleteOrder(CompleteOrder {
                order_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        match &events[0] {
            PurchaseOrderEvent::OrderCompleted(e) => assert_eq!(e.actual_value, 55_000),
            other => panic!("Expected OrderCompleted, got {other:?}"),
        }
        assert_eq!(order.status(), PurchaseOrderStatus::Completed);
    }

    #[test]
    fn over_delivery_is_rejected_without_state_change() {
        let mut order = order_in_transit(vec![test_line(1, 10, 10_000)]);

        let order_id = order.id_typed();
        let err = execute(
            &mut order,
            &PurchaseOrderCommand::ApplyReceipt(ApplyReceipt {
                order_id,
                receipt_id: AggregateId::new(),
                received: vec![ReceivedQuantity {
                    line_no: 1,
                    quantity: 11,
                }],
                close_short: false,
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(order.status(), PurchaseOrderStatus::InTransit);
        assert_eq!(order.lines()[0].received_quantity, 0);
    }

    #[test]
    fn cancel_after_shipping_is_a_manual_exception() {
        let mut order = order_in_transit(vec![test_line(1, 10, 10_000)]);

        let order_id = order.id_typed();
        let err = execute(
            &mut order,
            &PurchaseOrderCommand::CancelOrder(CancelOrder {
                order_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();

        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: "in_transit",
                to: "cancelled"
            }
        );
    }

    #[test]
    fn complete_before_full_receipt_is_rejected() {
        let mut order = order_in_transit(vec![test_line(1, 10, 10_000)]);

        let order_id = order.id_typed();
        let err = execute(
            &mut order,
            &PurchaseOrderCommand::CompleteOrder(CompleteOrder {
                order_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: "in_transit",
                to: "completed"
            }
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Pro-rated valuation never exceeds the line value, reaches it
            // exactly at full receipt, and grows with received quantity.
            #[test]
            fn received_value_is_bounded_and_monotone(
                quantity in 1i64..=10_000,
                line_value in 0i64..=10_000_000,
                received in 0i64..=10_000,
            ) {
                let received = received.min(quantity);
                let line = OrderLine {
                    line_no: 1,
                    name: "prop".to_string(),
                    quantity,
                    line_value,
                    received_quantity: received,
                };

                let value = line.received_value();
                prop_assert!(value >= 0);
                prop_assert!(value <= line_value);
                if received == quantity {
                    prop_assert_eq!(value, line_value);
                }
                if received < quantity {
                    let more = OrderLine {
                        received_quantity: received + 1,
                        ..line.clone()
                    };
                    prop_assert!(more.received_value() >= value);
                }
            }
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procflow_core::{AggregateId, DomainError, Entity};
use procflow_orders::PurchaseOrderId;

/// Goods receipt identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptId(pub AggregateId);

impl ReceiptId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Inspection outcome for a receipt.
///
/// A receipt with a discrepancy blocks order completion until inspection
/// reaches `Passed` or `Conditional`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InspectionStatus {
    Pending,
    Passed,
    Conditional,
    Failed,
}

/// Typed reason a receipt deviates from the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyType {
    ShortShipped,
    Damaged,
    WrongItem,
}

/// Physical condition of one received line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineCondition {
    Good,
    Damaged,
    WrongItem,
}

/// One received line, matched by order line number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub line_no: u32,
    pub quantity: i64,
    pub condition: LineCondition,
}

/// A recorded goods receipt against a purchase order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsReceipt {
    id: ReceiptId,
    order_id: PurchaseOrderId,
    lines: Vec<ReceiptLine>,
    /// Marks the last delivery for the order; shortfalls on a final
    /// receipt close the order short instead of leaving it open.
    final_receipt: bool,
    inspection: InspectionStatus,
    discrepancy: Option<DiscrepancyType>,
    received_at: DateTime<Utc>,
}

impl Entity for GoodsReceipt {
    type Id = ReceiptId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl GoodsReceipt {
    pub fn new(
        id: ReceiptId,
        order_id: PurchaseOrderId,
        lines: Vec<ReceiptLine>,
        final_receipt: bool,
        discrepancy: Option<DiscrepancyType>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            order_id,
            lines,
            final_receipt,
            inspection: InspectionStatus::Pending,
            discrepancy,
            received_at,
        }
    }

    pub fn id_typed(&self) -> ReceiptId {
        self.id
    }

    pub fn order_id(&self) -> PurchaseOrderId {
        self.order_id
    }

    pub fn lines(&self) -> &[ReceiptLine] {
        &self.lines
    }

    pub fn is_final(&self) -> bool {
        self.final_receipt
    }

    pub fn inspection(&self) -> InspectionStatus {
        self.inspection
    }

    pub fn discrepancy(&self) -> Option<DiscrepancyType> {
        self.discrepancy
    }

    pub fn has_discrepancy(&self) -> bool {
        self.discrepancy.is_some()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// A flagged receipt keeps the order from completing until a human
    /// passes inspection (fully or conditionally).
    pub fn blocks_completion(&self) -> bool {
        self.has_discrepancy()
            && !matches!(
                self.inspection,
                InspectionStatus::Passed | InspectionStatus::Conditional
            )
    }

    /// Record the human inspection decision. Only a pending inspection can
    /// be resolved; outcomes are immutable afterwards.
    pub fn resolve_inspection(&mut self, outcome: InspectionStatus) -> Result<(), DomainError> {
        if outcome == InspectionStatus::Pending {
            return Err(DomainError::validation(
                "inspection cannot be resolved back to pending",
            ));
        }
        if self.inspection != InspectionStatus::Pending {
            return Err(DomainError::conflict("inspection already resolved"));
        }
        self.inspection = outcome;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_receipt(discrepancy: Option<DiscrepancyType>) -> GoodsReceipt {
        GoodsReceipt::new(
            ReceiptId::new(AggregateId::new()),
            PurchaseOrderId::new(AggregateId::new()),
            vec![ReceiptLine {
                line_no: 1,
                quantity: 5,
                condition: LineCondition::Good,
            }],
            false,
            discrepancy,
            Utc::now(),
        )
    }

    #[test]
    fn clean_receipt_never_blocks_completion() {
        let receipt = test_receipt(None);
        assert!(!receipt.blocks_completion());
        assert_eq!(receipt.inspection(), InspectionStatus::Pending);
    }

    #[test]
    fn flagged_receipt_blocks_until_inspection_passes() {
        let mut receipt = test_receipt(Some(DiscrepancyType::Damaged));
        assert!(receipt.blocks_completion());

        receipt.resolve_inspection(InspectionStatus::Conditional).unwrap();
        assert!(!receipt.blocks_completion());
    }

    #[test]
    fn failed_inspection_keeps_blocking() {
        let mut receipt = test_receipt(Some(DiscrepancyType::WrongItem));
        receipt.resolve_inspection(InspectionStatus::Failed).unwrap();
        assert!(receipt.blocks_completion());
    }

    #[test]
    fn inspection_outcomes_are_immutable() {
        let mut receipt = test_receipt(Some(DiscrepancyType::ShortShipped));
        receipt.resolve_inspection(InspectionStatus::Passed).unwrap();

        let err = receipt
            .resolve_inspection(InspectionStatus::Failed)
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }
}

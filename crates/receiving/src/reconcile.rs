//! Receipt reconciliation: match received quantities against a purchase
//! order's open lines and derive the typed discrepancy, if any.

use procflow_core::DomainError;
use procflow_orders::{OrderLine, ReceivedQuantity};

use crate::receipt::{DiscrepancyType, LineCondition, ReceiptLine};

/// Per-line view of a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineDelta {
    pub line_no: u32,
    pub ordered: i64,
    pub previously_received: i64,
    pub received_now: i64,
    /// Quantity still open after this receipt.
    pub outstanding: i64,
}

/// Outcome of matching one receipt against an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Quantities in good condition, to be applied to the order.
    pub accepted: Vec<ReceivedQuantity>,
    pub deltas: Vec<LineDelta>,
    pub discrepancy: Option<DiscrepancyType>,
    /// All order lines fully received once `accepted` is applied.
    pub complete: bool,
}

/// Reconcile a receipt against the order's lines.
///
/// Pure function: validation errors reject the receipt before any state
/// changes anywhere. Rules:
/// - unknown line numbers and over-deliveries are rejected outright;
/// - only goods in `Good` condition count toward fulfilment;
/// - any wrong-item line flags `WrongItem`, else any damaged line flags
///   `Damaged`, else a shortfall on a final receipt flags `ShortShipped`;
/// - a non-final shortfall is not a discrepancy, the order simply stays
///   open for further receipts.
pub fn reconcile(
    order_lines: &[OrderLine],
    receipt_lines: &[ReceiptLine],
    final_receipt: bool,
) -> Result<Reconciliation, DomainError> {
    if receipt_lines.is_empty() {
        return Err(DomainError::validation("receipt has no lines"));
    }

    let mut deltas: Vec<LineDelta> = order_lines
        .iter()
        .map(|line| LineDelta {
            line_no: line.line_no,
            ordered: line.quantity,
            previously_received: line.received_quantity,
            received_now: 0,
            outstanding: line.outstanding(),
        })
        .collect();

    let mut saw_damaged = false;
    let mut saw_wrong_item = false;

    for received in receipt_lines {
        if received.quantity <= 0 {
            return Err(DomainError::validation("received quantity must be positive"));
        }
        let delta = deltas
            .iter_mut()
            .find(|d| d.line_no == received.line_no)
            .ok_or_else(|| {
                DomainError::validation("receipt references a line not on the order")
            })?;

        match received.condition {
            LineCondition::Good => {
                delta.received_now += received.quantity;
                delta.outstanding -= received.quantity;
                if delta.outstanding < 0 {
                    return Err(DomainError::validation(
                        "received quantity exceeds ordered quantity",
                    ));
                }
            }
            // Damaged/wrong goods do not fulfil the line; they go back to
            // the supplier and a human decides via inspection.
            LineCondition::Damaged => saw_damaged = true,
            LineCondition::WrongItem => saw_wrong_item = true,
        }
    }

    let complete = deltas.iter().all(|d| d.outstanding == 0);
    let discrepancy = if saw_wrong_item {
        Some(DiscrepancyType::WrongItem)
    } else if saw_damaged {
        Some(DiscrepancyType::Damaged)
    } else if final_receipt && !complete {
        Some(DiscrepancyType::ShortShipped)
    } else {
        None
    };

    let accepted = deltas
        .iter()
        .filter(|d| d.received_now > 0)
        .map(|d| ReceivedQuantity {
            line_no: d.line_no,
            quantity: d.received_now,
        })
        .collect();

    Ok(Reconciliation {
        accepted,
        deltas,
        discrepancy,
        complete,
    })
}

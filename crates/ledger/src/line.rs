use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use procflow_core::{AggregateId, DomainError, Entity};

/// Budget line identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BudgetLineId(pub AggregateId);

impl BudgetLineId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for BudgetLineId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Commitment identifier (ledger entry).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitmentId(pub AggregateId);

impl CommitmentId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for CommitmentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// What a budget line funds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum BudgetScope {
    Department(String),
    Project(String),
}

/// Utilization alert level, computed from `(committed + spent) / total`.
///
/// Thresholds: warning at 80%, critical at 95%, exceeded at 100%.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Normal,
    Warning,
    Critical,
    Exceeded,
}

impl AlertLevel {
    pub fn from_utilization_pct(pct: f64) -> Self {
        if pct >= 100.0 {
            AlertLevel::Exceeded
        } else if pct >= 95.0 {
            AlertLevel::Critical
        } else if pct >= 80.0 {
            AlertLevel::Warning
        } else {
            AlertLevel::Normal
        }
    }
}

/// The entity a commitment belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CommitmentOwner {
    Request(AggregateId),
    Order(AggregateId),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentState {
    Held,
    Released,
    Settled,
}

/// One ledger entry. Every money-affecting workflow transition creates,
/// releases or settles exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub id: CommitmentId,
    pub budget_line_id: BudgetLineId,
    pub amount: i64,
    pub state: CommitmentState,
    pub owner: CommitmentOwner,
}

/// Result of settling a commitment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// Amount moved from committed to spent.
    pub settled: i64,
    /// Residual (held − settled) returned to available.
    pub residual: i64,
}

/// Read-model of a budget line's balances, returned from every engine
/// operation that touches money.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub line_id: BudgetLineId,
    pub total: i64,
    pub committed: i64,
    pub spent: i64,
    pub available: i64,
    pub utilization_pct: f64,
    pub alert_level: AlertLevel,
}

/// A single budget line with its commitments.
///
/// Invariant: `committed + spent <= total` at all times, and
/// `available = total - committed - spent`. Balances are only mutated by
/// `commit` / `release` / `settle`; there are no balance setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLine {
    id: BudgetLineId,
    scope: BudgetScope,
    total: i64,
    committed: i64,
    spent: i64,
    commitments: HashMap<CommitmentId, Commitment>,
}

impl Entity for BudgetLine {
    type Id = BudgetLineId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl BudgetLine {
    pub fn open(id: BudgetLineId, scope: BudgetScope, total: i64) -> Result<Self, DomainError> {
        if total <= 0 {
            return Err(DomainError::validation("total budget must be positive"));
        }
        Ok(Self {
            id,
            scope,
            total,
            committed: 0,
            spent: 0,
            commitments: HashMap::new(),
        })
    }

    pub fn id_typed(&self) -> BudgetLineId {
        self.id
    }

    pub fn scope(&self) -> &BudgetScope {
        &self.scope
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn committed(&self) -> i64 {
        self.committed
    }

    pub fn spent(&self) -> i64 {
        self.spent
    }

    pub fn available(&self) -> i64 {
        self.total - self.committed - self.spent
    }

    pub fn utilization_pct(&self) -> f64 {
        ((self.committed + self.spent) as f64 / self.total as f64) * 100.0
    }

    pub fn commitment(&self, id: CommitmentId) -> Option<&Commitment> {
        self.commitments.get(&id)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let pct = self.utilization_pct();
        BudgetSnapshot {
            line_id: self.id,
            total: self.total,
            committed: self.committed,
            spent: self.spent,
            available: self.available(),
            utilization_pct: pct,
            alert_level: AlertLevel::from_utilization_pct(pct),
        }
    }

    /// Hold `amount` against this line.
    ///
    /// Fails with `InsufficientFunds` when `amount > available`; the line is
    /// left untouched on any error. Overcommitment is never silently allowed.
    pub fn commit(
        &mut self,
        id: CommitmentId,
        amount: i64,
        owner: CommitmentOwner,
    ) -> Result<CommitmentId, DomainError> {
        if amount <= 0 {
            return Err(DomainError::validation("commit amount must be positive"));
        }
        if self.commitments.contains_key(&id) {
            return Err(DomainError::conflict("commitment id already used"));
        }
        let available = self.available();
        if amount > available {
            return Err(DomainError::InsufficientFunds {
                requested: amount,
                available,
            });
        }

        self.committed += amount;
        self.commitments.insert(
            id,
            Commitment {
                id,
                budget_line_id: self.id,
                amount,
                state: CommitmentState::Held,
                owner,
            },
        );
        Ok(id)
    }

    /// Return a held amount to available.
    ///
    /// Releasing an already-released commitment is a no-op returning 0, so a
    /// second `cancel` of the owning entity has no budget effect. Releasing a
    /// settled commitment is a data-integrity error.
    pub fn release(&mut self, id: CommitmentId) -> Result<i64, DomainError> {
        let commitment = self
            .commitments
            .get_mut(&id)
            .ok_or(DomainError::UnknownCommitment(id.0))?;

        match commitment.state {
            CommitmentState::Released => Ok(0),
            CommitmentState::Settled => Err(DomainError::AlreadySettled(id.0)),
            CommitmentState::Held => {
                commitment.state = CommitmentState::Released;
                let held = commitment.amount;
                self.committed -= held;
                Ok(held)
            }
        }
    }

    /// Move `actual` from committed to spent and release the residual.
    ///
    /// `actual` must not exceed the held amount; the residual
    /// (held − actual) goes back to available. The sum
    /// committed + spent + available is unchanged by settlement.
    pub fn settle(&mut self, id: CommitmentId, actual: i64) -> Result<Settlement, DomainError> {
        let commitment = self
            .commitments
            .get_mut(&id)
            .ok_or(DomainError::UnknownCommitment(id.0))?;

        match commitment.state {
            CommitmentState::Settled => Err(DomainError::AlreadySettled(id.0)),
            CommitmentState::Released => Err(DomainError::invariant(
                "cannot settle a released commitment",
            )),
            CommitmentState::Held => {
                if actual < 0 {
                    return Err(DomainError::validation("settled amount must be >= 0"));
                }
                let held = commitment.amount;
                if actual > held {
                    return Err(DomainError::validation(format!(
                        "settled amount {actual} exceeds held amount {held}"
                    )));
                }

                commitment.state = CommitmentState::Settled;
                self.committed -= held;
                self.spent += actual;
                Ok(Settlement {
                    settled: actual,
                    residual: held - actual,
                })
            }
        }
    }

    /// Atomically swap one held commitment for a set of replacements.
    ///
    /// Either the release and every replacement commit succeed, or the line
    /// is left exactly as it was. Used when an RFQ award re-bases a request's
    /// estimate onto the awarded quote amounts.
    pub fn rebase(
        &mut self,
        id: CommitmentId,
        replacements: &[(CommitmentId, i64, CommitmentOwner)],
    ) -> Result<Vec<CommitmentId>, DomainError> {
        if replacements.is_empty() {
            return Err(DomainError::validation(
                "rebase requires at least one replacement",
            ));
        }

        let commitment = self
            .commitments
            .get(&id)
            .ok_or(DomainError::UnknownCommitment(id.0))?;
        let held = match commitment.state {
            CommitmentState::Held => commitment.amount,
            CommitmentState::Settled => return Err(DomainError::AlreadySettled(id.0)),
            CommitmentState::Released => {
                return Err(DomainError::invariant("cannot rebase a released commitment"));
            }
        };

        // Validate before mutating anything.
        let mut requested: i64 = 0;
        for (new_id, amount, _) in replacements {
            if *amount <= 0 {
                return Err(DomainError::validation("commit amount must be positive"));
            }
            if self.commitments.contains_key(new_id) {
                return Err(DomainError::conflict("commitment id already used"));
            }
            requested += amount;
        }
        let available_after_release = self.available() + held;
        if requested > available_after_release {
            return Err(DomainError::InsufficientFunds {
                requested,
                available: available_after_release,
            });
        }

        self.release(id)?;
        let mut ids = Vec::with_capacity(replacements.len());
        for (new_id, amount, owner) in replacements {
            ids.push(self.commit(*new_id, *amount, *owner)?);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procflow_core::AggregateId;
    use proptest::prelude::*;

    fn test_line(total: i64) -> BudgetLine {
        BudgetLine::open(
            BudgetLineId::new(AggregateId::new()),
            BudgetScope::Department("operations".to_string()),
            total,
        )
        .unwrap()
    }

    fn cid() -> CommitmentId {
        CommitmentId::new(AggregateId::new())
    }

    fn owner() -> CommitmentOwner {
        CommitmentOwner::Request(AggregateId::new())
    }

    #[test]
    fn commit_holds_funds_and_reduces_available() {
        let mut line = test_line(100_000);
        line.commit(cid(), 60_000, owner()).unwrap();

        assert_eq!(line.committed(), 60_000);
        assert_eq!(line.spent(), 0);
        assert_eq!(line.available(), 40_000);
    }

    #[test]
    fn overcommit_fails_and_leaves_line_unchanged() {
        let mut line = test_line(100_000);
        line.commit(cid(), 60_000, owner()).unwrap();

        let err = line.commit(cid(), 50_000, owner()).unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientFunds {
                requested: 50_000,
                available: 40_000
            }
        );
        assert_eq!(line.committed(), 60_000);
        assert_eq!(line.available(), 40_000);
    }

    #[test]
    fn settle_moves_actual_to_spent_and_releases_residual() {
        // The literal workflow scenario: approve 60k, complete at 55k.
        let mut line = test_line(100_000);
        let id = line.commit(cid(), 60_000, owner()).unwrap();

        let settlement = line.settle(id, 55_000).unwrap();
        assert_eq!(settlement.settled, 55_000);
        assert_eq!(settlement.residual, 5_000);
        assert_eq!(line.committed(), 0);
        assert_eq!(line.spent(), 55_000);
        assert_eq!(line.available(), 45_000);
    }

    #[test]
    fn double_settle_is_rejected() {
        let mut line = test_line(100_000);
        let id = line.commit(cid(), 10_000, owner()).unwrap();
        line.settle(id, 10_000).unwrap();

        let err = line.settle(id, 10_000).unwrap_err();
        assert!(matches!(err, DomainError::AlreadySettled(_)));
    }

    #[test]
    fn settle_unknown_commitment_is_rejected() {
        let mut line = test_line(100_000);
        let err = line.settle(cid(), 1_000).unwrap_err();
        assert!(matches!(err, DomainError::UnknownCommitment(_)));
    }

    #[test]
    fn release_is_idempotent() {
        let mut line = test_line(100_000);
        let id = line.commit(cid(), 30_000, owner()).unwrap();

        assert_eq!(line.release(id).unwrap(), 30_000);
        assert_eq!(line.available(), 100_000);
        // Second release: no-op, no budget effect.
        assert_eq!(line.release(id).unwrap(), 0);
        assert_eq!(line.available(), 100_000);
    }

    #[test]
    fn rebase_swaps_commitments_atomically() {
        let mut line = test_line(100_000);
        let id = line.commit(cid(), 60_000, owner()).unwrap();

        let replacements = vec![(cid(), 35_000, owner()), (cid(), 25_000, owner())];
        let ids = line.rebase(id, &replacements).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(line.committed(), 60_000);
        assert_eq!(line.available(), 40_000);
    }

    #[test]
    fn rebase_exceeding_funds_leaves_line_unchanged() {
        let mut line = test_line(100_000);
        let id = line.commit(cid(), 60_000, owner()).unwrap();

        let replacements = vec![(cid(), 90_000, owner()), (cid(), 20_000, owner())];
        let err = line.rebase(id, &replacements).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientFunds { .. }));
        assert_eq!(line.committed(), 60_000);
        assert_eq!(line.commitment(id).unwrap().state, CommitmentState::Held);
    }

    #[test]
    fn alert_level_follows_utilization_thresholds() {
        let mut line = test_line(100_000);
        assert_eq!(line.snapshot().alert_level, AlertLevel::Normal);

        line.commit(cid(), 80_000, owner()).unwrap();
        assert_eq!(line.snapshot().alert_level, AlertLevel::Warning);

        line.commit(cid(), 15_000, owner()).unwrap();
        assert_eq!(line.snapshot().alert_level, AlertLevel::Critical);

        line.commit(cid(), 5_000, owner()).unwrap();
        assert_eq!(line.snapshot().alert_level, AlertLevel::Exceeded);
    }

    /// Random operation against a line, used by the invariant property.
    #[derive(Debug, Clone)]
    enum Op {
        Commit(i64),
        Release(usize),
        Settle(usize, i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..50_000).prop_map(Op::Commit),
            (0usize..8).prop_map(Op::Release),
            ((0usize..8), (0i64..50_000)).prop_map(|(i, a)| Op::Settle(i, a)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: no sequence of ledger operations (including rejected
        /// ones) can violate `committed + spent <= total`, and `available`
        /// is always the exact remainder.
        #[test]
        fn balances_stay_consistent_under_any_op_sequence(
            ops in prop::collection::vec(op_strategy(), 1..40)
        ) {
            let total = 100_000;
            let mut line = test_line(total);
            let mut issued: Vec<CommitmentId> = Vec::new();

            for op in ops {
                match op {
                    Op::Commit(amount) => {
                        let id = cid();
                        if line.commit(id, amount, owner()).is_ok() {
                            issued.push(id);
                        }
                    }
                    Op::Release(i) => {
                        if let Some(id) = issued.get(i % issued.len().max(1)).copied() {
                            let _ = line.release(id);
                        }
                    }
                    Op::Settle(i, actual) => {
                        if let Some(id) = issued.get(i % issued.len().max(1)).copied() {
                            let _ = line.settle(id, actual);
                        }
                    }
                }

                prop_assert!(line.committed() >= 0);
                prop_assert!(line.spent() >= 0);
                prop_assert!(line.committed() + line.spent() <= total);
                prop_assert_eq!(
                    line.available(),
                    total - line.committed() - line.spent()
                );
            }
        }

        /// Property: settlement conserves the three-way total. For any held
        /// amount and any actual <= held, committed + spent + available is
        /// unchanged by settle.
        #[test]
        fn settlement_conserves_totals(held in 1i64..100_000, actual_frac in 0.0f64..=1.0) {
            let mut line = test_line(100_000);
            let id = line.commit(cid(), held, owner()).unwrap();
            let actual = (held as f64 * actual_frac) as i64;

            let before = line.committed() + line.spent() + line.available();
            let settlement = line.settle(id, actual).unwrap();
            let after = line.committed() + line.spent() + line.available();

            prop_assert_eq!(before, after);
            prop_assert_eq!(settlement.settled + settlement.residual, held);
            prop_assert_eq!(line.spent(), actual);
        }
    }
}

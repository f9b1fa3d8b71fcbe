use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use procflow_core::{AggregateId, DomainError};

use crate::line::{
    BudgetLine, BudgetLineId, BudgetScope, BudgetSnapshot, Commitment, CommitmentId,
    CommitmentOwner, Settlement,
};

/// Owned store of budget lines, keyed by line id.
///
/// Concurrency model: each line sits behind its own mutex, so operations on
/// a given line serialize (no lost updates on committed/available) while
/// operations on different lines proceed fully in parallel. Nothing inside
/// a critical section performs IO; audit/notification writes happen in the
/// engine after the lock is dropped.
#[derive(Debug, Default)]
pub struct BudgetLedger {
    lines: RwLock<HashMap<BudgetLineId, Arc<Mutex<BudgetLine>>>>,
    /// Commitment id -> owning line, so release/settle can route by
    /// commitment alone.
    index: RwLock<HashMap<CommitmentId, BudgetLineId>>,
}

impl BudgetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> DomainError {
        DomainError::conflict("ledger lock poisoned")
    }

    fn line_handle(&self, id: BudgetLineId) -> Result<Arc<Mutex<BudgetLine>>, DomainError> {
        let lines = self.lines.read().map_err(|_| Self::poisoned())?;
        lines.get(&id).cloned().ok_or(DomainError::NotFound)
    }

    fn commitment_line(&self, id: CommitmentId) -> Result<BudgetLineId, DomainError> {
        let index = self.index.read().map_err(|_| Self::poisoned())?;
        index
            .get(&id)
            .copied()
            .ok_or(DomainError::UnknownCommitment(id.0))
    }

    /// Open a new budget line. Fails with `Conflict` if the id is taken.
    pub fn open_line(
        &self,
        id: BudgetLineId,
        scope: BudgetScope,
        total: i64,
    ) -> Result<BudgetSnapshot, DomainError> {
        let line = BudgetLine::open(id, scope, total)?;
        let snapshot = line.snapshot();

        let mut lines = self.lines.write().map_err(|_| Self::poisoned())?;
        if lines.contains_key(&id) {
            return Err(DomainError::conflict("budget line already exists"));
        }
        lines.insert(id, Arc::new(Mutex::new(line)));
        Ok(snapshot)
    }

    pub fn snapshot(&self, id: BudgetLineId) -> Result<BudgetSnapshot, DomainError> {
        let handle = self.line_handle(id)?;
        let line = handle.lock().map_err(|_| Self::poisoned())?;
        Ok(line.snapshot())
    }

    /// Look up a commitment (state, amount, owner) by id.
    pub fn commitment(&self, id: CommitmentId) -> Result<Commitment, DomainError> {
        let line_id = self.commitment_line(id)?;
        let handle = self.line_handle(line_id)?;
        let line = handle.lock().map_err(|_| Self::poisoned())?;
        line.commitment(id)
            .cloned()
            .ok_or(DomainError::UnknownCommitment(id.0))
    }

    /// Hold `amount` against `line_id` on behalf of `owner`.
    pub fn commit(
        &self,
        line_id: BudgetLineId,
        amount: i64,
        owner: CommitmentOwner,
    ) -> Result<(CommitmentId, BudgetSnapshot), DomainError> {
        let handle = self.line_handle(line_id)?;
        let id = CommitmentId::new(AggregateId::new());

        let snapshot = {
            let mut line = handle.lock().map_err(|_| Self::poisoned())?;
            line.commit(id, amount, owner)?;
            line.snapshot()
        };

        let mut index = self.index.write().map_err(|_| Self::poisoned())?;
        index.insert(id, line_id);
        Ok((id, snapshot))
    }

    /// Return a held amount to available. Idempotent for released
    /// commitments (returns 0).
    pub fn release(&self, id: CommitmentId) -> Result<(i64, BudgetSnapshot), DomainError> {
        let line_id = self.commitment_line(id)?;
        let handle = self.line_handle(line_id)?;

        let mut line = handle.lock().map_err(|_| Self::poisoned())?;
        let released = line.release(id)?;
        Ok((released, line.snapshot()))
    }

    /// Settle a commitment at `actual`, releasing any residual.
    pub fn settle(
        &self,
        id: CommitmentId,
        actual: i64,
    ) -> Result<(Settlement, BudgetSnapshot), DomainError> {
        let line_id = self.commitment_line(id)?;
        let handle = self.line_handle(line_id)?;

        let mut line = handle.lock().map_err(|_| Self::poisoned())?;
        let settlement = line.settle(id, actual)?;
        Ok((settlement, line.snapshot()))
    }

    /// Atomically replace one held commitment with a set of new ones on the
    /// same line (all inside the line's critical section).
    pub fn rebase(
        &self,
        id: CommitmentId,
        replacements: &[(i64, CommitmentOwner)],
    ) -> Result<(Vec<CommitmentId>, BudgetSnapshot), DomainError> {
        let line_id = self.commitment_line(id)?;
        let handle = self.line_handle(line_id)?;

        let with_ids: Vec<(CommitmentId, i64, CommitmentOwner)> = replacements
            .iter()
            .map(|(amount, owner)| (CommitmentId::new(AggregateId::new()), *amount, *owner))
            .collect();

        let snapshot = {
            let mut line = handle.lock().map_err(|_| Self::poisoned())?;
            line.rebase(id, &with_ids)?;
            line.snapshot()
        };

        let mut index = self.index.write().map_err(|_| Self::poisoned())?;
        let ids: Vec<CommitmentId> = with_ids.iter().map(|(id, _, _)| *id).collect();
        for new_id in &ids {
            index.insert(*new_id, line_id);
        }
        Ok((ids, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn owner() -> CommitmentOwner {
        CommitmentOwner::Request(AggregateId::new())
    }

    fn open(ledger: &BudgetLedger, total: i64) -> BudgetLineId {
        let id = BudgetLineId::new(AggregateId::new());
        ledger
            .open_line(id, BudgetScope::Project("fleet-upgrade".to_string()), total)
            .unwrap();
        id
    }

    #[test]
    fn commit_then_settle_routes_by_commitment_id() {
        let ledger = BudgetLedger::new();
        let line_id = open(&ledger, 100_000);

        let (cid, snap) = ledger.commit(line_id, 60_000, owner()).unwrap();
        assert_eq!(snap.available, 40_000);

        let (settlement, snap) = ledger.settle(cid, 55_000).unwrap();
        assert_eq!(settlement.residual, 5_000);
        assert_eq!(snap.committed, 0);
        assert_eq!(snap.spent, 55_000);
        assert_eq!(snap.available, 45_000);
    }

    #[test]
    fn release_of_unknown_commitment_is_an_integrity_error() {
        let ledger = BudgetLedger::new();
        open(&ledger, 10_000);

        let err = ledger
            .release(CommitmentId::new(AggregateId::new()))
            .unwrap_err();
        assert!(matches!(err, DomainError::UnknownCommitment(_)));
    }

    #[test]
    fn concurrent_commits_never_overcommit_a_line() {
        // 8 threads race to commit 30k each against 90k: exactly 3 can win.
        let ledger = Arc::new(BudgetLedger::new());
        let line_id = open(&ledger, 90_000);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || ledger.commit(line_id, 30_000, owner()).is_ok())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 3);
        let snap = ledger.snapshot(line_id).unwrap();
        assert_eq!(snap.committed, 90_000);
        assert_eq!(snap.available, 0);
    }

    #[test]
    fn lines_operate_independently() {
        let ledger = BudgetLedger::new();
        let a = open(&ledger, 50_000);
        let b = open(&ledger, 50_000);

        ledger.commit(a, 50_000, owner()).unwrap();
        // Exhausting line A must not affect line B.
        let (_, snap) = ledger.commit(b, 10_000, owner()).unwrap();
        assert_eq!(snap.available, 40_000);
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use procflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, SupplierId};
use procflow_events::Event;

/// Days before `end_date` at which an active contract reads as
/// `expiring_soon`.
pub const EXPIRY_WARNING_DAYS: i64 = 30;

/// Contract identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractId(pub AggregateId);

impl ContractId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ContractId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractType {
    Purchase,
    Service,
    Framework,
}

/// Stored contract status. Time-derived states are deliberately absent;
/// see [`EffectiveStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Draft,
    Active,
    Suspended,
    Renewed,
    Cancelled,
}

impl ContractStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContractStatus::Draft => "draft",
            ContractStatus::Active => "active",
            ContractStatus::Suspended => "suspended",
            ContractStatus::Renewed => "renewed",
            ContractStatus::Cancelled => "cancelled",
        }
    }
}

/// Status as presented to readers: stored status plus the derived
/// `expiring_soon` / `expired` refinements of `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveStatus {
    Draft,
    Active,
    ExpiringSoon,
    Expired,
    Renewed,
    Cancelled,
    Suspended,
}

/// Pure derivation of the read-time status. Evaluated on read or by a
/// scheduled sweep; never stored.
pub fn effective_status(
    status: ContractStatus,
    end_date: DateTime<Utc>,
    now: DateTime<Utc>,
) -> EffectiveStatus {
    match status {
        ContractStatus::Draft => EffectiveStatus::Draft,
        ContractStatus::Suspended => EffectiveStatus::Suspended,
        ContractStatus::Renewed => EffectiveStatus::Renewed,
        ContractStatus::Cancelled => EffectiveStatus::Cancelled,
        ContractStatus::Active => {
            if end_date < now {
                EffectiveStatus::Expired
            } else if end_date - now <= Duration::days(EXPIRY_WARNING_DAYS) {
                EffectiveStatus::ExpiringSoon
            } else {
                EffectiveStatus::Active
            }
        }
    }
}

/// Aggregate root: Contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    id: ContractId,
    supplier_id: Option<SupplierId>,
    contract_type: ContractType,
    value: i64,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    total_spent: i64,
    status: ContractStatus,
    renewed_to: Option<ContractId>,
    version: u64,
    created: bool,
}

impl Contract {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: ContractId) -> Self {
        Self {
            id,
            supplier_id: None,
            contract_type: ContractType::Purchase,
            value: 0,
            start_date: None,
            end_date: None,
            total_spent: 0,
            status: ContractStatus::Draft,
            renewed_to: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ContractId {
        self.id
    }

    pub fn supplier_id(&self) -> Option<SupplierId> {
        self.supplier_id
    }

    pub fn contract_type(&self) -> ContractType {
        self.contract_type
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn total_spent(&self) -> i64 {
        self.total_spent
    }

    pub fn status(&self) -> ContractStatus {
        self.status
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date
    }

    pub fn renewed_to(&self) -> Option<ContractId> {
        self.renewed_to
    }

    /// Utilization of the contract ceiling, in percent. Can exceed 100 when
    /// completed orders overrun the contracted value.
    pub fn utilization_pct(&self) -> f64 {
        if self.value == 0 {
            0.0
        } else {
            (self.total_spent as f64 / self.value as f64) * 100.0
        }
    }

    /// Read-time status including the derived expiry states.
    pub fn effective_status(&self, now: DateTime<Utc>) -> EffectiveStatus {
        match self.end_date {
            Some(end) => effective_status(self.status, end, now),
            None => EffectiveStatus::Draft,
        }
    }
}

impl AggregateRoot for Contract {
    type Id = ContractId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateContract (starts in `Draft`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateContract {
    pub contract_id: ContractId,
    pub supplier_id: SupplierId,
    pub contract_type: ContractType,
    pub value: i64,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ActivateContract (draft | suspended -> active).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateContract {
    pub contract_id: ContractId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SuspendContract (active -> suspended).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendContract {
    pub contract_id: ContractId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelContract (idempotent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelContract {
    pub contract_id: ContractId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RenewContract (active -> renewed).
///
/// Carries the successor's id and window; the engine creates the successor
/// as a fresh draft contract chained to this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewContract {
    pub contract_id: ContractId,
    pub successor_id: ContractId,
    pub new_start_date: DateTime<Utc>,
    pub new_end_date: DateTime<Utc>,
    pub new_value: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordOrderSpend.
///
/// Invoked only when a purchase order referencing this contract completes.
/// Historical spend is immutable: `total_spent` never decreases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOrderSpend {
    pub contract_id: ContractId,
    pub order_id: AggregateId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractCommand {
    CreateContract(CreateContract),
    ActivateContract(ActivateContract),
    SuspendContract(SuspendContract),
    CancelContract(CancelContract),
    RenewContract(RenewContract),
    RecordOrderSpend(RecordOrderSpend),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCreated {
    pub contract_id: ContractId,
    pub supplier_id: SupplierId,
    pub contract_type: ContractType,
    pub value: i64,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractActivated {
    pub contract_id: ContractId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSuspended {
    pub contract_id: ContractId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCancelled {
    pub contract_id: ContractId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRenewed {
    pub contract_id: ContractId,
    pub successor_id: ContractId,
    pub new_start_date: DateTime<Utc>,
    pub new_end_date: DateTime<Utc>,
    pub new_value: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpendRecorded {
    pub contract_id: ContractId,
    pub order_id: AggregateId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractEvent {
    ContractCreated(ContractCreated),
    ContractActivated(ContractActivated),
    ContractSuspended(ContractSuspended),
    ContractCancelled(ContractCancelled),
    ContractRenewed(ContractRenewed),
    OrderSpendRecorded(OrderSpendRecorded),
}

impl Event for ContractEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ContractEvent::ContractCreated(_) => "contracts.contract.created",
            ContractEvent::ContractActivated(_) => "contracts.contract.activated",
            ContractEvent::ContractSuspended(_) => "contracts.contract.suspended",
            ContractEvent::ContractCancelled(_) => "contracts.contract.cancelled",
            ContractEvent::ContractRenewed(_) => "contracts.contract.renewed",
            ContractEvent::OrderSpendRecorded(_) => "contracts.contract.order_spend_recorded",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ContractEvent::ContractCreated(e) => e.occurred_at,
            ContractEvent::ContractActivated(e) => e.occurred_at,
            ContractEvent::ContractSuspended(e) => e.occurred_at,
            ContractEvent::ContractCancelled(e) => e.occurred_at,
            ContractEvent::ContractRenewed(e) => e.occurred_at,
            ContractEvent::OrderSpendRecorded(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Contract {
    type Command = ContractCommand;
    type Event = ContractEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ContractEvent::ContractCreated(e) => {
                self.id = e.contract_id;
                self.supplier_id = Some(e.supplier_id);
                self.contract_type = e.contract_type;
                self.value = e.value;
                self.start_date = Some(e.start_date);
                self.end_date = Some(e.end_date);
                self.status = ContractStatus::Draft;
                self.created = true;
            }
            ContractEvent::ContractActivated(_) => {
                self.status = ContractStatus::Active;
            }
            ContractEvent::ContractSuspended(_) => {
                self.status = ContractStatus::Suspended;
            }
            ContractEvent::ContractCancelled(_) => {
                self.status = ContractStatus::Cancelled;
            }
            ContractEvent::ContractRenewed(e) => {
                self.status = ContractStatus::Renewed;
                self.renewed_to = Some(e.successor_id);
            }
            ContractEvent::OrderSpendRecorded(e) => {
                self.total_spent += e.amount;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ContractCommand::CreateContract(cmd) => self.handle_create(cmd),
            ContractCommand::ActivateContract(cmd) => self.handle_activate(cmd),
            ContractCommand::SuspendContract(cmd) => self.handle_suspend(cmd),
            ContractCommand::CancelContract(cmd) => self.handle_cancel(cmd),
            ContractCommand::RenewContract(cmd) => self.handle_renew(cmd),
            ContractCommand::RecordOrderSpend(cmd) => self.handle_record_spend(cmd),
        }
    }
}

impl Contract {
    fn ensure_exists(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateContract) -> Result<Vec<ContractEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("contract already exists"));
        }
        if cmd.value <= 0 {
            return Err(DomainError::validation("contract value must be positive"));
        }
        if cmd.end_date <= cmd.start_date {
            return Err(DomainError::validation("end date must be after start date"));
        }

        Ok(vec![ContractEvent::ContractCreated(ContractCreated {
            contract_id: cmd.contract_id,
            supplier_id: cmd.supplier_id,
            contract_type: cmd.contract_type,
            value: cmd.value,
            start_date: cmd.start_date,
            end_date: cmd.end_date,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_activate(&self, cmd: &ActivateContract) -> Result<Vec<ContractEvent>, DomainError> {
        self.ensure_exists()?;
        match self.status {
            ContractStatus::Draft | ContractStatus::Suspended => {
                Ok(vec![ContractEvent::ContractActivated(ContractActivated {
                    contract_id: cmd.contract_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
            other => Err(DomainError::invalid_transition(other.as_str(), "active")),
        }
    }

    fn handle_suspend(&self, cmd: &SuspendContract) -> Result<Vec<ContractEvent>, DomainError> {
        self.ensure_exists()?;
        if self.status != ContractStatus::Active {
            return Err(DomainError::invalid_transition(
                self.status.as_str(),
                "suspended",
            ));
        }

        Ok(vec![ContractEvent::ContractSuspended(ContractSuspended {
            contract_id: cmd.contract_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelContract) -> Result<Vec<ContractEvent>, DomainError> {
        self.ensure_exists()?;
        match self.status {
            ContractStatus::Cancelled => Ok(vec![]),
            ContractStatus::Renewed => {
                Err(DomainError::invalid_transition("renewed", "cancelled"))
            }
            _ => Ok(vec![ContractEvent::ContractCancelled(ContractCancelled {
                contract_id: cmd.contract_id,
                occurred_at: cmd.occurred_at,
            })]),
        }
    }

    fn handle_renew(&self, cmd: &RenewContract) -> Result<Vec<ContractEvent>, DomainError> {
        self.ensure_exists()?;
        if self.status != ContractStatus::Active {
            return Err(DomainError::invalid_transition(
                self.status.as_str(),
                "renewed",
            ));
        }
        if cmd.new_value <= 0 {
            return Err(DomainError::validation("contract value must be positive"));
        }
        if cmd.new_end_date <= cmd.new_start_date {
            return Err(DomainError::validation("end date must be after start date"));
        }

        Ok(vec![ContractEvent::ContractRenewed(ContractRenewed {
            contract_id: cmd.contract_id,
            successor_id: cmd.successor_id,
            new_start_date: cmd.new_start_date,
            new_end_date: cmd.new_end_date,
            new_value: cmd.new_value,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_spend(
        &self,
        cmd: &RecordOrderSpend,
    ) -> Result<Vec<ContractEvent>, DomainError> {
        self.ensure_exists()?;
        if self.status != ContractStatus::Active {
            return Err(DomainError::invariant(
                "order spend can only accrue against an active contract",
            ));
        }
        if cmd.amount <= 0 {
            return Err(DomainError::validation("spend amount must be positive"));
        }

        Ok(vec![ContractEvent::OrderSpendRecorded(OrderSpendRecorded {
            contract_id: cmd.contract_id,
            order_id: cmd.order_id,
            amount: cmd.amount,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procflow_events::execute;

    fn test_contract_id() -> ContractId {
        ContractId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn active_contract(value: i64, end_in_days: i64) -> Contract {
        let id = test_contract_id();
        let mut contract = Contract::empty(id);
        let now = test_time();
        for cmd in [
            ContractCommand::CreateContract(CreateContract {
                contract_id: id,
                supplier_id: SupplierId::new(),
                contract_type: ContractType::Framework,
                value,
                start_date: now,
                end_date: now + Duration::days(end_in_days),
                occurred_at: now,
            }),
            ContractCommand::ActivateContract(ActivateContract {
                contract_id: id,
                occurred_at: now,
            }),
        ] {
            execute(&mut contract, &cmd).unwrap();
        }
        contract
    }

    #[test]
    fn expiry_states_are_derived_not_stored() {
        let contract = active_contract(500_000, 365);
        let end = contract.end_date().unwrap();

        assert_eq!(
            contract.effective_status(end - Duration::days(90)),
            EffectiveStatus::Active
        );
        assert_eq!(
            contract.effective_status(end - Duration::days(30)),
            EffectiveStatus::ExpiringSoon
        );
        assert_eq!(
            contract.effective_status(end + Duration::days(1)),
            EffectiveStatus::Expired
        );
        // The stored status never changed.
        assert_eq!(contract.status(), ContractStatus::Active);
    }

    #[test]
    fn spend_accrues_monotonically() {
        let mut contract = active_contract(100_000, 365);
        let id = contract.id_typed();

        for amount in [30_000, 25_000] {
            execute(
                &mut contract,
                &ContractCommand::RecordOrderSpend(RecordOrderSpend {
                    contract_id: id,
                    order_id: AggregateId::new(),
                    amount,
                    occurred_at: test_time(),
                }),
            )
            .unwrap();
        }

        assert_eq!(contract.total_spent(), 55_000);
        assert!((contract.utilization_pct() - 55.0).abs() < f64::EPSILON);

        // Negative adjustments are impossible by construction.
        let err = execute(
            &mut contract,
            &ContractCommand::RecordOrderSpend(RecordOrderSpend {
                contract_id: id,
                order_id: AggregateId::new(),
                amount: -1,
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn spend_against_a_draft_contract_is_rejected() {
        let id = test_contract_id();
        let mut contract = Contract::empty(id);
        let now = test_time();
        execute(
            &mut contract,
            &ContractCommand::CreateContract(CreateContract {
                contract_id: id,
                supplier_id: SupplierId::new(),
                contract_type: ContractType::Service,
                value: 10_000,
                start_date: now,
                end_date: now + Duration::days(30),
                occurred_at: now,
            }),
        )
        .unwrap();

        let err = execute(
            &mut contract,
            &ContractCommand::RecordOrderSpend(RecordOrderSpend {
                contract_id: id,
                order_id: AggregateId::new(),
                amount: 1_000,
                occurred_at: now,
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn renewal_chains_to_a_successor() {
        let mut contract = active_contract(100_000, 40);
        let id = contract.id_typed();
        let successor_id = test_contract_id();
        let now = test_time();

        execute(
            &mut contract,
            &ContractCommand::RenewContract(RenewContract {
                contract_id: id,
                successor_id,
                new_start_date: now + Duration::days(40),
                new_end_date: now + Duration::days(405),
                new_value: 120_000,
                occurred_at: now,
            }),
        )
        .unwrap();

        assert_eq!(contract.status(), ContractStatus::Renewed);
        assert_eq!(contract.renewed_to(), Some(successor_id));
        assert_eq!(contract.effective_status(now), EffectiveStatus::Renewed);
    }
}

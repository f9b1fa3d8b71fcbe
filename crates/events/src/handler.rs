use procflow_core::Aggregate;

/// Execute an aggregate command deterministically (no IO, no async).
///
/// The canonical lifecycle in one step:
///
/// 1. **Decide**: calls `aggregate.handle(command)` to get events (pure).
/// 2. **Evolve**: applies each event via `aggregate.apply(event)`.
///
/// On error no events are applied, so the aggregate is untouched. The
/// aggregate maintains its own version tracking during `apply()`.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}

/// Execute an aggregate command in place (no IO, no persistence).
///
/// Decide with `handle`, then evolve with `apply` for every returned event.
/// On error the aggregate is left untouched. The persisted pipeline lives in
/// `creditunion-infra`'s `CommandDispatcher`; this is the same lifecycle
/// without a store, used by domain tests and replay tooling.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: creditunion_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}

//! Command execution pipeline for union aggregates.
//!
//! ```text
//! load stream → rehydrate → handle (decide) → [caller side effect] → append → publish
//! ```
//!
//! `decide` and `commit` are split so the service can run a custody transfer
//! between them while it holds the union's lock. `dispatch` runs both back to
//! back for commands without side effects.
//!
//! Appends use `ExpectedVersion::Exact` of the revision that was decided on,
//! so a concurrent writer to the same stream turns into a `Concurrency` error
//! instead of a lost update. Publishing happens only after a successful
//! append; a failed publish is logged and never undoes the commit.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use creditunion_core::{Aggregate, DomainError, ExpectedVersion, UnionId};
use creditunion_events::{Event, EventBus, EventEnvelope};

use crate::custody::CustodyError;
use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// A precondition of the operation was violated.
    #[error(transparent)]
    Domain(DomainError),
    /// Optimistic concurrency failure (stale stream revision).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    /// A stored payload could not be read back as a domain event.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),
    /// The loaded stream is out of order or belongs to another union.
    #[error("stream integrity violation: {0}")]
    Integrity(String),
    #[error(transparent)]
    Store(EventStoreError),
    #[error(transparent)]
    Custody(#[from] CustodyError),
}

impl DispatchError {
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            DispatchError::Domain(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DispatchError::Concurrency(_))
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Domain(other),
        }
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

/// Outcome of the decide step: the rehydrated aggregate, the revision it was
/// read at, and the events the command produced (not yet persisted).
///
/// A decision is only valid against the revision it was read at. Committing
/// it after another writer appended to the stream fails with
/// `DispatchError::Concurrency`; the caller must decide again.
///
/// An empty `events` list commits as a no-op.
#[derive(Debug)]
pub struct Decision<A: Aggregate> {
    pub aggregate: A,
    pub expected: ExpectedVersion,
    pub events: Vec<A::Event>,
}

/// Command execution engine for union aggregates.
///
/// Sits between `CreditUnionService` and the infrastructure traits. The
/// service owns locking and custody; the dispatcher owns the event-sourcing
/// mechanics.
///
/// ## Execution Guarantees
///
/// - **Persist before publish**: if the append fails, nothing is published
/// - **No lost updates**: appends carry `ExpectedVersion::Exact` of the
///   decided revision
/// - **One stream per command**: a command reads and writes a single union
/// - **Verified history**: a loaded stream must belong to the requested union
///   and be strictly ordered, or loading fails with `Integrity`
///
/// ## Error Semantics
///
/// - **Domain errors**: precondition failures → `DispatchError::Domain`
/// - **Concurrency errors**: stale revision → `DispatchError::Concurrency`
///   (retried by `dispatch` up to the given limit)
/// - **Store errors**: `DispatchError::Store`; nothing was written
/// - **Corrupt history**: `DispatchError::Deserialize` / `Integrity`
///
/// ## Publication
///
/// Committed events are published once, after the append. A publish failure
/// is logged with `warn!` and does not fail the command: the stream is the
/// source of truth and subscribers can catch up from it.
///
/// ## Generic Parameters
///
/// - `S`: event store (`InMemoryEventStore` in tests and the node binary)
/// - `B`: notification bus carrying JSON envelopes
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
    aggregate_type: &'static str,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B, aggregate_type: &'static str) -> Self {
        Self {
            store,
            bus,
            aggregate_type,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Load and rehydrate an aggregate. Returns it with its stream revision.
    pub fn load<A>(
        &self,
        union_id: UnionId,
        make_aggregate: impl FnOnce(UnionId) -> A,
    ) -> Result<(A, u64), DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(union_id)?;
        validate_loaded_stream(union_id, &history)?;

        let mut aggregate = make_aggregate(union_id);
        for stored in &history {
            let ev: A::Event = serde_json::from_value(stored.payload.clone())
                .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
            aggregate.apply(&ev);
        }

        let revision = history.last().map(|e| e.sequence_number).unwrap_or(0);
        debug!(union_id = %union_id, revision, "rehydrated union");
        Ok((aggregate, revision))
    }

    /// Rehydrate and run the command's decision logic. Nothing is written.
    pub fn decide<A>(
        &self,
        union_id: UnionId,
        command: &A::Command,
        make_aggregate: impl FnOnce(UnionId) -> A,
    ) -> Result<Decision<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: DeserializeOwned,
    {
        let (aggregate, revision) = self.load(union_id, make_aggregate)?;
        let events = aggregate.handle(command)?;
        Ok(Decision {
            aggregate,
            expected: ExpectedVersion::Exact(revision),
            events,
        })
    }

    /// Append the decided events, then publish them.
    pub fn commit<A>(
        &self,
        union_id: UnionId,
        decision: &Decision<A>,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate,
        A::Event: Event + Serialize,
    {
        if decision.events.is_empty() {
            return Ok(vec![]);
        }

        let uncommitted = decision
            .events
            .iter()
            .map(|ev| UncommittedEvent::from_typed(union_id, self.aggregate_type, Uuid::now_v7(), ev))
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, decision.expected)?;
        self.publish(&committed);
        Ok(committed)
    }

    /// Decide + commit, re-running the whole transaction on a lost race.
    ///
    /// ## Return Value
    ///
    /// The committed `StoredEvent`s with their assigned sequence numbers.
    /// After `max_conflict_retries` lost races the last `Concurrency` error
    /// is returned.
    pub fn dispatch<A>(
        &self,
        union_id: UnionId,
        command: A::Command,
        make_aggregate: impl Fn(UnionId) -> A,
        max_conflict_retries: u32,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: Event + Serialize + DeserializeOwned,
    {
        let mut attempt = 0;
        loop {
            let decision = self.decide(union_id, &command, &make_aggregate)?;
            match self.commit(union_id, &decision) {
                Err(e) if e.is_conflict() && attempt < max_conflict_retries => {
                    attempt += 1;
                    warn!(union_id = %union_id, attempt, "append conflict, retrying");
                }
                other => return other,
            }
        }
    }

    fn publish(&self, committed: &[StoredEvent]) {
        for stored in committed {
            if let Err(e) = self.bus.publish(stored.to_envelope()) {
                warn!(
                    union_id = %stored.union_id,
                    event_type = %stored.event_type,
                    sequence_number = stored.sequence_number,
                    error = ?e,
                    "failed to publish committed event"
                );
            }
        }
    }
}

fn validate_loaded_stream(union_id: UnionId, stream: &[StoredEvent]) -> Result<(), DispatchError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.union_id != union_id {
            return Err(DispatchError::Integrity(format!(
                "loaded stream contains wrong union_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Integrity(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use creditunion_core::{AggregateRoot, MemberId};
    use creditunion_events::InMemoryEventBus;
    use creditunion_ledger::{
        AGGREGATE_TYPE, AssetType, CreateUnion, CreditUnion, JoinUnion, PoolId, UnionCommand,
    };

    use crate::event_store::InMemoryEventStore;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    fn setup() -> (CommandDispatcher<Arc<InMemoryEventStore>, Bus>, Bus) {
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let dispatcher =
            CommandDispatcher::new(Arc::new(InMemoryEventStore::new()), bus.clone(), AGGREGATE_TYPE);
        (dispatcher, bus)
    }

    fn create(union_id: UnionId) -> UnionCommand {
        UnionCommand::CreateUnion(CreateUnion {
            union_id,
            creator: MemberId::new(),
            name: "Harbor Credit".to_string(),
            asset: AssetType::new("CU"),
            min_interest_rate: 1,
            max_interest_rate: 10,
            pool: PoolId::new(),
            occurred_at: Utc::now(),
        })
    }

    fn join(union_id: UnionId, member: MemberId) -> UnionCommand {
        UnionCommand::JoinUnion(JoinUnion {
            union_id,
            member,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn dispatch_persists_and_publishes() {
        let (dispatcher, bus) = setup();
        let sub = bus.subscribe();
        let union_id = UnionId::new();

        let stored = dispatcher
            .dispatch(union_id, create(union_id), CreditUnion::empty, 0)
            .unwrap();

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event_type, "creditunion.union.created");
        let published = sub.drain();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].sequence_number(), 1);
        assert_eq!(published[0].union_id(), union_id);
    }

    #[test]
    fn rejected_commands_write_and_publish_nothing() {
        let (dispatcher, bus) = setup();
        let sub = bus.subscribe();
        let union_id = UnionId::new();

        let err = dispatcher
            .dispatch(union_id, join(union_id, MemberId::new()), CreditUnion::empty, 0)
            .unwrap_err();

        assert!(matches!(err, DispatchError::Domain(DomainError::NotInitialized)));
        assert!(dispatcher.store().load_stream(union_id).unwrap().is_empty());
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn stale_decision_is_a_conflict() {
        let (dispatcher, _bus) = setup();
        let union_id = UnionId::new();
        dispatcher
            .dispatch(union_id, create(union_id), CreditUnion::empty, 0)
            .unwrap();

        let stale = dispatcher
            .decide(union_id, &join(union_id, MemberId::new()), CreditUnion::empty)
            .unwrap();
        dispatcher
            .dispatch(union_id, join(union_id, MemberId::new()), CreditUnion::empty, 0)
            .unwrap();

        let err = dispatcher.commit(union_id, &stale).unwrap_err();
        assert!(err.is_conflict());
    }

    /// Bus that refuses every publication.
    struct ClosedBus;

    impl EventBus<EventEnvelope<JsonValue>> for ClosedBus {
        type Error = &'static str;

        fn publish(&self, _message: EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
            Err("bus closed")
        }

        fn subscribe(&self) -> creditunion_events::Subscription<EventEnvelope<JsonValue>> {
            creditunion_events::Subscription::new(std::sync::mpsc::channel().1)
        }
    }

    #[test]
    fn publish_failure_keeps_the_commit() {
        let dispatcher = CommandDispatcher::new(InMemoryEventStore::new(), ClosedBus, AGGREGATE_TYPE);
        let union_id = UnionId::new();

        let stored = dispatcher
            .dispatch(union_id, create(union_id), CreditUnion::empty, 0)
            .unwrap();

        assert_eq!(stored.len(), 1);
        assert_eq!(dispatcher.store().load_stream(union_id).unwrap(), stored);
    }

    #[test]
    fn load_replays_the_stream() {
        let (dispatcher, _bus) = setup();
        let union_id = UnionId::new();
        let member = MemberId::new();
        dispatcher
            .dispatch(union_id, create(union_id), CreditUnion::empty, 0)
            .unwrap();
        dispatcher
            .dispatch(union_id, join(union_id, member), CreditUnion::empty, 0)
            .unwrap();

        let (union, revision) = dispatcher.load(union_id, CreditUnion::empty).unwrap();
        assert_eq!(revision, 2);
        assert_eq!(union.version(), 2);
        assert!(union.is_member(member));
    }
}

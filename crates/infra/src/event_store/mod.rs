//! Append-only event store boundary.
//!
//! One stream per credit union. The store is the source of truth; published
//! notifications are derived from what it commits.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

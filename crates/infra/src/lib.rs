//! Infrastructure layer: event store, custody, clock, config, and the
//! service that wires them to the ledger.

pub mod clock;
pub mod command_dispatcher;
pub mod config;
pub mod custody;
pub mod event_store;
pub mod service;


pub use clock::{Clock, FixedClock, SystemClock};
pub use command_dispatcher::{CommandDispatcher, Decision, DispatchError};
pub use config::ServiceConfig;
pub use custody::{AssetCustody, CustodyError, InMemoryCustody, Refused, Value};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent};
pub use service::CreditUnionService;

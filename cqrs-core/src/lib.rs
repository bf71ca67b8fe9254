//! # cqrs-core
//!
//! A CQRS and event-sourcing runtime: aggregates, command/query dispatchers,
//! an event bus, projections, and pluggable stores.
//!
//! ## Core Concepts
//!
//! - **[`Aggregate`]**: a consistency boundary that handles commands and
//!   mutates its state only through [`Event`] payloads.
//! - **[`EventMessage`]**: the immutable, stamped envelope around one event
//!   payload.
//! - **[`store::event_store::EventStore`]** / **[`store::snapshot_store::SnapshotStore`]**
//!   / **[`store::state_store::StateStore`]** / **[`store::read_model_store::ReadModelStore`]**:
//!   the pluggable persistence traits.
//! - **[`repository::Repository`]**: loads and saves aggregates, choosing
//!   between event-sourced, state-based, or hybrid persistence via
//!   [`storage_strategy::ConfigurableRepositoryFactory`].
//! - **[`dispatch::command_dispatcher::CommandDispatcher`]** /
//!   **[`dispatch::query_dispatcher::QueryDispatcher`]**: route a
//!   [`command::Command`] / [`query::Query`] to its registered handler.
//! - **[`bus::EventBus`]**: publishes events to subscribers, with retry and
//!   backoff.
//! - **[`projection::ProjectionManager`]**: drives read-model builders off
//!   the event stream.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cqrs_core::aggregate::{Aggregate, AggregateRoot, Snapshot};
//! use cqrs_core::event::{Event, EventMessage};
//! use cqrs_core::repository::{EventSourcedRepository, Repository};
//! use cqrs_core::store::in_memory::InMemoryEventStore;
//! use cqrs_core::store::in_memory_snapshot::InMemorySnapshotStore;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
//! pub enum BankAccountEvent {
//!     Opened { initial_balance: u64 },
//!     Credited { amount: u64 },
//! }
//! impl Event for BankAccountEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             BankAccountEvent::Opened { .. } => "Opened",
//!             BankAccountEvent::Credited { .. } => "Credited",
//!         }
//!     }
//!     fn event_version(&self) -> u16 { 1 }
//!     fn event_source(&self) -> &'static str { "urn:cqrs-core:bank" }
//! }
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! pub struct BankAccountSnapshot { balance: u64 }
//! impl Snapshot for BankAccountSnapshot {}
//!
//! #[derive(Debug)]
//! pub enum BankAccountCommand {
//!     Open { initial_balance: u64 },
//!     Credit { amount: u64 },
//! }
//!
//! #[derive(Debug, Default)]
//! pub struct BankAccount {
//!     root: Option<AggregateRoot<Uuid, BankAccountEvent>>,
//!     balance: u64,
//! }
//!
//! impl BankAccount {
//!     fn root_or_init(&mut self) -> &mut AggregateRoot<Uuid, BankAccountEvent> {
//!         self.root.get_or_insert_with(|| AggregateRoot::new(Uuid::new_v4(), Self::AGGREGATE_TYPE))
//!     }
//! }
//!
//! #[cqrs_core::async_trait]
//! impl Aggregate for BankAccount {
//!     type Id = Uuid;
//!     type Event = BankAccountEvent;
//!     type Command = BankAccountCommand;
//!     type Snapshot = BankAccountSnapshot;
//!     type Error = std::convert::Infallible;
//!     const AGGREGATE_TYPE: &'static str = "BankAccount";
//!
//!     fn root(&self) -> &AggregateRoot<Self::Id, Self::Event> {
//!         self.root.as_ref().expect("root initialized before use")
//!     }
//!     fn root_mut(&mut self) -> &mut AggregateRoot<Self::Id, Self::Event> {
//!         self.root_or_init()
//!     }
//!
//!     fn mutate(&mut self, event: &Self::Event) {
//!         match event {
//!             BankAccountEvent::Opened { initial_balance } => self.balance = *initial_balance,
//!             BankAccountEvent::Credited { amount } => self.balance += *amount,
//!         }
//!     }
//!
//!     async fn handle(&self, command: Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
//!         Ok(match command {
//!             BankAccountCommand::Open { initial_balance } => {
//!                 vec![BankAccountEvent::Opened { initial_balance }]
//!             }
//!             BankAccountCommand::Credit { amount } => vec![BankAccountEvent::Credited { amount }],
//!         })
//!     }
//!
//!     fn from_snapshot(id: Self::Id, snapshot: Self::Snapshot) -> Self {
//!         Self {
//!             root: Some(AggregateRoot::new(id, Self::AGGREGATE_TYPE)),
//!             balance: snapshot.balance,
//!         }
//!     }
//!
//!     fn snapshot(&self) -> Self::Snapshot {
//!         BankAccountSnapshot { balance: self.balance }
//!     }
//! }
//!
//! async fn bank_account_example() -> cqrs_core::error::Result<()> {
//!     let event_store = Arc::new(InMemoryEventStore::<BankAccount>::default());
//!     let snapshot_store = Arc::new(InMemorySnapshotStore::<BankAccount>::default());
//!     let repo = EventSourcedRepository::new(event_store, Some(snapshot_store));
//!
//!     let mut account = BankAccount::default();
//!     account.apply(BankAccountEvent::Opened { initial_balance: 100 });
//!     repo.save(&mut account).await?;
//!
//!     let loaded = repo.get_by_id(account.id()).await?;
//!     assert_eq!(loaded.balance, 100);
//!     Ok(())
//! }
//! ```
#![deny(missing_docs)]

pub use async_trait::async_trait;

/// The aggregate lifecycle: identity, versioning, the change buffer, and the
/// apply/replay/load-from-history contract.
pub mod aggregate;
/// The event bus: subscriptions, publish with retry/backoff, and metrics.
pub mod bus;
/// CloudEvents conversion for event payloads.
pub mod cloudevent;
/// Command envelopes, validation, and results.
pub mod command;
/// Command and query dispatchers.
pub mod dispatch;
/// The error taxonomy shared by every component in this crate.
pub mod error;
/// The event envelope and domain-event extension.
pub mod event;
/// Distributed locking, used by the state store's write path.
pub mod lock;
/// Read-model projections and their lifecycle manager.
pub mod projection;
/// Query envelopes, pagination, sorting, and results.
pub mod query;
/// The event-data registry, mapping event-type strings to concrete payloads.
pub mod registry;
/// Repositories: event-sourced, state-based, and hybrid persistence.
pub mod repository;
/// Canonical JSON (de)serialization for events and read models.
pub mod serialization;
/// Per-aggregate-type storage strategy selection and repository factories.
pub mod storage_strategy;
/// The pluggable store traits (event, snapshot, state, read-model) and their
/// backend implementations.
pub mod store;
/// Event schema upcasting.
pub mod upcaster;

pub use aggregate::{Aggregate, AggregateId, AggregateRoot, Snapshot};
pub use cloudevent::CloudEvent;
pub use error::{Error, ErrorCode, Result};
pub use event::{Event, EventMessage, EventMessageOptions};

//! # todo-core: replicated to-do list
//!
//! Client-side half of the to-do demo: a replica of the shared object
//! space, a store exposing Flux-style commands over it, and the change
//! notification path back to views.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  Command   ┌────────────┐  yrs txn  ┌────────────┐
//! │ Dispatcher │ ─────────► │ TodoStore  │ ────────► │  Replica   │
//! └────────────┘            └─────┬──────┘           └─────┬──────┘
//!                                 │ emit                   │ observers
//!                                 ▼                        ▼
//!                          ┌──────────────┐        delivery queue
//!                          │ChangeNotifier│ ◄── flush_deliveries
//!                          └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ids`]: `/<TypeName>#<id>` identifiers
//! - [`model`]: schemas and typed object wrappers
//! - [`replica`]: Yrs document wrapper, origin tagging, update feed
//! - [`store`]: the replica store
//! - [`command`] / [`dispatcher`]: command bus
//! - [`notifier`]: change listeners

pub mod ids;
pub mod model;
pub mod replica;
pub mod store;
pub mod command;
pub mod dispatcher;
pub mod notifier;

pub use ids::{fresh_token, IdError, ObjectId};
pub use model::{ItemUpdate, Schema, TextObject, TodoItem, TodoList, TODO_ITEM_SCHEMA};
pub use replica::{DeliveryOrigin, Replica, ReplicaError, UpdateFeed};
pub use store::{StoreConfig, StoreError, StoreState, TodoStore, TodoView};
pub use command::{Command, CommandOutcome};
pub use dispatcher::{
    CommandHandler, CommandSender, DispatchError, DispatchReport, Dispatcher, HandlerToken,
};
pub use notifier::{ChangeEvent, ChangeNotifier, Listener};

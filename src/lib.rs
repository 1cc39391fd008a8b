//! `cascade-core`: a reactive state-management core combining a
//! push-based dependency graph with pull-based recomputation, a store
//! API (branches, snapshots, undo/redo, optimistic updates, modules,
//! typed state machines), a cooperative saga engine, an async query
//! cache, CRDT peer sync, and session recording/playback.
//!
//! The central type is [`Store`]: a cheaply cloneable handle to the
//! whole reactive graph. Register sources, computed values, selectors,
//! lenses, and effects against it; reads inside a `computed`/`lens`/
//! `effect` closure automatically register as dependencies, and writes
//! propagate glitch-free, notifying each affected subscriber at most
//! once per flush.

pub mod branch;
pub mod config;
pub mod crdt;
pub mod debounce;
pub mod error;
pub mod family;
pub mod graph;
pub mod history;
pub mod machine;
pub mod module;
mod node;
pub mod optimistic;
pub mod query;
pub mod recorder;
pub mod saga;
pub mod snapshot;
pub mod store;
pub mod tick;
pub mod value;

pub use branch::{Branch, BranchDiffEntry, BranchStatus};
pub use config::{StoreConfig, StoreConfigBuilder};
pub use debounce::{Debouncer, Throttler};
pub use error::{CoreError, CoreResult};
pub use family::Family;
pub use graph::{NodeKind, NodeState, RefId};
pub use machine::{Machine, MachineBuilder};
pub use snapshot::{Snapshot, SnapshotDiff};
pub use store::{Scope, Store, Subscription};
pub use tick::Tick;
pub use value::{AnyRef, Ref};

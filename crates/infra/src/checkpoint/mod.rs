//! Durable checkpoint storage.
//!
//! Every held event and every live job has one record in the store, keyed
//! `event:<id>` or `job:<id>`. Records are written before the in-memory change
//! they describe is considered committed, and deleted when the object's
//! lifecycle ends. [`Checkpointer`] is the typed layer the engine talks to.

pub mod checkpointer;
pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use checkpointer::{Checkpointer, Snapshot};
pub use in_memory::InMemoryCheckpointStore;
pub use postgres::PostgresCheckpointStore;
pub use r#trait::{CheckpointError, CheckpointKey, CheckpointKind, CheckpointStore};

//! Jobs: types, the live job table and the lifecycle state machine.
//!
//! ```text
//! INITIALIZED --start--> STARTED --exit 0--> COMPLETE
//!                        STARTED --failure-> FAILED --retry--> INITIALIZED
//!                                            FAILED --give up (terminal)
//! ```

pub mod lifecycle;
pub mod table;
pub mod types;

pub use lifecycle::{GiveUpReason, JobDisposition, JobLifecycleManager, LifecycleError};
pub use table::{JobCell, JobStats, JobTable};
pub use types::{
    BackoffStrategy, FailureKind, InvalidTransition, Job, JobCommand, JobFailure, JobOutput, JobStatus, RetryPolicy,
    StatusChange,
};

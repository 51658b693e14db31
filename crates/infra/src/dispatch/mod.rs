//! Execution dispatch: backends, their registry and the dispatcher.

pub mod backend;
pub mod dispatcher;
pub mod local_shell;
pub mod null;
pub mod registry;

pub use backend::{
    BackendError, Completion, CompletionSender, ExecOutcome, ExecutionBackend, Submission, SubmissionHandle,
};
pub use dispatcher::{DispatchError, Dispatcher};
pub use local_shell::LocalShellBackend;
pub use null::NullBackend;
pub use registry::{builtin_backends, BackendConstructor, BackendRegistry, BackendSlot};

use crate::controller::RunState;
use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

/// Errors a single injection trial can surface.
///
/// Everything here ends up inside the trial's `InjectionResult` rather than
/// being raised past the controller; only `AttachFailure` aborts before a
/// result exists at all. A tracee that exits before the trigger fires is not
/// an error, it is a valid "no injection" outcome.
#[derive(Error, Debug)]
pub enum TrialError {
    /// Fork, exec or the initial stop failed. Fatal, no trial result.
    #[error("failed to launch target {target:?}: {source}")]
    AttachFailure {
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Register access on a tracee that is not stopped, or that the kernel
    /// reports as gone. Fatal to the trial; the controller still tries to
    /// resume so the tracee is not left suspended.
    #[error("{op} refused: tracee is {state:?} ({errno})")]
    AccessError {
        op: &'static str,
        state: RunState,
        errno: Errno,
    },

    /// The tracee vanished outside the tracer relationship. The trial is
    /// marked inconclusive.
    #[error("lost tracee {pid}: {errno}")]
    TraceeLost { pid: i32, errno: Errno },
}

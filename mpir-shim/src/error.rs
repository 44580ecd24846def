#![warn(missing_docs)]

use crate::pmix::PmixError;

/// The overarching error type which contains all possible errors as variants.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Attach mode was requested without a usable launcher pid.
    #[error("attach mode requires a positive launcher pid, got {0}")]
    InvalidTargetPid(i32),
    /// No launcher command line was supplied.
    #[error("no launcher command given")]
    MissingLauncherCommand,
    /// A PMIx operation failed.
    #[error("PMIx {operation} failed")]
    Pmix {
        /// The operation that failed.
        operation: &'static str,
        /// The status the PMIx library reported.
        #[source]
        source: PmixError,
    },
    /// A required key was absent from the tool's keystore.
    #[error("required key {0} missing from the tool keystore")]
    MissingKey(&'static str),
    /// A query reply did not have the promised shape.
    #[error("malformed {what} response: {detail}")]
    MalformedReply {
        /// Which reply was malformed.
        what: &'static str,
        /// What exactly was wrong with it.
        detail: String,
    },
    /// The launcher reported ready without ever naming the application job.
    #[error("launch completed without an application namespace")]
    MissingNamespace,
    /// The launcher went away while an operation was still waiting on it.
    #[error("the launcher terminated while {0} was pending")]
    Interrupted(&'static str),
    /// Installing the termination-signal handlers failed.
    #[error("could not install signal handlers")]
    SignalSetup(#[source] std::io::Error),
    /// Any other error occurred.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Wrap a PMIx status as the failure of a named operation.
    pub(crate) fn pmix(operation: &'static str, source: PmixError) -> Self {
        Error::Pmix { operation, source }
    }
}

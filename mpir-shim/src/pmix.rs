//! The tool-side slice of the PMIx interface the shim drives.
//!
//! The PMIx client library is an external collaborator; everything the shim
//! needs from it is modelled by the [`PmixTool`] trait and the typed values in
//! this module. Implementations own their progress threads: event handlers
//! and registration callbacks run concurrently with the thread calling the
//! trait methods.

pub mod sim;

use std::fmt;
use std::sync::Arc;

/// Status codes surfaced by PMIx operations and carried by events.
///
/// Event codes are statuses too, exactly as in the PMIx wire model: an event
/// is "raised with" one of these values and handlers register for the codes
/// they care about.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PmixStatus {
    /// The operation completed.
    Success = 0,
    /// The operation completed in full; no callback will follow.
    OperationSucceeded = 1,
    /// An event-handler chain step completed.
    EventActionComplete = 2,
    /// A launcher reports the job it started is fully spawned.
    LaunchComplete = 3,
    /// A launcher is paused waiting for debugger directives.
    ReadyForDebug = 4,
    /// A job exited.
    JobTerminated = 5,
    /// A debugger releases a paused job from its init barrier.
    DebuggerRelease = 6,
    /// The connection to the PMIx server went away.
    LostConnectionToServer = -101,
    /// The operation did not complete in time.
    Timeout = -102,
    /// The requested key or value does not exist.
    NotFound = -103,
    /// An argument was malformed.
    BadParam = -104,
    /// The target process cannot be reached.
    Unreachable = -105,
}

impl PmixStatus {
    /// Whether this status reports a completed operation.
    ///
    /// PMIx signals success either as plain `Success` (a callback may still
    /// follow) or as `OperationSucceeded` (done, no callback); both count.
    pub fn is_success(self) -> bool {
        matches!(self, PmixStatus::Success | PmixStatus::OperationSucceeded)
    }

    /// The numeric rendering of this status.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Turn a status into a `Result`, keeping both success spellings.
    pub fn check(self) -> Result<(), PmixError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(PmixError(self))
        }
    }
}

impl fmt::Display for PmixStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PmixStatus::Success => "success",
            PmixStatus::OperationSucceeded => "operation-succeeded",
            PmixStatus::EventActionComplete => "event-action-complete",
            PmixStatus::LaunchComplete => "launch-complete",
            PmixStatus::ReadyForDebug => "ready-for-debug",
            PmixStatus::JobTerminated => "job-terminated",
            PmixStatus::DebuggerRelease => "debugger-release",
            PmixStatus::LostConnectionToServer => "lost-connection-to-server",
            PmixStatus::Timeout => "timeout",
            PmixStatus::NotFound => "not-found",
            PmixStatus::BadParam => "bad-param",
            PmixStatus::Unreachable => "unreachable",
        };
        write!(f, "{name}")
    }
}

/// A failed PMIx operation, carrying the status string and numeric code.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{} ({})", .0, .0.code())]
pub struct PmixError(pub PmixStatus);

/// A process rank within a namespace.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Rank {
    /// One concrete rank.
    Number(u32),
    /// Every rank in the namespace.
    Wildcard,
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rank::Number(rank) => write!(f, "{rank}"),
            Rank::Wildcard => write!(f, "*"),
        }
    }
}

/// A PMIx process identity: namespace plus rank.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Proc {
    /// The job namespace.
    pub nspace: String,
    /// The rank within it.
    pub rank: Rank,
}

impl Proc {
    /// Identity of one concrete rank.
    pub fn new(nspace: impl Into<String>, rank: Rank) -> Self {
        Proc {
            nspace: nspace.into(),
            rank,
        }
    }

    /// Identity covering every rank of a namespace.
    pub fn wildcard(nspace: impl Into<String>) -> Self {
        Proc::new(nspace, Rank::Wildcard)
    }
}

impl fmt::Display for Proc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.nspace, self.rank)
    }
}

/// Attribute keys understood across the tool interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InfoKey {
    // Tool initialisation.
    /// Do not look for a server yet; one will be spawned to rendezvous with.
    DoNotConnect,
    /// This tool is going to spawn a launcher.
    Launcher,
    /// Prefer the system-level server when connecting.
    ConnectSystemFirst,
    /// Connect to the server run by the process with this pid.
    ServerPidInfo,
    /// PMIx installation prefix.
    InstallPrefix,

    // Keystore lookups.
    /// URI of the server this tool itself offers.
    MyServerUri,
    /// URI of the server this tool is connected to.
    ServerUri,
    /// Namespace of the server this tool is connected to.
    ServerNspace,
    /// Rank of the server this tool is connected to.
    ServerRank,

    // Spawn directives.
    /// Process-to-resource mapping policy.
    MapBy,
    /// Forward the job's stdout to this tool.
    FwdStdout,
    /// Forward the job's stderr to this tool.
    FwdStderr,
    /// Notify this tool when the job completes.
    NotifyCompletion,
    /// Notify this tool of job-level events.
    NotifyJobEvents,
    /// Directives the launcher must apply to the jobs it starts.
    LaunchDirectives,
    /// Started processes block in PMIx init until released.
    DebugStopInInit,

    // Event metadata.
    /// Human-readable name of an event handler.
    EventHdlrName,
    /// Restrict an event handler to events about this process.
    EventAffectedProc,
    /// Do not deliver this notification to default handlers.
    EventNonDefault,
    /// Custom delivery target of a notification.
    EventCustomRange,
    /// A job namespace carried by an event.
    Nspace,
    /// A rank qualifier.
    Rank,
    /// Exit code carried by a termination event.
    ExitCode,
    /// Termination status carried by a termination event.
    JobTermStatus,

    // Queries.
    /// The namespaces a server knows about.
    Namespaces,
    /// The per-process table of a namespace.
    ProcTable,

    // Connection control.
    /// Block until the server connection is established.
    WaitForConnection,
    /// Give up after this many seconds.
    TimeoutSecs,
}

/// A typed PMIx value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// An unsigned integer.
    U32(u32),
    /// A signed integer.
    I32(i32),
    /// A string.
    String(String),
    /// A rank.
    Rank(Rank),
    /// A process identity.
    Proc(Proc),
    /// A nested attribute list.
    InfoArray(Vec<Info>),
    /// Per-process records answering a proctable query.
    ProcTable(Vec<ProcInfo>),
}

/// A keyed attribute passed across the PMIx boundary.
#[derive(Clone, Debug, PartialEq)]
pub struct Info {
    /// The attribute key.
    pub key: InfoKey,
    /// Its value.
    pub value: Value,
}

impl Info {
    /// An attribute with an arbitrary value.
    pub fn new(key: InfoKey, value: Value) -> Self {
        Info { key, value }
    }

    /// A boolean attribute set to true.
    pub fn flag(key: InfoKey) -> Self {
        Info::new(key, Value::Bool(true))
    }

    /// A string attribute.
    pub fn string(key: InfoKey, value: impl Into<String>) -> Self {
        Info::new(key, Value::String(value.into()))
    }
}

/// Coarse process state as reported by the runtime.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcState {
    /// State unknown to the runtime.
    Undefined,
    /// The process is running.
    Running,
    /// The process has exited.
    Terminated,
}

/// One per-process record from a proctable query response.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcInfo {
    /// Namespace and rank of the process.
    pub proc: Proc,
    /// Host the process runs on.
    pub hostname: String,
    /// Executable the process runs.
    pub executable: String,
    /// Operating-system pid.
    pub pid: u32,
    /// Exit code, if the process already left.
    pub exit_code: i32,
    /// Current state.
    pub state: ProcState,
}

/// One application in a spawn request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppContext {
    /// Command to execute.
    pub cmd: String,
    /// Full argument vector, `argv[0]` included.
    pub argv: Vec<String>,
    /// Environment handed to the child.
    pub env: Vec<(String, String)>,
    /// Working directory, empty when unavailable.
    pub cwd: String,
    /// Number of processes to start.
    pub maxprocs: u32,
}

/// A query against the runtime's information store.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    /// The keys being asked for.
    pub keys: Vec<InfoKey>,
    /// Attributes narrowing the query.
    pub qualifiers: Vec<Info>,
}

/// Delivery range of a notification.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Range {
    /// The emitting process only.
    Local,
    /// Every process in the emitter's namespace.
    Namespace,
    /// Everyone.
    Global,
    /// Exactly the processes named in the notification's attributes.
    Custom,
}

/// A delivered PMIx event.
#[derive(Clone, Debug)]
pub struct Event {
    /// The status code the event was raised with.
    pub status: PmixStatus,
    /// The process the event concerns.
    pub source: Proc,
    /// Additional event information.
    pub info: Vec<Info>,
}

/// Completion handle an event handler resolves so the handler chain advances.
pub struct EventCompletion(Option<Box<dyn FnOnce(PmixStatus) + Send>>);

impl EventCompletion {
    /// A completion that forwards the status to `notify`.
    pub fn new(notify: impl FnOnce(PmixStatus) + Send + 'static) -> Self {
        EventCompletion(Some(Box::new(notify)))
    }

    /// A completion nobody is waiting on.
    pub fn detached() -> Self {
        EventCompletion(None)
    }

    /// Resolve the chain with the given status.
    pub fn complete(mut self, status: PmixStatus) {
        if let Some(notify) = self.0.take() {
            notify(status);
        }
    }
}

impl fmt::Debug for EventCompletion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("EventCompletion")
            .field(&self.0.is_some())
            .finish()
    }
}

/// An event handler as registered with the tool.
pub type EventHandler = Arc<dyn Fn(Event, EventCompletion) + Send + Sync>;

/// Identifier the runtime assigns to a registered event handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// Reply to an event-handler registration.
#[derive(Copy, Clone, Debug)]
pub struct RegistrationReply {
    /// Outcome of the registration.
    pub status: PmixStatus,
    /// The id assigned to the handler.
    pub id: HandlerId,
}

/// Callback invoked, possibly on another thread, once a registration settles.
pub type RegistrationCallback = Box<dyn FnOnce(RegistrationReply) + Send>;

/// Tool-side operations of the PMIx client library.
///
/// The shim drives everything through this trait; the scripted runtime in
/// [`sim`] implements it in-process, a production transport implements it on
/// top of the system PMIx library.
pub trait PmixTool: Send + Sync {
    /// Initialise a tool session under the given identity.
    fn init(&self, ident: &Proc, attrs: &[Info]) -> Result<(), PmixError>;

    /// Tear down one tool session.
    fn finalize(&self) -> Result<(), PmixError>;

    /// Attach to the server advertised during spawn.
    ///
    /// Callers pass [`InfoKey::WaitForConnection`] and [`InfoKey::TimeoutSecs`]
    /// to bound the wait. Returns the identity of the server connected to.
    fn attach_to_server(&self, attrs: &[Info]) -> Result<Proc, PmixError>;

    /// Spawn a job and return its namespace.
    fn spawn(&self, job_attrs: &[Info], apps: &[AppContext]) -> Result<String, PmixError>;

    /// Look up a single value about `proc` from the tool's keystore.
    fn get(&self, proc: &Proc, key: InfoKey, qualifiers: &[Info]) -> Result<Value, PmixError>;

    /// Run queries against the runtime; returns the reply info list.
    fn query(&self, queries: &[Query]) -> Result<Vec<Info>, PmixError>;

    /// Register an event handler for `codes` (empty = default handler).
    ///
    /// The registration settles asynchronously through `cbfunc`; events are
    /// delivered to `handler` on runtime-owned threads.
    fn register_event_handler(
        &self,
        codes: &[PmixStatus],
        attrs: &[Info],
        handler: EventHandler,
        cbfunc: RegistrationCallback,
    );

    /// Emit an event into the runtime.
    fn notify_event(
        &self,
        status: PmixStatus,
        source: &Proc,
        range: Range,
        attrs: &[Info],
    ) -> Result<(), PmixError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn both_success_spellings_pass_check() {
        assert!(PmixStatus::Success.check().is_ok());
        assert!(PmixStatus::OperationSucceeded.check().is_ok());
        assert!(PmixStatus::Timeout.check().is_err());
    }

    #[test]
    fn errors_carry_the_status_string_and_code() {
        let err = PmixError(PmixStatus::LostConnectionToServer);
        assert_eq!(err.to_string(), "lost-connection-to-server (-101)");
    }

    #[test]
    fn completion_runs_its_callback_once() {
        let completion = EventCompletion::new(|status| {
            assert_eq!(status, PmixStatus::EventActionComplete);
        });
        completion.complete(PmixStatus::EventActionComplete);
        EventCompletion::detached().complete(PmixStatus::EventActionComplete);
    }
}

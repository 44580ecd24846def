//! Shared state between the driver thread and the event handlers.
//!
//! Everything mutable lives in one [`ShimContext`] owned behind an `Arc`;
//! handlers receive their clone through closure capture instead of a
//! C-style return-object pointer.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::error::Error;
use crate::latch::Latch;
use crate::mode::{RunMode, ShimOptions};
use crate::mpir;
use crate::pmix::{Info, InfoKey, PmixTool, Proc, Rank, RegistrationReply, Value};

/// Process-scoped tool identity, `<tool-name>.<pid>`.
static TOOL_NSPACE: Lazy<String> = Lazy::new(|| format!("mpir-shim.{}", std::process::id()));

/// How the launcher's death was observed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TerminationOrigin {
    /// The launcher's own termination event arrived.
    Launcher = 1,
    /// The application's termination implied the launcher is done.
    Application = 2,
}

/// The named latches the driver thread parks on.
pub(crate) struct Latches {
    /// Serialises event-handler registration.
    pub(crate) registration: Latch,
    /// Posted when the launch-complete event names the application job.
    pub(crate) launch_complete: Latch,
    /// Posted when the launcher is ready for debugger directives.
    pub(crate) ready_for_debug: Latch,
    /// Posted when the launcher terminates.
    pub(crate) launch_term: Latch,
}

impl Latches {
    fn new() -> Self {
        Latches {
            registration: Latch::new("registration"),
            launch_complete: Latch::new("launch-complete"),
            ready_for_debug: Latch::new("ready-for-debug"),
            launch_term: Latch::new("launch-term"),
        }
    }

    fn all(&self) -> [&Latch; 4] {
        [
            &self.registration,
            &self.launch_complete,
            &self.ready_for_debug,
            &self.launch_term,
        ]
    }
}

pub(crate) struct ShimContext {
    tool: Box<dyn PmixTool>,
    options: ShimOptions,
    tool_proc: Proc,
    /// Gates the underlying finalize; makes teardown idempotent across the
    /// driver, signal and process-exit paths.
    init_count: Mutex<u32>,
    /// Live PMIx-server connections (two at most, in non-proxy mode).
    session_count: AtomicU32,
    /// 0 while alive, then the [`TerminationOrigin`] that ended it.
    launcher_terminated: AtomicU8,
    exit_code: AtomicI32,
    application_terminated: AtomicBool,
    launcher: Mutex<Option<Proc>>,
    application: Mutex<Option<Proc>>,
    latches: Latches,
    /// Holds registrations to one in flight; the reply slot is shared.
    registration_serial: Mutex<()>,
    registration_reply: Mutex<Option<RegistrationReply>>,
}

impl ShimContext {
    /// Wrap the tool and resolved options for sharing with event handlers.
    pub(crate) fn new(tool: Box<dyn PmixTool>, options: ShimOptions) -> Arc<Self> {
        Arc::new(ShimContext {
            tool,
            options,
            tool_proc: Proc::new(TOOL_NSPACE.as_str(), Rank::Number(0)),
            init_count: Mutex::new(0),
            session_count: AtomicU32::new(0),
            launcher_terminated: AtomicU8::new(0),
            exit_code: AtomicI32::new(0),
            application_terminated: AtomicBool::new(false),
            launcher: Mutex::new(None),
            application: Mutex::new(None),
            latches: Latches::new(),
            registration_serial: Mutex::new(()),
            registration_reply: Mutex::new(None),
        })
    }

    pub(crate) fn mode(&self) -> RunMode {
        self.options.mode
    }

    pub(crate) fn options(&self) -> &ShimOptions {
        &self.options
    }

    pub(crate) fn tool(&self) -> &dyn PmixTool {
        self.tool.as_ref()
    }

    pub(crate) fn tool_proc(&self) -> &Proc {
        &self.tool_proc
    }

    pub(crate) fn latches(&self) -> &Latches {
        &self.latches
    }

    /// Post every latch. This is the only safe way to unblock the driver
    /// thread during abnormal termination.
    pub(crate) fn release_all_latches(&self) {
        for latch in self.latches.all() {
            latch.post();
        }
    }

    /// Initialise the PMIx tool session with mode-appropriate attributes.
    pub(crate) fn init_tool(&self) -> Result<(), Error> {
        let mut attrs = match self.mode() {
            RunMode::Proxy => vec![
                Info::flag(InfoKey::DoNotConnect),
                Info::flag(InfoKey::Launcher),
            ],
            RunMode::NonProxy => vec![Info::flag(InfoKey::ConnectSystemFirst)],
            RunMode::Attach => vec![Info::new(
                InfoKey::ServerPidInfo,
                Value::U32(self.options.target_pid as u32),
            )],
            RunMode::Dynamic => panic!("dynamic mode must be resolved before tool init"),
        };
        if let Some(prefix) = &self.options.pmix_prefix {
            attrs.push(Info::string(
                InfoKey::InstallPrefix,
                prefix.display().to_string(),
            ));
        }
        self.tool
            .init(&self.tool_proc, &attrs)
            .map_err(|err| Error::pmix("tool init", err))?;
        *self.init_count.lock().unwrap() += 1;
        // Proxy rendezvous happens later; the other modes connect during init.
        let sessions = match self.mode() {
            RunMode::Proxy => 0,
            _ => 1,
        };
        self.session_count.store(sessions, Ordering::SeqCst);
        debug!(identity = %self.tool_proc, sessions, "PMIx tool initialised");
        Ok(())
    }

    /// Tear one tool session down. Safe to call from any path, any number of
    /// times; only touches the library while an init is outstanding.
    pub(crate) fn finalize_tool(&self) {
        let mut count = self.init_count.lock().unwrap();
        if *count == 0 {
            return;
        }
        match self.tool.finalize() {
            Ok(()) => {
                *count -= 1;
                self.decrement_sessions();
                debug!("PMIx tool finalised");
            }
            Err(err) => warn!("PMIx tool finalize failed: {err}"),
        }
    }

    pub(crate) fn session_count(&self) -> u32 {
        self.session_count.load(Ordering::SeqCst)
    }

    pub(crate) fn increment_sessions(&self) -> u32 {
        self.session_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn decrement_sessions(&self) {
        let _ = self
            .session_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });
    }

    pub(crate) fn launcher_terminated(&self) -> bool {
        self.launcher_terminated.load(Ordering::SeqCst) != 0
    }

    pub(crate) fn termination_origin(&self) -> Option<TerminationOrigin> {
        match self.launcher_terminated.load(Ordering::SeqCst) {
            1 => Some(TerminationOrigin::Launcher),
            2 => Some(TerminationOrigin::Application),
            _ => None,
        }
    }

    pub(crate) fn application_terminated(&self) -> bool {
        self.application_terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    pub(crate) fn set_launcher(&self, proc: Proc) {
        *self.launcher.lock().unwrap() = Some(proc);
    }

    pub(crate) fn launcher(&self) -> Option<Proc> {
        self.launcher.lock().unwrap().clone()
    }

    pub(crate) fn set_application(&self, proc: Proc) {
        *self.application.lock().unwrap() = Some(proc);
    }

    pub(crate) fn application(&self) -> Option<Proc> {
        self.application.lock().unwrap().clone()
    }

    /// Record a job's death as observed by a termination handler: capture the
    /// exit code, publish the abort state on non-zero exits, then wake the
    /// driver wherever it is parked.
    pub(crate) fn record_job_termination(&self, origin: TerminationOrigin, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
        if code != 0 {
            mpir::advance_debug_state(mpir::MPIR_DEBUG_ABORTING);
            let what = match origin {
                TerminationOrigin::Launcher => "launcher",
                TerminationOrigin::Application => "application",
            };
            mpir::publish_abort(&format!("The {what} exited with return code {code}"));
        }
        self.launcher_terminated.store(origin as u8, Ordering::SeqCst);
        match origin {
            TerminationOrigin::Launcher => self.latches.launch_term.post(),
            TerminationOrigin::Application => {
                self.application_terminated.store(true, Ordering::SeqCst);
            }
        }
        self.release_all_latches();
    }

    pub(crate) fn registration_serial(&self) -> &Mutex<()> {
        &self.registration_serial
    }

    pub(crate) fn clear_registration_reply(&self) {
        *self.registration_reply.lock().unwrap() = None;
    }

    pub(crate) fn store_registration_reply(&self, reply: RegistrationReply) {
        *self.registration_reply.lock().unwrap() = Some(reply);
    }

    pub(crate) fn take_registration_reply(&self) -> Option<RegistrationReply> {
        self.registration_reply.lock().unwrap().take()
    }
}

#[cfg(test)]
mod test {
    use serial_test::serial;

    use crate::pmix::sim::SimTool;

    use super::*;

    fn context(mode: RunMode, tool: &SimTool) -> Arc<ShimContext> {
        let options = ShimOptions {
            mode,
            target_pid: 12345,
            run_args: vec!["mpirun".into(), "./app".into()],
            ..ShimOptions::default()
        };
        ShimContext::new(Box::new(tool.clone()), options)
    }

    #[test]
    fn finalize_is_idempotent() {
        let tool = SimTool::default();
        let ctx = context(RunMode::NonProxy, &tool);

        // Nothing initialised yet: finalize must not reach the library.
        ctx.finalize_tool();
        assert_eq!(tool.finalize_calls(), 0);

        ctx.init_tool().unwrap();
        ctx.finalize_tool();
        ctx.finalize_tool();
        ctx.finalize_tool();
        assert_eq!(tool.finalize_calls(), 1);
    }

    #[test]
    fn session_count_follows_the_mode() {
        let tool = SimTool::default();

        let ctx = context(RunMode::Proxy, &tool);
        ctx.init_tool().unwrap();
        assert_eq!(ctx.session_count(), 0);
        assert_eq!(ctx.increment_sessions(), 1);

        let ctx = context(RunMode::NonProxy, &tool);
        ctx.init_tool().unwrap();
        assert_eq!(ctx.session_count(), 1);
        assert_eq!(ctx.increment_sessions(), 2);

        ctx.decrement_sessions();
        ctx.decrement_sessions();
        ctx.decrement_sessions();
        assert_eq!(ctx.session_count(), 0);
    }

    #[test]
    fn proxy_and_attach_use_their_init_attributes() {
        let tool = SimTool::default();
        let ctx = context(RunMode::Proxy, &tool);
        ctx.init_tool().unwrap();
        let attrs = tool.init_attrs();
        assert!(attrs.iter().any(|info| info.key == InfoKey::DoNotConnect));
        assert!(attrs.iter().any(|info| info.key == InfoKey::Launcher));

        let tool = SimTool::default();
        let ctx = context(RunMode::Attach, &tool);
        ctx.init_tool().unwrap();
        assert!(tool
            .init_attrs()
            .iter()
            .any(|info| info.key == InfoKey::ServerPidInfo
                && info.value == Value::U32(12345)));
    }

    #[test]
    #[serial]
    fn launcher_termination_publishes_the_abort_surface() {
        mpir::testing::reset();
        let tool = SimTool::default();
        let ctx = context(RunMode::Proxy, &tool);

        ctx.record_job_termination(TerminationOrigin::Launcher, 42);

        assert_eq!(ctx.exit_code(), 42);
        assert!(ctx.launcher_terminated());
        assert_eq!(ctx.termination_origin(), Some(TerminationOrigin::Launcher));
        assert_eq!(mpir::debug_state(), mpir::MPIR_DEBUG_ABORTING);
        assert_eq!(
            mpir::abort_string().as_deref(),
            Some("The launcher exited with return code 42")
        );
        // Every latch is now open; no wait may hang.
        for latch in ctx.latches().all() {
            assert!(!latch.is_armed());
        }
        mpir::testing::reset();
    }

    #[test]
    #[serial]
    fn clean_exits_do_not_abort() {
        mpir::testing::reset();
        let tool = SimTool::default();
        let ctx = context(RunMode::Proxy, &tool);
        ctx.record_job_termination(TerminationOrigin::Application, 0);
        assert_eq!(ctx.exit_code(), 0);
        assert!(ctx.application_terminated());
        assert_eq!(
            ctx.termination_origin(),
            Some(TerminationOrigin::Application)
        );
        assert_eq!(mpir::debug_state(), mpir::MPIR_DEBUG_NULL);
        assert_eq!(mpir::abort_string(), None);
        mpir::testing::reset();
    }
}

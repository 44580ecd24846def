//! A scripted in-process PMIx runtime for dry runs and tests.
//!
//! [`SimTool`] stands in for the system PMIx library the way a mock debug
//! probe stands in for hardware: it starts no processes, but produces the
//! same event traffic a launcher-backed runtime would, delivered on its own
//! threads. The script is driven by the debugger-release notifications the
//! shim sends: releasing the launcher plays the launch phase, releasing the
//! application plays the termination phase.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::pmix::{
    AppContext, Event, EventCompletion, EventHandler, HandlerId, Info, InfoKey, PmixError,
    PmixStatus, Proc, ProcInfo, ProcState, PmixTool, Query, Range, Rank, RegistrationCallback,
    RegistrationReply, Value,
};

/// URI the simulated tool advertises for its own server side.
pub const MY_SERVER_URI: &str = "pmix://127.0.0.1:45600/tool";
/// URI the simulated tool reports for the server it is connected to.
pub const FALLBACK_SERVER_URI: &str = "pmix://127.0.0.1:45601/server";

/// How long the simulator waits for a handler before dropping an event.
const HANDLER_WAIT: Duration = Duration::from_secs(5);
/// How long the simulator waits for a handler to resolve its completion.
const COMPLETION_WAIT: Duration = Duration::from_secs(5);

/// Tunables for the scripted runtime.
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Number of application processes reported by the proctable query.
    pub nprocs: u32,
    /// Hostnames assigned round-robin to application processes.
    pub hosts: Vec<String>,
    /// Executable reported for every application process.
    pub executable: String,
    /// Namespace of the spawned (or attached) launcher.
    pub launcher_nspace: String,
    /// Namespace of the application job.
    pub app_nspace: String,
    /// Exit code the launcher terminates with.
    pub launcher_exit_code: i32,
    /// Exit code the application terminates with, when it reports itself.
    pub application_exit_code: i32,
    /// Terminate the launcher before it ever reports ready.
    pub fail_before_ready: bool,
    /// Report the application's own termination instead of the launcher's.
    pub report_application_exit: bool,
    /// Drop the server connection instead of terminating anything.
    pub drop_connection: bool,
    /// Advertise no tool-side URI so callers fall back to the server URI.
    pub omit_myserver_uri: bool,
    /// Fail server attachment with a timeout.
    pub connect_times_out: bool,
    /// First pid handed out for generated process records.
    pub base_pid: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            nprocs: 2,
            hosts: vec!["node0".into(), "node1".into()],
            executable: "./app".into(),
            launcher_nspace: "prterun.4321".into(),
            app_nspace: "app.1".into(),
            launcher_exit_code: 0,
            application_exit_code: 0,
            fail_before_ready: false,
            report_application_exit: false,
            drop_connection: false,
            omit_myserver_uri: false,
            connect_times_out: false,
            base_pid: 20_000,
        }
    }
}

#[derive(Clone)]
struct Registered {
    id: HandlerId,
    codes: Vec<PmixStatus>,
    affected: Option<Proc>,
    handler: EventHandler,
}

impl Registered {
    fn matches(&self, status: PmixStatus, source: &Proc) -> bool {
        if self.codes.is_empty() {
            // Default handlers consume what nothing else registered for; in
            // this simulation that is only the lost-connection event.
            return status == PmixStatus::LostConnectionToServer;
        }
        self.codes.contains(&status)
            && self
                .affected
                .as_ref()
                .map_or(true, |proc| proc.nspace == source.nspace)
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    handlers: Vec<Registered>,
    init_calls: u32,
    finalize_calls: u32,
    attach_calls: u32,
    init_attrs: Vec<Info>,
    spawn_attrs: Vec<Info>,
    spawned: Option<AppContext>,
    releases: Vec<Proc>,
    queries: Vec<Query>,
}

struct Inner {
    cfg: SimConfig,
    state: Mutex<State>,
    handler_added: Condvar,
}

/// The scripted runtime. Cloning shares the underlying state, so a test can
/// keep a handle for assertions while the shim owns the other.
#[derive(Clone)]
pub struct SimTool {
    inner: Arc<Inner>,
}

impl Default for SimTool {
    fn default() -> Self {
        SimTool::new(SimConfig::default())
    }
}

impl SimTool {
    /// A runtime playing the given script.
    pub fn new(cfg: SimConfig) -> Self {
        SimTool {
            inner: Arc::new(Inner {
                cfg,
                state: Mutex::new(State::default()),
                handler_added: Condvar::new(),
            }),
        }
    }

    /// How often `init` was called.
    pub fn init_calls(&self) -> u32 {
        self.inner.state.lock().unwrap().init_calls
    }

    /// How often `finalize` was called.
    pub fn finalize_calls(&self) -> u32 {
        self.inner.state.lock().unwrap().finalize_calls
    }

    /// How often `attach_to_server` was called.
    pub fn attach_calls(&self) -> u32 {
        self.inner.state.lock().unwrap().attach_calls
    }

    /// The attributes the last `init` was called with.
    pub fn init_attrs(&self) -> Vec<Info> {
        self.inner.state.lock().unwrap().init_attrs.clone()
    }

    /// The job-level attributes the last `spawn` was called with.
    pub fn spawn_attrs(&self) -> Vec<Info> {
        self.inner.state.lock().unwrap().spawn_attrs.clone()
    }

    /// The application context the launcher was spawned from.
    pub fn spawned_app(&self) -> Option<AppContext> {
        self.inner.state.lock().unwrap().spawned.clone()
    }

    /// Every debugger-release target, in order of arrival.
    pub fn releases(&self) -> Vec<Proc> {
        self.inner.state.lock().unwrap().releases.clone()
    }

    /// Every query received, in order of arrival.
    pub fn queries(&self) -> Vec<Query> {
        self.inner.state.lock().unwrap().queries.clone()
    }

    fn launcher_proc(&self) -> Proc {
        Proc::new(&self.inner.cfg.launcher_nspace, Rank::Number(0))
    }

    /// Deliver a lost-connection event to the registered default handlers, as
    /// if the server went away mid-run. Blocks until the handlers complete.
    pub fn notify_lost_connection(&self) {
        self.emit(
            PmixStatus::LostConnectionToServer,
            self.launcher_proc(),
            Vec::new(),
        );
    }

    /// Deliver one event to every matching handler, waiting for each handler
    /// to resolve its completion before moving on.
    fn emit(&self, status: PmixStatus, source: Proc, info: Vec<Info>) {
        let handlers = self.wait_for_handlers(status, &source);
        if handlers.is_empty() {
            warn!(%status, %source, "no handler for simulated event, dropping it");
            return;
        }
        for registered in handlers {
            let done = Arc::new((Mutex::new(false), Condvar::new()));
            let signal = Arc::clone(&done);
            let completion = EventCompletion::new(move |_status| {
                let (finished, cond) = &*signal;
                *finished.lock().unwrap() = true;
                cond.notify_all();
            });
            (registered.handler)(
                Event {
                    status,
                    source: source.clone(),
                    info: info.clone(),
                },
                completion,
            );
            let (finished, cond) = &*done;
            let guard = finished.lock().unwrap();
            let (_guard, timeout) = cond
                .wait_timeout_while(guard, COMPLETION_WAIT, |finished| !*finished)
                .unwrap();
            if timeout.timed_out() {
                warn!(%status, id = registered.id.0, "event handler never completed");
            }
        }
    }

    /// Block until at least one handler matches the event, bounded so a
    /// misconfigured script cannot hang forever.
    fn wait_for_handlers(&self, status: PmixStatus, source: &Proc) -> Vec<Registered> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            let matching: Vec<Registered> = state
                .handlers
                .iter()
                .filter(|registered| registered.matches(status, source))
                .cloned()
                .collect();
            if !matching.is_empty() {
                return matching;
            }
            let (guard, timeout) = self
                .inner
                .handler_added
                .wait_timeout(state, HANDLER_WAIT)
                .unwrap();
            state = guard;
            if timeout.timed_out() {
                return Vec::new();
            }
        }
    }

    /// Launch phase: played when the launcher is released from hold.
    fn launcher_script(&self) {
        let cfg = &self.inner.cfg;
        let launcher = self.launcher_proc();
        if cfg.fail_before_ready {
            self.emit(
                PmixStatus::JobTerminated,
                launcher,
                vec![Info::new(InfoKey::ExitCode, Value::I32(cfg.launcher_exit_code))],
            );
            return;
        }
        self.emit(
            PmixStatus::LaunchComplete,
            launcher.clone(),
            vec![Info::string(InfoKey::Nspace, &cfg.app_nspace)],
        );
        self.emit(PmixStatus::ReadyForDebug, launcher, Vec::new());
    }

    /// Termination phase: played when the application is released from its
    /// init barrier.
    fn application_script(&self) {
        let cfg = &self.inner.cfg;
        if cfg.drop_connection {
            self.emit(
                PmixStatus::LostConnectionToServer,
                self.launcher_proc(),
                Vec::new(),
            );
            return;
        }
        if cfg.report_application_exit {
            self.emit(
                PmixStatus::JobTerminated,
                Proc::wildcard(&cfg.app_nspace),
                vec![Info::new(
                    InfoKey::ExitCode,
                    Value::I32(cfg.application_exit_code),
                )],
            );
            return;
        }
        self.emit(
            PmixStatus::JobTerminated,
            self.launcher_proc(),
            vec![Info::new(InfoKey::ExitCode, Value::I32(cfg.launcher_exit_code))],
        );
    }

    fn proctable_records(&self) -> Vec<ProcInfo> {
        let cfg = &self.inner.cfg;
        // Reverse rank order on purpose: consumers must place records by
        // rank, not by arrival position.
        (0..cfg.nprocs)
            .rev()
            .map(|rank| ProcInfo {
                proc: Proc::new(&cfg.app_nspace, Rank::Number(rank)),
                hostname: cfg.hosts[rank as usize % cfg.hosts.len()].clone(),
                executable: cfg.executable.clone(),
                pid: cfg.base_pid + rank,
                exit_code: 0,
                state: ProcState::Running,
            })
            .collect()
    }
}

impl PmixTool for SimTool {
    fn init(&self, _ident: &Proc, attrs: &[Info]) -> Result<(), PmixError> {
        let mut state = self.inner.state.lock().unwrap();
        state.init_calls += 1;
        state.init_attrs = attrs.to_vec();
        Ok(())
    }

    fn finalize(&self) -> Result<(), PmixError> {
        self.inner.state.lock().unwrap().finalize_calls += 1;
        Ok(())
    }

    fn attach_to_server(&self, _attrs: &[Info]) -> Result<Proc, PmixError> {
        self.inner.state.lock().unwrap().attach_calls += 1;
        if self.inner.cfg.connect_times_out {
            return Err(PmixError(PmixStatus::Timeout));
        }
        Ok(self.launcher_proc())
    }

    fn spawn(&self, job_attrs: &[Info], apps: &[AppContext]) -> Result<String, PmixError> {
        let [app] = apps else {
            return Err(PmixError(PmixStatus::BadParam));
        };
        let mut state = self.inner.state.lock().unwrap();
        state.spawn_attrs = job_attrs.to_vec();
        state.spawned = Some(app.clone());
        // The library reports this one as fully done, no callback pending.
        PmixStatus::OperationSucceeded.check()?;
        Ok(self.inner.cfg.launcher_nspace.clone())
    }

    fn get(&self, _proc: &Proc, key: InfoKey, _qualifiers: &[Info]) -> Result<Value, PmixError> {
        let cfg = &self.inner.cfg;
        match key {
            InfoKey::MyServerUri if cfg.omit_myserver_uri => {
                Err(PmixError(PmixStatus::NotFound))
            }
            InfoKey::MyServerUri => Ok(Value::String(MY_SERVER_URI.into())),
            InfoKey::ServerUri => Ok(Value::String(FALLBACK_SERVER_URI.into())),
            InfoKey::ServerNspace => Ok(Value::String(cfg.launcher_nspace.clone())),
            InfoKey::ServerRank => Ok(Value::Rank(Rank::Number(0))),
            _ => Err(PmixError(PmixStatus::NotFound)),
        }
    }

    fn query(&self, queries: &[Query]) -> Result<Vec<Info>, PmixError> {
        let [query] = queries else {
            return Err(PmixError(PmixStatus::BadParam));
        };
        self.inner.state.lock().unwrap().queries.push(query.clone());
        match query.keys.as_slice() {
            [InfoKey::Namespaces] => Ok(vec![Info::string(
                InfoKey::Namespaces,
                &self.inner.cfg.app_nspace,
            )]),
            [InfoKey::ProcTable] => Ok(vec![Info::new(
                InfoKey::ProcTable,
                Value::ProcTable(self.proctable_records()),
            )]),
            _ => Err(PmixError(PmixStatus::NotFound)),
        }
    }

    fn register_event_handler(
        &self,
        codes: &[PmixStatus],
        attrs: &[Info],
        handler: EventHandler,
        cbfunc: RegistrationCallback,
    ) {
        let affected = attrs.iter().find_map(|info| match (&info.key, &info.value) {
            (InfoKey::EventAffectedProc, Value::Proc(proc)) => Some(proc.clone()),
            _ => None,
        });
        let id = {
            let mut state = self.inner.state.lock().unwrap();
            let id = HandlerId(state.next_id);
            state.next_id += 1;
            state.handlers.push(Registered {
                id,
                codes: codes.to_vec(),
                affected,
                handler,
            });
            self.inner.handler_added.notify_all();
            id
        };
        // Registration settles on a runtime thread, like the real library.
        thread::spawn(move || {
            cbfunc(RegistrationReply {
                status: PmixStatus::Success,
                id,
            });
        });
    }

    fn notify_event(
        &self,
        status: PmixStatus,
        _source: &Proc,
        range: Range,
        attrs: &[Info],
    ) -> Result<(), PmixError> {
        if status != PmixStatus::DebuggerRelease || range != Range::Custom {
            return Err(PmixError(PmixStatus::BadParam));
        }
        let target = attrs
            .iter()
            .find_map(|info| match (&info.key, &info.value) {
                (InfoKey::EventCustomRange, Value::Proc(proc)) => Some(proc.clone()),
                _ => None,
            })
            .ok_or(PmixError(PmixStatus::BadParam))?;
        let launcher_target = target.nspace == self.inner.cfg.launcher_nspace;
        self.inner.state.lock().unwrap().releases.push(target);
        let player = self.clone();
        thread::spawn(move || {
            if launcher_target {
                player.launcher_script();
            } else {
                player.application_script();
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn events_wait_for_a_matching_handler() {
        let tool = SimTool::default();
        let seen = Arc::new(AtomicU32::new(0));

        let observer = Arc::clone(&seen);
        let emitter = tool.clone();
        let emit = thread::spawn(move || {
            emitter.emit(PmixStatus::ReadyForDebug, emitter.launcher_proc(), Vec::new());
        });

        // Register only after the emitter is already waiting.
        thread::sleep(Duration::from_millis(20));
        tool.register_event_handler(
            &[PmixStatus::ReadyForDebug],
            &[],
            Arc::new(move |event, completion| {
                assert_eq!(event.status, PmixStatus::ReadyForDebug);
                observer.fetch_add(1, Ordering::SeqCst);
                completion.complete(PmixStatus::EventActionComplete);
            }),
            Box::new(|_reply| {}),
        );

        emit.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn affected_proc_filters_by_namespace() {
        let registered = Registered {
            id: HandlerId(0),
            codes: vec![PmixStatus::JobTerminated],
            affected: Some(Proc::wildcard("app.1")),
            handler: Arc::new(|_, completion| {
                completion.complete(PmixStatus::EventActionComplete)
            }),
        };
        assert!(registered.matches(
            PmixStatus::JobTerminated,
            &Proc::new("app.1", Rank::Number(3))
        ));
        assert!(!registered.matches(
            PmixStatus::JobTerminated,
            &Proc::new("prterun.4321", Rank::Number(0))
        ));
    }

    #[test]
    fn default_handlers_only_take_lost_connections() {
        let registered = Registered {
            id: HandlerId(0),
            codes: Vec::new(),
            affected: None,
            handler: Arc::new(|_, completion| {
                completion.complete(PmixStatus::EventActionComplete)
            }),
        };
        let source = Proc::new("prterun.4321", Rank::Number(0));
        assert!(registered.matches(PmixStatus::LostConnectionToServer, &source));
        assert!(!registered.matches(PmixStatus::JobTerminated, &source));
    }
}

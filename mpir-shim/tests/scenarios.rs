//! End-to-end scenarios driven through the scripted PMIx runtime.
//!
//! Everything here touches the process-wide MPIR symbol surface, so the
//! tests are serialised and reset the surface on entry and exit.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mpir_shim::mpir::{self, testing};
use mpir_shim::pmix::sim::{SimConfig, SimTool, FALLBACK_SERVER_URI, MY_SERVER_URI};
use mpir_shim::pmix::{Info, InfoKey, PmixStatus, PmixTool, Proc, Range, Rank, Value};
use mpir_shim::{run, Error, RunMode, ShimOptions};
use serial_test::serial;

fn options(mode: RunMode, args: &[&str]) -> ShimOptions {
    ShimOptions {
        mode,
        run_args: args.iter().map(|arg| arg.to_string()).collect(),
        ..ShimOptions::default()
    }
}

#[derive(Clone)]
struct BreakpointObservation {
    state: i32,
    rows: Vec<testing::ProcDescSnapshot>,
}

/// Observe the MPIR surface the way a debugger would: at the breakpoint.
fn observe_breakpoint() -> Arc<Mutex<Option<BreakpointObservation>>> {
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    testing::set_breakpoint_hook(move || {
        *sink.lock().unwrap() = Some(BreakpointObservation {
            state: mpir::debug_state(),
            rows: testing::proctable_snapshot(),
        });
    });
    seen
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Release the held application by hand, the way the suppressed driver
/// would have.
fn release_application(tool: &SimTool, nspace: &str) {
    tool.notify_event(
        PmixStatus::DebuggerRelease,
        &Proc::new("tester", Rank::Number(0)),
        Range::Custom,
        &[
            Info::new(
                InfoKey::EventCustomRange,
                Value::Proc(Proc::wildcard(nspace)),
            ),
            Info::flag(InfoKey::EventNonDefault),
        ],
    )
    .unwrap();
}

#[test]
#[serial]
fn proxy_launch_runs_the_full_rendezvous() {
    testing::reset();
    let seen = observe_breakpoint();
    let tool = SimTool::new(SimConfig {
        nprocs: 4,
        executable: "./hello".into(),
        ..SimConfig::default()
    });

    let exit = run(
        options(RunMode::Dynamic, &["mpirun", "-n", "4", "./hello"]),
        Box::new(tool.clone()),
    )
    .unwrap();
    assert_eq!(exit, 0);

    // The debugger's view at the breakpoint: job spawned, table complete,
    // rows indexed by rank.
    let seen = seen.lock().unwrap().clone().expect("breakpoint never fired");
    assert_eq!(seen.state, mpir::MPIR_DEBUG_SPAWNED);
    assert_eq!(seen.rows.len(), 4);
    for (rank, row) in seen.rows.iter().enumerate() {
        assert_eq!(row.executable_name, "./hello");
        assert_eq!(row.pid, 20_000 + rank as i32);
        assert!(!row.host_name.is_empty());
    }

    // Launcher rank 0 was released first, the application wildcard second.
    let releases = tool.releases();
    assert_eq!(releases.len(), 2);
    assert_eq!(releases[0], Proc::new("prterun.4321", Rank::Number(0)));
    assert_eq!(releases[1], Proc::wildcard("app.1"));

    // The spawned launcher carried the rendezvous URI and the full
    // environment of the tool.
    let app = tool.spawned_app().unwrap();
    assert_eq!(app.maxprocs, 1);
    assert_eq!(app.argv[0], "mpirun");
    assert!(app
        .env
        .iter()
        .any(|(name, value)| name == "LAUNCHER_RNDZ_URI" && value == MY_SERVER_URI));

    // The launch directives hold the application in init.
    assert!(tool.spawn_attrs().iter().any(|info| {
        info.key == InfoKey::LaunchDirectives
            && info.value
                == Value::InfoArray(vec![Info::flag(InfoKey::DebugStopInInit)])
    }));

    // Teardown freed the table again.
    assert!(testing::proctable_snapshot().is_empty());
    testing::reset();
}

#[test]
#[serial]
fn prun_goes_through_the_system_server() {
    testing::reset();
    let tool = SimTool::default();
    let exit = run(
        options(RunMode::Dynamic, &["prun", "-n", "2", "./hi"]),
        Box::new(tool.clone()),
    )
    .unwrap();
    assert_eq!(exit, 0);

    // Dynamic resolved to non-proxy: system server first, then a second
    // session against the spawned launcher.
    assert!(tool
        .init_attrs()
        .iter()
        .any(|info| info.key == InfoKey::ConnectSystemFirst));
    assert_eq!(tool.attach_calls(), 1);

    // Non-proxy inherits the environment through the server; only the
    // rendezvous URI is injected.
    let app = tool.spawned_app().unwrap();
    assert_eq!(app.env.len(), 1);
    assert_eq!(app.env[0].0, "LAUNCHER_RNDZ_URI");
    testing::reset();
}

#[test]
#[serial]
fn launcher_abort_before_ready_surfaces_the_exit_code() {
    testing::reset();
    let tool = SimTool::new(SimConfig {
        fail_before_ready: true,
        launcher_exit_code: 42,
        ..SimConfig::default()
    });
    let exit = run(
        options(RunMode::Dynamic, &["mpirun", "./bad"]),
        Box::new(tool.clone()),
    )
    .unwrap();
    assert_eq!(exit, 42);
    assert_eq!(mpir::debug_state(), mpir::MPIR_DEBUG_ABORTING);
    assert_eq!(
        mpir::abort_string().as_deref(),
        Some("The launcher exited with return code 42")
    );
    // The application never existed, so only the launcher was released.
    assert_eq!(tool.releases().len(), 1);
    testing::reset();
}

#[test]
#[serial]
fn attach_resolves_namespaces_and_builds_the_table() {
    testing::reset();
    let seen = observe_breakpoint();
    let tool = SimTool::new(SimConfig {
        nprocs: 2,
        launcher_nspace: "prterun.100".into(),
        ..SimConfig::default()
    });
    let mut opts = options(RunMode::Attach, &[]);
    opts.target_pid = 12345;
    let exit = run(opts, Box::new(tool.clone())).unwrap();
    assert_eq!(exit, 0);

    let seen = seen.lock().unwrap().clone().expect("breakpoint never fired");
    assert_eq!(seen.state, mpir::MPIR_DEBUG_SPAWNED);
    assert_eq!(seen.rows.len(), 2);

    // The pid went into tool init, the namespace query was qualified by the
    // launcher's identity, and the proctable query followed.
    assert!(tool.init_attrs().iter().any(
        |info| info.key == InfoKey::ServerPidInfo && info.value == Value::U32(12345)
    ));
    let queries = tool.queries();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0].keys, vec![InfoKey::Namespaces]);
    assert!(queries[0].qualifiers.iter().any(|info| {
        info.key == InfoKey::Nspace && info.value == Value::String("prterun.100".into())
    }));
    assert_eq!(queries[1].keys, vec![InfoKey::ProcTable]);

    // Attach never spawns and never releases anybody.
    assert!(tool.spawned_app().is_none());
    assert!(tool.releases().is_empty());
    testing::reset();
}

#[test]
#[serial]
fn attach_with_pid_zero_is_rejected_before_any_pmix_call() {
    let tool = SimTool::default();
    let err = run(options(RunMode::Attach, &[]), Box::new(tool.clone())).unwrap_err();
    assert!(matches!(err, Error::InvalidTargetPid(0)));
    assert_eq!(tool.init_calls(), 0);
}

#[test]
#[serial]
fn losing_the_last_session_releases_everything_and_exits() {
    testing::reset();
    let exit_codes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&exit_codes);
    testing::set_exit_hook(move |code| {
        sink.lock().unwrap().push(code);
    });

    let tool = SimTool::new(SimConfig {
        drop_connection: true,
        ..SimConfig::default()
    });
    // The driver parks on launch-term; the lost-connection default handler
    // must wake it and leave through the callback-safe exit.
    let exit = run(
        options(RunMode::Dynamic, &["mpirun", "./hello"]),
        Box::new(tool.clone()),
    );
    assert!(exit.is_ok());
    assert_eq!(exit_codes.lock().unwrap().first(), Some(&1));
    testing::reset();
}

#[test]
#[serial]
fn application_death_reports_through_the_application_handler() {
    testing::reset();
    let tool = SimTool::new(SimConfig {
        report_application_exit: true,
        application_exit_code: 9,
        ..SimConfig::default()
    });
    let exit = run(
        options(RunMode::Proxy, &["mpirun", "./crashy"]),
        Box::new(tool.clone()),
    )
    .unwrap();
    assert_eq!(exit, 9);
    assert_eq!(mpir::debug_state(), mpir::MPIR_DEBUG_ABORTING);
    assert_eq!(
        mpir::abort_string().as_deref(),
        Some("The application exited with return code 9")
    );
    testing::reset();
}

#[test]
#[serial]
fn rendezvous_falls_back_to_the_server_uri() {
    testing::reset();
    let tool = SimTool::new(SimConfig {
        omit_myserver_uri: true,
        ..SimConfig::default()
    });
    let exit = run(
        options(RunMode::Dynamic, &["mpirun", "./hello"]),
        Box::new(tool.clone()),
    )
    .unwrap();
    assert_eq!(exit, 0);
    let app = tool.spawned_app().unwrap();
    assert!(app
        .env
        .iter()
        .any(|(name, value)| name == "LAUNCHER_RNDZ_URI" && value == FALLBACK_SERVER_URI));
    testing::reset();
}

#[test]
#[serial]
fn server_connection_timeout_is_an_error() {
    testing::reset();
    let tool = SimTool::new(SimConfig {
        connect_times_out: true,
        ..SimConfig::default()
    });
    let err = run(
        options(RunMode::Dynamic, &["mpirun", "./hello"]),
        Box::new(tool),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::Pmix {
            operation: "server connection",
            ..
        }
    ));
    testing::reset();
}

#[test]
#[serial]
fn suppressed_release_lets_a_test_drive_the_application() {
    testing::reset();
    testing::suppress_application_release(true);
    let tool = SimTool::default();
    let runner = tool.clone();
    let handle = thread::spawn(move || {
        run(
            options(RunMode::Dynamic, &["mpirun", "./hello"]),
            Box::new(runner),
        )
    });

    // The launcher gets released, the application stays held.
    let released = wait_until(Duration::from_secs(5), || tool.releases().len() == 1);
    assert!(released, "launcher release never arrived");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(tool.releases().len(), 1);

    release_application(&tool, "app.1");
    let exit = handle.join().unwrap().unwrap();
    assert_eq!(exit, 0);
    testing::reset();
}

#[test]
#[serial]
fn sigint_runs_the_orderly_teardown() {
    testing::reset();
    let exit_codes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&exit_codes);
    testing::set_exit_hook(move |code| {
        sink.lock().unwrap().push(code);
    });
    testing::suppress_application_release(true);

    let tool = SimTool::default();
    let runner = tool.clone();
    let handle = thread::spawn(move || {
        run(
            options(RunMode::Dynamic, &["mpirun", "./hello"]),
            Box::new(runner),
        )
    });
    let released = wait_until(Duration::from_secs(5), || tool.releases().len() == 1);
    assert!(released, "launcher release never arrived");
    thread::sleep(Duration::from_millis(50));

    signal_hook::low_level::raise(signal_hook::consts::signal::SIGINT).unwrap();
    let finalized = wait_until(Duration::from_secs(5), || {
        !exit_codes.lock().unwrap().is_empty()
    });
    assert!(finalized, "signal handler never ran");
    assert_eq!(exit_codes.lock().unwrap().first(), Some(&1));
    assert!(tool.finalize_calls() >= 1);

    // Let the parked driver finish so nothing leaks into the next test.
    release_application(&tool, "app.1");
    let exit = handle.join().unwrap().unwrap();
    assert_eq!(exit, 0);
    testing::reset();
}

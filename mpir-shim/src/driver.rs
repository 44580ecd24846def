//! The driver sequence: spawn or attach, synchronise with the launcher, hand
//! the job to the debugger, mirror the launcher's exit.

use std::env;
use std::sync::Arc;

use tracing::{debug, info};

use crate::context::ShimContext;
use crate::error::Error;
use crate::events;
use crate::mode::{RunMode, ShimOptions};
use crate::mpir;
use crate::pmix::{AppContext, Info, InfoKey, PmixStatus, PmixTool, Proc, Query, Range, Rank, Value};
use crate::proctable;
use crate::shutdown;

/// Environment variable the spawned launcher reads to call back on the
/// tool's server.
const LAUNCHER_RNDZ_URI: &str = "LAUNCHER_RNDZ_URI";

/// Bound on waiting for the freshly spawned launcher's server.
const SERVER_CONNECT_TIMEOUT_SECS: u32 = 10;

/// Drive a launcher (or attach to one) and serve the MPIR surface until the
/// job ends.
///
/// Returns the launcher's exit code in the spawn modes and 0 after a
/// successful attach. Configuration errors and PMIx failures surface as
/// [`Error`]; the caller maps them onto a non-zero process exit.
pub fn run(options: ShimOptions, tool: Box<dyn PmixTool>) -> Result<i32, Error> {
    let options = options.resolved()?;
    debug!(mode = %options.mode, "options resolved");

    let ctx = ShimContext::new(tool, options);
    shutdown::install_signal_handlers(&ctx)?;
    let _teardown = shutdown::TeardownGuard::new(Arc::clone(&ctx));

    ctx.init_tool()?;
    // The default handler must be in place before any other registration.
    events::register_default_handler(&ctx)?;

    let code = match ctx.mode() {
        RunMode::Attach => attach(&ctx)?,
        _ => launch(&ctx)?,
    };
    ctx.finalize_tool();
    Ok(code)
}

/// Proxy and non-proxy: spawn the launcher, walk it through the debug
/// rendezvous, wait the job out.
fn launch(ctx: &Arc<ShimContext>) -> Result<i32, Error> {
    let nspace = spawn_launcher(ctx)?;
    let launcher = Proc::new(nspace, Rank::Number(0));

    // Rendezvous with the server the launcher just brought up.
    let connect_attrs = [
        Info::flag(InfoKey::WaitForConnection),
        Info::new(
            InfoKey::TimeoutSecs,
            Value::U32(SERVER_CONNECT_TIMEOUT_SECS),
        ),
    ];
    let server = ctx
        .tool()
        .attach_to_server(&connect_attrs)
        .map_err(|err| Error::pmix("server connection", err))?;
    let sessions = ctx.increment_sessions();
    debug!(server = %server, sessions, "connected to launcher server");

    ctx.set_launcher(launcher.clone());
    // Termination must be watched before anything can wake us up about it,
    // and the ready handler before the launcher is allowed to proceed.
    events::register_launcher_terminated_handler(ctx, &launcher)?;
    events::register_launcher_ready_handler(ctx, &launcher)?;
    release(ctx, &launcher)?;
    if let Err(err) = events::register_launch_complete_handler(ctx) {
        return interrupted_exit(ctx, err);
    }

    ctx.latches()
        .ready_for_debug
        .wait(|| ctx.launcher_terminated());
    if ctx.launcher_terminated() {
        info!(code = ctx.exit_code(), "launcher terminated before ready");
        return Ok(ctx.exit_code());
    }

    let application = ctx.application().ok_or(Error::MissingNamespace)?;
    build_proctable(ctx, &application)?;

    if ctx.mode() == RunMode::Proxy {
        if let Err(err) = events::register_application_terminated_handler(ctx, &application) {
            return interrupted_exit(ctx, err);
        }
    }

    if application_release_suppressed() {
        debug!("application release suppressed");
    } else {
        release(ctx, &application)?;
    }

    ctx.latches()
        .launch_term
        .wait(|| ctx.launcher_terminated());
    info!(code = ctx.exit_code(), "launcher terminated");
    Ok(ctx.exit_code())
}

/// A registration raced against the launcher's death: when the launcher is
/// already gone that is the normal way out, anything else stays an error.
fn interrupted_exit(ctx: &Arc<ShimContext>, err: Error) -> Result<i32, Error> {
    match err {
        Error::Interrupted(_) if ctx.launcher_terminated() => {
            info!(code = ctx.exit_code(), "launcher terminated during setup");
            Ok(ctx.exit_code())
        }
        err => Err(err),
    }
}

/// Attach: the server behind the pid is the launcher; everything else is
/// queries.
fn attach(ctx: &Arc<ShimContext>) -> Result<i32, Error> {
    let nspace = match ctx.tool().get(ctx.tool_proc(), InfoKey::ServerNspace, &[]) {
        Ok(Value::String(nspace)) => nspace,
        Ok(other) => {
            return Err(Error::MalformedReply {
                what: "server namespace",
                detail: format!("{other:?}"),
            })
        }
        Err(_) => return Err(Error::MissingKey("server-nspace")),
    };
    let rank = match ctx.tool().get(ctx.tool_proc(), InfoKey::ServerRank, &[]) {
        Ok(Value::Rank(rank)) => rank,
        Ok(other) => {
            return Err(Error::MalformedReply {
                what: "server rank",
                detail: format!("{other:?}"),
            })
        }
        Err(_) => return Err(Error::MissingKey("server-rank")),
    };
    let launcher = Proc::new(nspace, rank);
    info!(launcher = %launcher, "attached to launcher");
    ctx.set_launcher(launcher.clone());

    let application = Proc::wildcard(query_application_nspace(ctx, &launcher)?);
    ctx.set_application(application.clone());
    build_proctable(ctx, &application)?;
    Ok(0)
}

/// Build the spawn request for the launcher itself and submit it.
fn spawn_launcher(ctx: &Arc<ShimContext>) -> Result<String, Error> {
    let run_args = &ctx.options().run_args;
    let cmd = run_args
        .first()
        .cloned()
        .ok_or(Error::MissingLauncherCommand)?;
    let cwd = env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_default();

    let mut child_env = vec![(LAUNCHER_RNDZ_URI.to_owned(), rendezvous_uri(ctx)?)];
    if ctx.mode() == RunMode::Proxy {
        // The launcher and its application see everything the tool sees.
        child_env.extend(env::vars());
    }

    let app = AppContext {
        cmd: cmd.clone(),
        argv: run_args.clone(),
        env: child_env,
        cwd,
        maxprocs: 1,
    };
    let job_attrs = vec![
        Info::string(InfoKey::MapBy, "slot"),
        Info::flag(InfoKey::FwdStdout),
        Info::flag(InfoKey::FwdStderr),
        Info::flag(InfoKey::NotifyCompletion),
        Info::flag(InfoKey::NotifyJobEvents),
        // The launcher must hold every application rank in PMIx init until
        // the debugger releases it.
        Info::new(
            InfoKey::LaunchDirectives,
            Value::InfoArray(vec![Info::flag(InfoKey::DebugStopInInit)]),
        ),
    ];
    let nspace = ctx
        .tool()
        .spawn(&job_attrs, std::slice::from_ref(&app))
        .map_err(|err| Error::pmix("launcher spawn", err))?;
    info!(command = %cmd, namespace = %nspace, "launcher spawned");
    Ok(nspace)
}

/// URI the launcher calls back on: prefer the tool's own server, fall back
/// to the one it is connected to.
fn rendezvous_uri(ctx: &Arc<ShimContext>) -> Result<String, Error> {
    match ctx.tool().get(ctx.tool_proc(), InfoKey::MyServerUri, &[]) {
        Ok(Value::String(uri)) => Ok(uri),
        _ => match ctx.tool().get(ctx.tool_proc(), InfoKey::ServerUri, &[]) {
            Ok(Value::String(uri)) => Ok(uri),
            Ok(other) => Err(Error::MalformedReply {
                what: "server URI",
                detail: format!("{other:?}"),
            }),
            Err(err) => Err(Error::pmix("server URI lookup", err)),
        },
    }
}

/// Send a debugger-release notification to exactly the given target.
fn release(ctx: &Arc<ShimContext>, target: &Proc) -> Result<(), Error> {
    let attrs = [
        Info::new(InfoKey::EventCustomRange, Value::Proc(target.clone())),
        // Keep default handlers, ours included, away from this notification.
        Info::flag(InfoKey::EventNonDefault),
    ];
    ctx.tool()
        .notify_event(
            PmixStatus::DebuggerRelease,
            ctx.tool_proc(),
            Range::Custom,
            &attrs,
        )
        .map_err(|err| Error::pmix("debugger release", err))?;
    debug!(target = %target, "debugger release sent");
    Ok(())
}

/// Query the application's proctable, materialise the MPIR table, and fire
/// the breakpoint for the debugger.
fn build_proctable(ctx: &Arc<ShimContext>, application: &Proc) -> Result<(), Error> {
    let query = Query {
        keys: vec![InfoKey::ProcTable],
        qualifiers: vec![Info::string(InfoKey::Nspace, application.nspace.clone())],
    };
    let reply = ctx
        .tool()
        .query(&[query])
        .map_err(|err| Error::pmix("proctable query", err))?;
    let records = proctable::records_from_reply(reply)?;
    if ctx.options().debug {
        for record in &records {
            debug!(
                rank = %record.proc.rank,
                host = %record.hostname,
                executable = %record.executable,
                pid = record.pid,
                "proctable row"
            );
        }
    }
    let descs = proctable::build(&records)?;
    let size = descs.len();
    mpir::publish_proctable(descs);
    mpir::advance_debug_state(mpir::MPIR_DEBUG_SPAWNED);
    info!(size, "proctable published, entering debugger breakpoint");
    mpir::MPIR_Breakpoint();
    Ok(())
}

/// Resolve the application namespace through the launcher (attach mode).
fn query_application_nspace(ctx: &Arc<ShimContext>, launcher: &Proc) -> Result<String, Error> {
    let query = Query {
        keys: vec![InfoKey::Namespaces],
        qualifiers: vec![
            Info::string(InfoKey::Nspace, launcher.nspace.clone()),
            Info::new(InfoKey::Rank, Value::Rank(launcher.rank)),
        ],
    };
    let mut reply = ctx
        .tool()
        .query(&[query])
        .map_err(|err| Error::pmix("namespace query", err))?;
    let single = if reply.len() == 1 { reply.pop() } else { None };
    match single {
        Some(Info {
            key: InfoKey::Namespaces,
            value: Value::String(nspace),
        }) => Ok(nspace),
        other => Err(Error::MalformedReply {
            what: "namespace",
            detail: format!("{other:?}"),
        }),
    }
}

#[cfg(feature = "test")]
fn application_release_suppressed() -> bool {
    mpir::testing::application_release_suppressed()
}

#[cfg(not(feature = "test"))]
fn application_release_suppressed() -> bool {
    false
}

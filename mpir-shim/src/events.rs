//! Event-handler registration and the shim's five handlers.
//!
//! Registration completions arrive asynchronously through a single reply
//! slot, so registrations are strictly serialised: the serial mutex is held
//! for the whole register-then-wait round trip.

use std::sync::Arc;

use tracing::{debug, error};

use crate::context::{ShimContext, TerminationOrigin};
use crate::error::Error;
use crate::pmix::{Event, EventHandler, HandlerId, Info, InfoKey, PmixStatus, Proc, Value};
use crate::shutdown;

/// Register one handler and wait for its id.
fn register_handler(
    ctx: &Arc<ShimContext>,
    name: &'static str,
    codes: &[PmixStatus],
    affected: Option<&Proc>,
    handler: EventHandler,
) -> Result<HandlerId, Error> {
    let _serial = ctx.registration_serial().lock().unwrap();
    let mut attrs = vec![Info::string(InfoKey::EventHdlrName, name)];
    if let Some(proc) = affected {
        attrs.push(Info::new(
            InfoKey::EventAffectedProc,
            Value::Proc(proc.clone()),
        ));
    }
    ctx.clear_registration_reply();
    let reply_ctx = Arc::clone(ctx);
    ctx.tool().register_event_handler(
        codes,
        &attrs,
        handler,
        Box::new(move |reply| {
            reply_ctx.store_registration_reply(reply);
            reply_ctx.latches().registration.post();
        }),
    );
    ctx.latches()
        .registration
        .wait(|| ctx.launcher_terminated());
    let reply = ctx
        .take_registration_reply()
        .ok_or(Error::Interrupted("event-handler registration"))?;
    reply
        .status
        .check()
        .map_err(|err| Error::pmix("event-handler registration", err))?;
    debug!(handler = name, id = reply.id.0, "event handler registered");
    Ok(reply.id)
}

/// The catch-all handler, registered before every other one.
///
/// Its one real job is the lost-server case: when the last session drops
/// away inside a callback, a full finalize could deadlock in the library, so
/// it unblocks the driver and leaves through the callback-safe exit.
pub(crate) fn register_default_handler(ctx: &Arc<ShimContext>) -> Result<HandlerId, Error> {
    let hctx = Arc::clone(ctx);
    let handler: EventHandler = Arc::new(move |event: Event, completion| {
        if event.status == PmixStatus::LostConnectionToServer {
            if hctx.session_count() <= 1 {
                error!("lost connection to the PMIx server, terminating");
                hctx.release_all_latches();
                completion.complete(PmixStatus::EventActionComplete);
                shutdown::terminate(1);
            }
            hctx.decrement_sessions();
        }
        completion.complete(PmixStatus::EventActionComplete);
    });
    register_handler(ctx, "mpir-shim-default", &[], None, handler)
}

/// Watches for the launcher's launch-complete event and learns the
/// application namespace from it.
pub(crate) fn register_launch_complete_handler(
    ctx: &Arc<ShimContext>,
) -> Result<HandlerId, Error> {
    let hctx = Arc::clone(ctx);
    let handler: EventHandler = Arc::new(move |event: Event, completion| {
        // Several namespaces may ride along; the application is the last one.
        let mut nspace = None;
        for info in &event.info {
            if let (InfoKey::Nspace, Value::String(value)) = (info.key, &info.value) {
                nspace = Some(value.clone());
            }
        }
        let Some(nspace) = nspace else {
            completion.complete(PmixStatus::EventActionComplete);
            shutdown::fatal(&hctx, "launch-complete event carried no application namespace");
        };
        debug!(namespace = %nspace, "launch complete");
        hctx.set_application(Proc::wildcard(nspace));
        hctx.latches().launch_complete.post();
        completion.complete(PmixStatus::EventActionComplete);
    });
    register_handler(
        ctx,
        "mpir-shim-launch-complete",
        &[PmixStatus::LaunchComplete],
        None,
        handler,
    )
}

/// Watches for the launcher pausing for debugger directives.
pub(crate) fn register_launcher_ready_handler(
    ctx: &Arc<ShimContext>,
    launcher: &Proc,
) -> Result<HandlerId, Error> {
    let hctx = Arc::clone(ctx);
    let handler: EventHandler = Arc::new(move |_event: Event, completion| {
        debug!("launcher ready for debug");
        hctx.latches().ready_for_debug.post();
        completion.complete(PmixStatus::EventActionComplete);
    });
    register_handler(
        ctx,
        "mpir-shim-launcher-ready",
        &[PmixStatus::ReadyForDebug],
        Some(launcher),
        handler,
    )
}

/// Watches for the launcher's own termination.
pub(crate) fn register_launcher_terminated_handler(
    ctx: &Arc<ShimContext>,
    launcher: &Proc,
) -> Result<HandlerId, Error> {
    let hctx = Arc::clone(ctx);
    let handler: EventHandler = Arc::new(move |event: Event, completion| {
        let code = exit_code_from(&event.info);
        debug!(code, "launcher terminated");
        hctx.record_job_termination(TerminationOrigin::Launcher, code);
        completion.complete(PmixStatus::EventActionComplete);
    });
    register_handler(
        ctx,
        "mpir-shim-launcher-terminated",
        &[PmixStatus::JobTerminated],
        Some(launcher),
        handler,
    )
}

/// Watches for the application's termination (proxy mode only, where the
/// launcher's server survives the application).
pub(crate) fn register_application_terminated_handler(
    ctx: &Arc<ShimContext>,
    application: &Proc,
) -> Result<HandlerId, Error> {
    let hctx = Arc::clone(ctx);
    let handler: EventHandler = Arc::new(move |event: Event, completion| {
        let code = exit_code_from(&event.info);
        debug!(code, "application terminated");
        hctx.record_job_termination(TerminationOrigin::Application, code);
        completion.complete(PmixStatus::EventActionComplete);
    });
    register_handler(
        ctx,
        "mpir-shim-application-terminated",
        &[PmixStatus::JobTerminated],
        Some(application),
        handler,
    )
}

/// Exit code carried by a termination event: prefer the explicit exit code,
/// fall back to the job termination status.
fn exit_code_from(info: &[Info]) -> i32 {
    let mut fallback = 0;
    for item in info {
        match (item.key, &item.value) {
            (InfoKey::ExitCode, Value::I32(code)) => return *code,
            (InfoKey::JobTermStatus, Value::I32(code)) => fallback = *code,
            _ => {}
        }
    }
    fallback
}

#[cfg(test)]
mod test {
    use std::thread;

    use crate::mode::{RunMode, ShimOptions};
    use crate::pmix::sim::SimTool;
    use crate::pmix::Rank;

    use super::*;

    fn context(tool: &SimTool) -> Arc<ShimContext> {
        let options = ShimOptions {
            mode: RunMode::Proxy,
            run_args: vec!["mpirun".into(), "./app".into()],
            ..ShimOptions::default()
        };
        ShimContext::new(Box::new(tool.clone()), options)
    }

    #[test]
    fn registration_returns_the_assigned_id() {
        let tool = SimTool::default();
        let ctx = context(&tool);
        let first = register_default_handler(&ctx).unwrap();
        let second = register_launch_complete_handler(&ctx).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn concurrent_registrations_never_cross_replies() {
        let tool = SimTool::default();
        let ctx = context(&tool);
        let launcher = Proc::new("prterun.4321", Rank::Number(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ctx = Arc::clone(&ctx);
            let launcher = launcher.clone();
            handles.push(thread::spawn(move || {
                register_launcher_ready_handler(&ctx, &launcher).unwrap()
            }));
        }
        let mut ids: Vec<u64> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().0)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn lost_connection_with_spare_sessions_only_decrements() {
        let tool = SimTool::default();
        let ctx = context(&tool);
        ctx.init_tool().unwrap();
        ctx.increment_sessions();
        ctx.increment_sessions();
        register_default_handler(&ctx).unwrap();
        assert_eq!(ctx.session_count(), 2);

        // Deliver the event through the simulator so it runs on its thread.
        let emitter = tool.clone();
        let handle = thread::spawn(move || {
            emitter.notify_lost_connection();
        });
        handle.join().unwrap();
        assert_eq!(ctx.session_count(), 1);
    }

    #[test]
    fn termination_events_prefer_the_exit_code() {
        let info = vec![
            Info::new(InfoKey::JobTermStatus, Value::I32(7)),
            Info::new(InfoKey::ExitCode, Value::I32(42)),
        ];
        assert_eq!(exit_code_from(&info), 42);

        let info = vec![Info::new(InfoKey::JobTermStatus, Value::I32(7))];
        assert_eq!(exit_code_from(&info), 7);

        assert_eq!(exit_code_from(&[]), 0);
    }
}

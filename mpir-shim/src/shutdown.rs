//! Signal interception and end-of-process cleanup.

use std::sync::Arc;
use std::thread;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, error};

use crate::context::ShimContext;
use crate::error::Error;
use crate::mpir;

/// Intercept the termination signals and run the orderly teardown.
///
/// The watcher runs on its own thread (signal-hook installs the actual
/// handlers with `SA_RESTART`), so the teardown may take whatever locks
/// finalize needs.
pub(crate) fn install_signal_handlers(ctx: &Arc<ShimContext>) -> Result<(), Error> {
    let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM]).map_err(Error::SignalSetup)?;
    let ctx = Arc::clone(ctx);
    thread::Builder::new()
        .name("mpir-shim-signals".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                debug!(signal, "termination signal caught");
                ctx.finalize_tool();
                mpir::free_proctable();
                terminate(1);
            }
        })
        .map_err(Error::SignalSetup)?;
    Ok(())
}

/// Runs the idempotent teardown when the driver scope unwinds; the Rust
/// rendering of an atexit finalizer.
pub(crate) struct TeardownGuard {
    ctx: Arc<ShimContext>,
}

impl TeardownGuard {
    pub(crate) fn new(ctx: Arc<ShimContext>) -> Self {
        TeardownGuard { ctx }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.ctx.finalize_tool();
        mpir::free_proctable();
    }
}

/// Report an unrecoverable violation, tear the tool down, and leave.
pub(crate) fn fatal(ctx: &ShimContext, message: &str) -> ! {
    error!("{message}");
    eprintln!("mpir-shim: {message}");
    ctx.finalize_tool();
    terminate(1);
}

/// Leave without re-entering the library. This is the callback-safe path:
/// finalize from inside a PMIx callback can deadlock, so callers broadcast
/// the latches and come straight here.
pub(crate) fn terminate(code: i32) -> ! {
    #[cfg(feature = "test")]
    mpir::testing::invoke_exit_hook(code);
    std::process::exit(code);
}

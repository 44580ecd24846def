//! The exported MPIR process-acquisition surface.
//!
//! Parallel debuggers locate these symbols in the shim's symbol table: they
//! plant a breakpoint on [`MPIR_Breakpoint`], and when it hits they read
//! [`MPIR_debug_state`] and walk `MPIR_proctable[0..MPIR_proctable_size]`.
//! Symbol names, types and the [`MPIR_PROCDESC`] field layout are an external
//! contract and must not change.

#![allow(non_camel_case_types, non_snake_case, non_upper_case_globals)]

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::Mutex;

/// [`MPIR_debug_state`] before any job exists.
pub const MPIR_DEBUG_NULL: c_int = 0;
/// [`MPIR_debug_state`] once the proctable describes a spawned job.
pub const MPIR_DEBUG_SPAWNED: c_int = 1;
/// [`MPIR_debug_state`] when the job died on the way up or down.
pub const MPIR_DEBUG_ABORTING: c_int = 2;

/// One row of [`MPIR_proctable`]: where an MPI rank runs and as what.
///
/// Field order and sizes are observable through debug symbols and are fixed.
#[repr(C)]
#[derive(Debug)]
pub struct MPIR_PROCDESC {
    /// Null-terminated name of the host the process runs on.
    pub host_name: *mut c_char,
    /// Null-terminated path of the executable the process runs.
    pub executable_name: *mut c_char,
    /// Operating-system pid of the process.
    pub pid: c_int,
}

/// Non-zero while a debugger drives this process. The shim never writes it;
/// the debugger does, through process memory.
#[no_mangle]
pub static mut MPIR_being_debugged: c_int = 0;

/// The process-descriptor table, one row per MPI rank.
#[no_mangle]
pub static mut MPIR_proctable: *mut MPIR_PROCDESC = ptr::null_mut();

/// Number of rows in [`MPIR_proctable`].
#[no_mangle]
pub static mut MPIR_proctable_size: c_int = 0;

/// Where the job stands: null, spawned, or aborting.
#[no_mangle]
pub static mut MPIR_debug_state: c_int = MPIR_DEBUG_NULL;

/// Human-readable abort reason, lazily allocated when a job dies unclean.
#[no_mangle]
pub static mut MPIR_debug_abort_string: *mut c_char = ptr::null_mut();

/// Presence declares this process a starter, not MPI rank 0.
#[no_mangle]
pub static mut MPIR_i_am_starter: c_int = 0;

/// Presence flag read by some debuggers; never assigned.
#[no_mangle]
pub static mut MPIR_force_to_main: c_int = 0;

/// Presence flag read by some debuggers; never assigned.
#[no_mangle]
pub static mut MPIR_partial_attach_ok: c_int = 0;

/// Presence flag read by some debuggers; never assigned.
#[no_mangle]
pub static mut MPIR_ignore_queues: c_int = 0;

/// Serialises every shim-side write to the surface. The debugger reads the
/// fields asynchronously, hence the volatile single-store accesses below.
static MPIR_WRITE_LOCK: Mutex<()> = Mutex::new(());

/// Debugger breakpoint target.
///
/// Deliberately empty: debuggers plant a breakpoint on this symbol and
/// inspect the other MPIR globals when it is hit. It must never be inlined
/// into a caller or the symbol disappears from the table.
#[no_mangle]
#[inline(never)]
pub extern "C" fn MPIR_Breakpoint() {
    #[cfg(feature = "test")]
    testing::run_breakpoint_hook();
}

/// Advance the published debug state.
///
/// The debugger must only ever observe the sequence null, spawned, aborting;
/// a late spawned-store must not roll an abort back, so stores are monotonic.
pub(crate) fn advance_debug_state(state: c_int) {
    let _guard = MPIR_WRITE_LOCK.lock().unwrap();
    unsafe {
        let current = ptr::addr_of!(MPIR_debug_state).read_volatile();
        if state > current {
            ptr::addr_of_mut!(MPIR_debug_state).write_volatile(state);
        }
    }
}

/// Read back the currently published debug state.
pub fn debug_state() -> c_int {
    unsafe { ptr::addr_of!(MPIR_debug_state).read_volatile() }
}

/// Publish the abort reason unless one is already visible; first writer wins.
pub(crate) fn publish_abort(reason: &str) {
    let _guard = MPIR_WRITE_LOCK.lock().unwrap();
    unsafe {
        if !ptr::addr_of!(MPIR_debug_abort_string)
            .read_volatile()
            .is_null()
        {
            return;
        }
        let Ok(reason) = CString::new(reason) else {
            return;
        };
        ptr::addr_of_mut!(MPIR_debug_abort_string).write_volatile(reason.into_raw());
    }
}

/// A copy of the currently published abort reason, if any.
pub fn abort_string() -> Option<String> {
    let _guard = MPIR_WRITE_LOCK.lock().unwrap();
    unsafe {
        let reason = ptr::addr_of!(MPIR_debug_abort_string).read_volatile();
        (!reason.is_null()).then(|| CStr::from_ptr(reason).to_string_lossy().into_owned())
    }
}

/// Publish a fully-built descriptor table. The table is written exactly once
/// per job and stays read-only until [`free_proctable`].
pub(crate) fn publish_proctable(descs: Vec<MPIR_PROCDESC>) {
    let _guard = MPIR_WRITE_LOCK.lock().unwrap();
    let size = descs.len() as c_int;
    let table = Box::into_raw(descs.into_boxed_slice());
    unsafe {
        ptr::addr_of_mut!(MPIR_proctable).write_volatile(table as *mut MPIR_PROCDESC);
        ptr::addr_of_mut!(MPIR_proctable_size).write_volatile(size);
    }
}

/// Free the published table and its strings; a no-op when nothing is
/// published, so every shutdown path may call it.
pub(crate) fn free_proctable() {
    let _guard = MPIR_WRITE_LOCK.lock().unwrap();
    unsafe {
        let table = ptr::addr_of!(MPIR_proctable).read_volatile();
        let size = ptr::addr_of!(MPIR_proctable_size).read_volatile();
        if table.is_null() {
            return;
        }
        ptr::addr_of_mut!(MPIR_proctable).write_volatile(ptr::null_mut());
        ptr::addr_of_mut!(MPIR_proctable_size).write_volatile(0);
        let slice = ptr::slice_from_raw_parts_mut(table, size as usize);
        for desc in (*slice).iter_mut() {
            if !desc.host_name.is_null() {
                drop(CString::from_raw(desc.host_name));
            }
            if !desc.executable_name.is_null() {
                drop(CString::from_raw(desc.executable_name));
            }
        }
        drop(Box::from_raw(slice));
    }
}

#[cfg(feature = "test")]
pub mod testing {
    //! Helpers for exercising the shim without a live debugger attached.

    use std::ffi::{CStr, CString};
    use std::ptr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::{MPIR_DEBUG_NULL, MPIR_WRITE_LOCK};

    type BreakpointHook = Box<dyn Fn() + Send + Sync>;
    type ExitHook = Box<dyn Fn(i32) + Send + Sync>;

    static BREAKPOINT_HOOK: Mutex<Option<BreakpointHook>> = Mutex::new(None);
    static EXIT_HOOK: Mutex<Option<ExitHook>> = Mutex::new(None);
    static SUPPRESS_APPLICATION_RELEASE: AtomicBool = AtomicBool::new(false);

    /// Install (or replace) a function invoked when [`super::MPIR_Breakpoint`]
    /// fires, in place of a debugger's breakpoint.
    pub fn set_breakpoint_hook(hook: impl Fn() + Send + Sync + 'static) {
        *BREAKPOINT_HOOK.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn run_breakpoint_hook() {
        if let Some(hook) = BREAKPOINT_HOOK.lock().unwrap().as_ref() {
            hook();
        }
    }

    /// Intercept process termination. The hook must not hand control back;
    /// the terminating thread panics if it does.
    pub fn set_exit_hook(hook: impl Fn(i32) + Send + Sync + 'static) {
        *EXIT_HOOK.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn invoke_exit_hook(code: i32) {
        if let Some(hook) = EXIT_HOOK.lock().unwrap().as_ref() {
            hook(code);
            panic!("exit hook returned control to a terminating thread");
        }
    }

    /// Keep the driver from releasing the application after the breakpoint,
    /// so a test can drive the release itself.
    pub fn suppress_application_release(suppress: bool) {
        SUPPRESS_APPLICATION_RELEASE.store(suppress, Ordering::SeqCst);
    }

    pub(crate) fn application_release_suppressed() -> bool {
        SUPPRESS_APPLICATION_RELEASE.load(Ordering::SeqCst)
    }

    /// One row of [`proctable_snapshot`].
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct ProcDescSnapshot {
        /// Host the process runs on.
        pub host_name: String,
        /// Executable the process runs.
        pub executable_name: String,
        /// Operating-system pid.
        pub pid: i32,
    }

    /// A deep copy of the currently published proctable, the way a debugger
    /// would read it.
    pub fn proctable_snapshot() -> Vec<ProcDescSnapshot> {
        let _guard = MPIR_WRITE_LOCK.lock().unwrap();
        unsafe {
            let table = ptr::addr_of!(super::MPIR_proctable).read_volatile();
            let size = ptr::addr_of!(super::MPIR_proctable_size).read_volatile();
            if table.is_null() {
                return Vec::new();
            }
            (0..size as usize)
                .map(|index| {
                    let desc = &*table.add(index);
                    ProcDescSnapshot {
                        host_name: CStr::from_ptr(desc.host_name)
                            .to_string_lossy()
                            .into_owned(),
                        executable_name: CStr::from_ptr(desc.executable_name)
                            .to_string_lossy()
                            .into_owned(),
                        pid: desc.pid,
                    }
                })
                .collect()
        }
    }

    /// Return the MPIR surface to its pristine state between scenarios.
    pub fn reset() {
        super::free_proctable();
        {
            let _guard = MPIR_WRITE_LOCK.lock().unwrap();
            unsafe {
                ptr::addr_of_mut!(super::MPIR_debug_state).write_volatile(MPIR_DEBUG_NULL);
                let reason = ptr::addr_of!(super::MPIR_debug_abort_string).read_volatile();
                if !reason.is_null() {
                    ptr::addr_of_mut!(super::MPIR_debug_abort_string)
                        .write_volatile(ptr::null_mut());
                    drop(CString::from_raw(reason));
                }
            }
        }
        suppress_application_release(false);
        *BREAKPOINT_HOOK.lock().unwrap() = None;
        *EXIT_HOOK.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod test {
    use serial_test::serial;

    use super::*;

    fn desc(host: &str, exe: &str, pid: i32) -> MPIR_PROCDESC {
        MPIR_PROCDESC {
            host_name: CString::new(host).unwrap().into_raw(),
            executable_name: CString::new(exe).unwrap().into_raw(),
            pid,
        }
    }

    #[test]
    #[serial]
    fn debug_state_is_monotonic() {
        testing::reset();
        assert_eq!(debug_state(), MPIR_DEBUG_NULL);
        advance_debug_state(MPIR_DEBUG_SPAWNED);
        assert_eq!(debug_state(), MPIR_DEBUG_SPAWNED);
        advance_debug_state(MPIR_DEBUG_ABORTING);
        assert_eq!(debug_state(), MPIR_DEBUG_ABORTING);
        // A straggling spawned-store must not undo the abort.
        advance_debug_state(MPIR_DEBUG_SPAWNED);
        assert_eq!(debug_state(), MPIR_DEBUG_ABORTING);
        testing::reset();
    }

    #[test]
    #[serial]
    fn first_abort_reason_wins() {
        testing::reset();
        assert_eq!(abort_string(), None);
        publish_abort("The launcher exited with return code 42");
        publish_abort("The application exited with return code 1");
        assert_eq!(
            abort_string().as_deref(),
            Some("The launcher exited with return code 42")
        );
        testing::reset();
    }

    #[test]
    #[serial]
    fn proctable_publish_and_free_round_trip() {
        testing::reset();
        publish_proctable(vec![desc("node0", "./a", 100), desc("node1", "./a", 101)]);
        let rows = testing::proctable_snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].host_name, "node0");
        assert_eq!(rows[1].pid, 101);
        free_proctable();
        assert!(testing::proctable_snapshot().is_empty());
        // Freeing twice is fine.
        free_proctable();
        testing::reset();
    }
}

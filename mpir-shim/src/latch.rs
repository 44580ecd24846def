//! Re-armable named latches used to sequence the driver thread against
//! asynchronous PMIx events.

use std::sync::{Condvar, Mutex};

/// A bistable gate the driver thread parks on until an event handler opens it.
///
/// A latch starts armed. [`Latch::wait`] blocks while the latch is armed and
/// the supplied predicate reports the launcher still alive, then re-arms the
/// latch for the next round before returning. [`Latch::post`] disarms the
/// latch and wakes every waiter.
pub struct Latch {
    name: &'static str,
    armed: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Create an armed latch.
    pub fn new(name: &'static str) -> Self {
        Latch {
            name,
            armed: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    /// The name this latch was registered under.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block until the latch is posted or `terminated` reports true.
    ///
    /// The termination predicate is evaluated under the latch mutex so a wait
    /// can never outlive the launcher: handlers that observe the launcher gone
    /// flip the flag and then post every latch.
    pub fn wait(&self, terminated: impl Fn() -> bool) {
        let mut armed = self.armed.lock().unwrap();
        while *armed && !terminated() {
            armed = self.cond.wait(armed).unwrap();
        }
        // Re-arm under the same lock so a subsequent wait cannot miss a post.
        *armed = true;
    }

    /// Disarm the latch and wake every waiter.
    pub fn post(&self) {
        let mut armed = self.armed.lock().unwrap();
        *armed = false;
        self.cond.notify_all();
    }

    /// Whether a wait would currently block.
    pub fn is_armed(&self) -> bool {
        *self.armed.lock().unwrap()
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch")
            .field("name", &self.name)
            .field("armed", &self.is_armed())
            .finish()
    }
}

//! # Process record & child registry
//!
//! A [`ProcessRecord`] is the rendezvous point between a parent and one
//! child it created through `fork`. The parent allocates the record
//! *before* the child starts running, so a child that fails during
//! address-space duplication and a parent that calls `wait` long after the
//! child has already exited both observe the same state machine.
//!
//! ## Status
//!
//! [`Status`] advances monotonically: `YetInit -> {Created | Failed} ->
//! Terminated`. The record's [`Semaphore`] is signalled exactly twice over
//! its lifetime — once when the child leaves `YetInit`, once when it
//! terminates — so a consumer that observes the record already past the
//! stage it's waiting for can `try_wait` instead of blocking on a signal
//! that already happened.

use crate::sync::{Mutex, Semaphore};
use alloc::collections::BTreeMap;

/// A child's progress as observed through its [`ProcessRecord`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Status {
    /// The child has not yet reported whether it came up.
    YetInit,
    /// The child finished address-space/FD-table duplication and is
    /// running.
    Created,
    /// The child failed to come up; it has already exited with code -1.
    Failed,
    /// The child has run to completion (via `exit` or a fatal error) and
    /// its exit code is available.
    Terminated,
}

struct RecordState {
    status: Status,
    exit_code: i32,
}

/// The shared state of one parent/child relationship, keyed by the child's
/// task id in the parent's registry.
///
/// The semaphore is signalled twice over the record's life: once at
/// `Created`/`Failed`, once at `Terminated`. A waiter blocks only if the
/// transition it cares about hasn't happened yet; otherwise it consumes an
/// already-posted signal with `try_wait`, never double-blocking on the same
/// edge.
pub struct ProcessRecord {
    state: Mutex<RecordState>,
    signal: Semaphore<()>,
}

impl ProcessRecord {
    /// Creates a record for a child that has not yet started running.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RecordState {
                status: Status::YetInit,
                exit_code: 0,
            }),
            signal: Semaphore::new(0, ()),
        }
    }

    /// Called once by the child after it finishes (or fails) duplicating
    /// its inherited state.
    pub fn post_init(&self, created: bool) {
        let mut guard = self.state.lock();
        guard.status = if created {
            Status::Created
        } else {
            Status::Failed
        };
        guard.unlock();
        self.signal.signal();
    }

    /// Called once by the child when it terminates.
    pub fn post_exit(&self, exit_code: i32) {
        let mut guard = self.state.lock();
        guard.status = Status::Terminated;
        guard.exit_code = exit_code;
        guard.unlock();
        self.signal.signal();
    }

    /// Blocks, if necessary, until the child has left `YetInit`, then
    /// reports whether it came up.
    pub fn wait_for_init(&self) -> bool {
        let yet_init = {
            let guard = self.state.lock();
            let yet_init = guard.status == Status::YetInit;
            guard.unlock();
            yet_init
        };
        // forget, not drop: the permit's RAII drop re-`signal()`s, which would
        // hand this one-shot edge back to whoever calls next.
        if yet_init {
            core::mem::forget(self.signal.wait());
        } else {
            core::mem::forget(self.signal.try_wait());
        }
        let guard = self.state.lock();
        let created = guard.status == Status::Created;
        guard.unlock();
        created
    }

    /// Blocks, if necessary, until the child has terminated, then returns
    /// its exit code.
    pub fn wait_for_exit(&self) -> i32 {
        let terminated = {
            let guard = self.state.lock();
            let terminated = guard.status == Status::Terminated;
            guard.unlock();
            terminated
        };
        if !terminated {
            core::mem::forget(self.signal.wait());
        } else {
            core::mem::forget(self.signal.try_wait());
        }
        let guard = self.state.lock();
        let code = guard.exit_code;
        guard.unlock();
        code
    }
}

impl Default for ProcessRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// A parent's registry of children it has forked but not yet reaped via
/// `wait`. Keyed by task id; a successful `wait` removes the entry, so a
/// second `wait` on the same id always observes "not my child".
pub type ChildRegistry = Mutex<BTreeMap<u64, alloc::sync::Arc<ProcessRecord>>>;

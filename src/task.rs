//! The suspend/resume primitive user commands block on (§5).
//!
//! A naive "unlock, check, block, lock" sequence loses wakeups: a wake can
//! land between the unlock and the block. `std::sync::Condvar::wait`
//! already does the release-and-park atomically under the mutex that
//! guards it, so a [`Task`] is a thin wrapper keeping a waiter count (so
//! [`Task::has_waiters`] can answer `tcp_pcb_release`'s question) and a
//! cancellation flag a signal handler can set from outside the lock.
//!
//! Wakeups are broadcast: every blocked caller re-checks its own
//! precondition on return, exactly as `Condvar::wait_while` does.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, MutexGuard};

#[derive(Debug, Default)]
pub struct Task {
    cvar: Condvar,
    waiters: AtomicUsize,
    cancelled: AtomicBool,
    deadline_exceeded: AtomicBool,
}

impl Task {
    pub fn new() -> Self {
        Task::default()
    }

    /// Atomically release `guard`'s mutex and park the caller until woken.
    /// Returns `Err(())` if the task was cancelled while parked.
    pub fn suspend<'a, T>(&self, guard: MutexGuard<'a, T>) -> (MutexGuard<'a, T>, Result<(), ()>) {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let guard = self.cvar.wait(guard).unwrap();
        self.waiters.fetch_sub(1, Ordering::AcqRel);

        if self.cancelled.swap(false, Ordering::AcqRel) {
            (guard, Err(()))
        } else {
            (guard, Ok(()))
        }
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::Acquire) > 0
    }

    /// Broadcast wake: every suspended command re-checks its own state.
    pub fn wake_all(&self) {
        self.cvar.notify_all();
    }

    /// Mark the next (or currently) suspended call as cancelled, then wake
    /// it. Mirrors a signal delivered while a thread is parked in
    /// `sched_task_sleep`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cvar.notify_all();
    }

    /// Record that this descriptor's PCB was force-closed by the
    /// retransmission deadline (spec §4.D), so a waiter woken by that
    /// close can report `DeadlineExceeded` instead of a generic wrong-state
    /// error once it re-checks the PCB.
    pub fn mark_deadline_exceeded(&self) {
        self.deadline_exceeded.store(true, Ordering::Release);
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline_exceeded.load(Ordering::Acquire)
    }

    /// Reset waiter bookkeeping when a slot is recycled; the cancellation
    /// flag is intentionally left alone -- a slot with waiters still
    /// present is not released (see `Engine::release`).
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
        self.deadline_exceeded.store(false, Ordering::Release);
    }
}

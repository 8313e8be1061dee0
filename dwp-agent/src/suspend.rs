// Suspend/resume coordinator
//
// A global suspend count plus per-thread resume counts, all under one mutex
// with a condition variable. A thread may run while
// `count - resume_count == 0`. A counting semaphore lets the agent thread
// wait until every live thread has actually parked.

use crate::agent::Agent;
use crate::host::AsyncSuspend;
use crate::types::{ThreadContext, ThreadRef};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, error, trace};

/// Per-thread view of the suspend state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadPhase {
    Running,
    /// A suspend is pending and the thread has not parked yet
    Suspending,
    Suspended,
    Terminated,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct ThreadSuspend {
    pub resume_count: u32,
    /// Parked, either by itself or captured in native code
    pub suspended: bool,
    /// Parked by itself at a safepoint
    pub really_suspended: bool,
    pub terminated: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SuspendState {
    pub count: u32,
    pub threads: HashMap<ThreadRef, ThreadSuspend>,
}

impl SuspendState {
    /// Suspensions `thread` still has to honor
    pub fn outstanding(&self, thread: ThreadRef) -> u32 {
        let resumed = self.threads.get(&thread).map(|t| t.resume_count).unwrap_or(0);
        self.count.saturating_sub(resumed)
    }

    /// Live threads that are expected to park but have not yet
    pub fn threads_to_wait_for(&self) -> usize {
        if self.count == 0 {
            return 0;
        }
        self.threads
            .values()
            .filter(|t| !t.suspended && !t.terminated && t.resume_count < self.count)
            .count()
    }

    pub fn is_suspended(&self) -> bool {
        self.count > 0 && self.threads_to_wait_for() == 0
    }

    pub fn check_invariants(&self) {
        for (thread, t) in &self.threads {
            if t.resume_count > self.count {
                error!(
                    "Resume count {} of {:?} exceeds suspend count {}",
                    t.resume_count, thread, self.count
                );
                panic!(
                    "suspend invariant violated: resume count {} > suspend count {}",
                    t.resume_count, self.count
                );
            }
        }
    }
}

/// Counting semaphore posted by each thread as it parks
#[derive(Debug, Default)]
pub(crate) struct Semaphore {
    permits: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn post(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.cond.notify_one();
    }

    /// Take a permit, blocking until one is posted
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }
}

#[derive(Debug, Default)]
pub struct Coordinator {
    state: Mutex<SuspendState>,
    cond: Condvar,
    pub(crate) sem: Semaphore,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SuspendState> {
        self.state.lock()
    }

    pub fn suspend_count(&self) -> u32 {
        self.state.lock().count
    }

    /// True while any suspension is in effect or underway
    pub fn is_suspending(&self) -> bool {
        self.state.lock().count > 0
    }

    /// True once every live thread that should park has parked
    pub fn is_suspended(&self) -> bool {
        self.state.lock().is_suspended()
    }

    pub fn resume_count(&self, thread: ThreadRef) -> Option<u32> {
        self.state.lock().threads.get(&thread).map(|t| t.resume_count)
    }

    pub(crate) fn threads_to_wait_for(&self) -> usize {
        self.state.lock().threads_to_wait_for()
    }

    pub(crate) fn thread_phase(&self, thread: ThreadRef) -> Option<ThreadPhase> {
        let state = self.state.lock();
        let t = state.threads.get(&thread)?;
        Some(if t.terminated {
            ThreadPhase::Terminated
        } else if t.suspended {
            ThreadPhase::Suspended
        } else if state.outstanding(thread) > 0 {
            ThreadPhase::Suspending
        } else {
            ThreadPhase::Running
        })
    }

    /// True if `thread` is parked and its context can be inspected
    pub(crate) fn thread_stopped(&self, thread: ThreadRef) -> bool {
        self.state
            .lock()
            .threads
            .get(&thread)
            .map(|t| t.suspended)
            .unwrap_or(false)
    }

    pub(crate) fn really_suspended(&self, thread: ThreadRef) -> bool {
        self.state
            .lock()
            .threads
            .get(&thread)
            .map(|t| t.really_suspended)
            .unwrap_or(false)
    }

    pub(crate) fn add_thread(&self, thread: ThreadRef) {
        self.state.lock().threads.entry(thread).or_default();
    }

    pub(crate) fn thread_terminated(&self, thread: ThreadRef) {
        let mut state = self.state.lock();
        if let Some(t) = state.threads.get_mut(&thread) {
            t.terminated = true;
            t.suspended = false;
            t.really_suspended = false;
        }
        drop(state);
        // Whoever waits for this thread to park has to recount
        self.sem.post();
    }

    /// Give up `delta` individual resumptions of `thread`
    pub(crate) fn release_resume(&self, thread: ThreadRef, delta: u32) {
        let mut state = self.state.lock();
        if let Some(t) = state.threads.get_mut(&thread) {
            t.resume_count = t.resume_count.saturating_sub(delta);
        }
        state.check_invariants();
    }

    pub(crate) fn broadcast(&self) {
        self.cond.notify_all();
    }
}

impl Agent {
    /// Increment the global suspend count, interrupting every thread on 0 -> 1.
    ///
    /// `current` is the calling application thread, which parks by itself.
    pub(crate) fn suspend_vm(&self, current: Option<ThreadRef>) {
        let interrupt: Vec<ThreadRef> = {
            let mut reg = self.registry.lock();
            let mut state = self.coordinator.lock();

            state.count += 1;
            debug!("Suspending vm, count={}", state.count);
            state.check_invariants();

            if state.count != 1 {
                return;
            }
            self.start_single_stepping(&mut reg);

            state
                .threads
                .iter()
                .filter(|(thread, t)| Some(**thread) != current && !t.terminated && !t.suspended)
                .map(|(thread, _)| *thread)
                .collect()
        };

        // The host may block until the thread reaches a safe state, so no
        // lock is held here
        for thread in interrupt {
            let outcome = self.host.async_suspend(thread);

            let mut reg = self.registry.lock();
            let mut state = self.coordinator.lock();
            // Parked by itself or resumed in the meantime
            if state.outstanding(thread) == 0 {
                continue;
            }
            let Some(t) = state.threads.get_mut(&thread) else {
                continue;
            };
            if t.suspended || t.terminated {
                continue;
            }

            match outcome {
                AsyncSuspend::Cooperative => {}
                AsyncSuspend::Captured(ctx) => {
                    trace!("Captured {:?} in native code at {:?}", thread, ctx);
                    if let Some(tls) = reg.threads.get_mut(&thread) {
                        tls.save_context(ctx);
                    }
                    t.suspended = true;
                    self.coordinator.sem.post();
                }
                AsyncSuspend::Gone => {
                    t.terminated = true;
                    self.coordinator.sem.post();
                }
            }
        }
    }

    /// Decrement the global suspend count, letting threads go at 0
    pub(crate) fn resume_vm(&self) {
        let mut reg = self.registry.lock();
        let mut state = self.coordinator.lock();

        if state.count == 0 {
            error!("resume_vm called with suspend count 0");
            panic!("suspend invariant violated: resume with suspend count 0");
        }
        state.count -= 1;
        debug!("Resuming vm, count={}", state.count);

        let count = state.count;
        for t in state.threads.values_mut() {
            t.resume_count = t.resume_count.min(count);
        }

        if count == 0 {
            self.stop_single_stepping(&mut reg);
            reg.ids.vm_resumed();

            // Threads captured in native code never parked themselves
            for (thread, t) in state.threads.iter_mut() {
                if t.suspended && !t.really_suspended {
                    t.suspended = false;
                    if let Some(tls) = reg.threads.get_mut(thread) {
                        tls.invalidate();
                    }
                }
            }
        }

        state.check_invariants();
        self.coordinator.broadcast();
    }

    /// Resume until the suspend count reaches 0
    pub(crate) fn resume_all(&self) {
        while self.coordinator.suspend_count() > 0 {
            self.resume_vm();
        }
    }

    /// Let one thread run while the rest stay suspended. Returns how much its
    /// resume count grew.
    pub(crate) fn resume_thread(&self, thread: ThreadRef) -> u32 {
        let mut state = self.coordinator.lock();
        let count = state.count;
        let t = state.threads.entry(thread).or_default();
        let delta = count - t.resume_count;
        t.resume_count = count;
        debug!("Resuming {:?} alone, resume_count={}", thread, count);

        state.check_invariants();
        self.coordinator.broadcast();
        delta
    }

    /// Park the calling thread until the counters let it go, running any
    /// invoke queued for it in the meantime
    pub(crate) fn suspend_current(&self, thread: ThreadRef) {
        loop {
            {
                let mut state = self.coordinator.lock();
                let t = state.threads.entry(thread).or_default();
                t.really_suspended = true;
                if !t.suspended {
                    t.suspended = true;
                    self.coordinator.sem.post();
                }
                debug!("{:?} suspended", thread);

                while state.outstanding(thread) > 0 {
                    self.coordinator.cond.wait(&mut state);
                }

                if let Some(t) = state.threads.get_mut(&thread) {
                    t.suspended = false;
                    t.really_suspended = false;
                }
                debug!("{:?} resumed", thread);
            }

            let pending = self
                .registry
                .lock()
                .threads
                .get_mut(&thread)
                .and_then(|tls| tls.pending_invoke.take());

            match pending {
                Some(invoke) => self.invoke_method(thread, invoke),
                None => break,
            }
        }

        if let Some(tls) = self.registry.lock().threads.get_mut(&thread) {
            tls.invalidate();
            tls.resumed_at = Instant::now();
        }
    }

    /// Block until every live thread that should park has parked. Each post
    /// marks one thread parking or ending; permits left over from earlier
    /// suspensions only cost a recount.
    pub(crate) fn wait_for_suspend(&self) {
        loop {
            let waiting = self.coordinator.threads_to_wait_for();
            if waiting == 0 {
                break;
            }
            debug!("Waiting for {} threads to suspend", waiting);
            self.coordinator.sem.wait();
        }
    }

    /// Park at a safepoint if a suspension is pending for this thread
    pub(crate) fn try_process_suspend(&self, thread: ThreadRef, ctx: &ThreadContext) -> bool {
        {
            let state = self.coordinator.lock();
            if state.count == 0 || state.outstanding(thread) == 0 {
                return false;
            }
        }

        {
            let mut reg = self.registry.lock();
            let Some(tls) = reg.threads.get_mut(&thread) else {
                return false;
            };
            // Invokes run to completion
            if tls.invoke.is_some() {
                return false;
            }
            tls.save_context(ctx.clone());
        }

        self.suspend_current(thread);
        true
    }
}

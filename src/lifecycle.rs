/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cooperative start-up and shutdown coordination between a node's threads.
//!
//! Both objects are created by [`NodeSpec::start`](crate::node::NodeSpec::start) and handed by clone to
//! every worker thread at spawn time:
//! - [`ExitFlag`] is the cancellation token. Every blocking wait in the crate goes through it or is
//!   bounded by a short timeout after which the flag is checked.
//! - [`StartBarrier`] holds workers back until the node has bootstrapped its chain state.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::errors::ExitRequested;

type Waker = Box<dyn Fn() + Send>;

#[derive(Clone)]
pub struct ExitFlag {
    inner: Arc<ExitFlagInner>,
}

struct ExitFlagInner {
    requested: AtomicBool,
    failed: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
    wakers: Mutex<Vec<Waker>>,
}

impl ExitFlag {
    pub fn new() -> ExitFlag {
        ExitFlag {
            inner: Arc::new(ExitFlagInner {
                requested: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                lock: Mutex::new(()),
                condvar: Condvar::new(),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Set the flag and wake every thread parked in [`sleep`](Self::sleep) or on a condition variable
    /// that registered a waker. Idempotent.
    pub fn request_exit(&self) {
        if self.inner.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let _guard = lock_ignoring_poison(&self.inner.lock);
            self.inner.condvar.notify_all();
        }
        for wake in lock_ignoring_poison(&self.inner.wakers).iter() {
            wake()
        }
    }

    pub fn is_exit_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Whether exit was requested through [`exit_on_fatal_error`](Self::exit_on_fatal_error).
    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// `Err(ExitRequested)` once exit has been requested.
    pub fn check(&self) -> Result<(), ExitRequested> {
        if self.is_exit_requested() {
            Err(ExitRequested)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, returning early with `Err(ExitRequested)` if exit is requested meanwhile.
    pub fn sleep(&self, duration: Duration) -> Result<(), ExitRequested> {
        let deadline = Instant::now() + duration;
        let mut guard = lock_ignoring_poison(&self.inner.lock);
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            guard = match self.inner.condvar.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Register a closure to be called once when exit is requested. Used by components that park on
    /// their own condition variables. If exit was already requested, `wake` is called immediately.
    pub fn register_waker(&self, wake: impl Fn() + Send + 'static) {
        let mut wakers = lock_ignoring_poison(&self.inner.wakers);
        if self.is_exit_requested() {
            wake();
        } else {
            wakers.push(Box::new(wake));
        }
    }

    /// Log `error` and bring the whole node down. Called when an invariant is violated or storage
    /// fails, i.e., whenever continuing could threaten safety.
    pub fn exit_on_fatal_error(&self, context: &str, error: &dyn Display) {
        log::error!("fatal error in {}: {}. Requesting node exit.", context, error);
        self.inner.failed.store(true, Ordering::SeqCst);
        self.request_exit();
    }
}

impl Default for ExitFlag {
    fn default() -> Self {
        ExitFlag::new()
    }
}

/// Holds worker threads back until [`signal_start`](Self::signal_start) is called. Single writer: the
/// start-up thread.
#[derive(Clone)]
pub struct StartBarrier {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StartBarrier {
    pub fn new() -> StartBarrier {
        StartBarrier {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn signal_start(&self) {
        let (started, condvar) = &*self.inner;
        *lock_ignoring_poison(started) = true;
        condvar.notify_all();
    }

    pub fn is_started(&self) -> bool {
        *lock_ignoring_poison(&self.inner.0)
    }

    /// Block until start is signalled or exit is requested, whichever comes first.
    pub fn wait_for_start(&self, exit: &ExitFlag) -> Result<(), ExitRequested> {
        let (started, condvar) = &*self.inner;
        let mut started = lock_ignoring_poison(started);
        while !*started {
            exit.check()?;
            started = match condvar.wait_timeout(started, Duration::from_millis(50)) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        Ok(())
    }
}

impl Default for StartBarrier {
    fn default() -> Self {
        StartBarrier::new()
    }
}

// The data behind these locks is a flag or a list of wakers, both valid whatever a panicking holder
// was doing.
fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later

//! Cancellation contexts shared between the pool, its workers and callers.
//!
//! A [`Context`] is a cheap handle (an `Arc` inside). Child contexts inherit
//! their parent's cancellation and the earlier of the two deadlines.
//! Cancelling a parent wakes every child blocked in [`Context::sleep`].

use crate::error::{EngineError, EngineResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<Context>,
    children: Mutex<Vec<Weak<Inner>>>,
    lock: Mutex<()>,
    wake: Condvar,
}

impl Inner {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let _guard = self.lock.lock();
            self.wake.notify_all();
        }
        let children: Vec<_> = self.children.lock().drain(..).collect();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

impl Context {
    /// A root context that is never done unless cancelled.
    pub fn background() -> Self {
        Self::build(None, None)
    }

    fn build(parent: Option<Context>, deadline: Option<Instant>) -> Self {
        let inherited = parent.as_ref().and_then(Context::deadline);
        let deadline = match (inherited, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let ctx = Context {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline,
                parent: parent.clone(),
                children: Mutex::new(Vec::new()),
                lock: Mutex::new(()),
                wake: Condvar::new(),
            }),
        };
        if let Some(parent) = parent {
            let mut children = parent.inner.children.lock();
            children.retain(|child| child.strong_count() > 0);
            children.push(Arc::downgrade(&ctx.inner));
            drop(children);
            // The parent may have been cancelled while we registered.
            if parent.is_cancelled() {
                ctx.cancel();
            }
        }
        ctx
    }

    pub fn with_cancel(&self) -> Self {
        Self::build(Some(self.clone()), None)
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self::build(Some(self.clone()), Instant::now().checked_add(timeout))
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self::build(Some(self.clone()), Some(deadline))
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<EngineError> {
        if self.is_cancelled() {
            return Some(EngineError::Cancelled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(EngineError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Sleeps for `duration`, returning early with the context's error if it
    /// is cancelled or its deadline passes first.
    pub fn sleep(&self, duration: Duration) -> EngineResult<()> {
        // `None` means the wake time is past what `Instant` can hold.
        let wake_at = Instant::now().checked_add(duration);
        let mut guard = self.inner.lock.lock();
        loop {
            if let Some(err) = self.err() {
                return Err(err);
            }
            if wake_at.is_some_and(|wake_at| Instant::now() >= wake_at) {
                return Ok(());
            }
            match (wake_at, self.inner.deadline) {
                (Some(wake_at), Some(deadline)) => {
                    self.inner.wake.wait_until(&mut guard, wake_at.min(deadline));
                }
                (Some(until), None) | (None, Some(until)) => {
                    self.inner.wake.wait_until(&mut guard, until);
                }
                (None, None) => self.inner.wake.wait(&mut guard),
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("done", &self.is_done())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

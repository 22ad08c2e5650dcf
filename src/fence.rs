//! Shared fence object.
//!
//! Both fence kinds are reference-counted `Fence` values: the timeline
//! listener, the fd table and any waiter each hold their own `Arc`.
//! Signaling latches once; waiters and registered callbacks are woken at
//! that moment.

use crate::error::{FenceError, Result};
use crate::listener::value_reached;
use crate::timeline::{TimelineInner, TimelineRef};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Allocate `num` consecutive fence contexts and return the first.
pub fn context_alloc(num: u64) -> u64 {
    NEXT_CONTEXT.fetch_add(num, Ordering::Relaxed)
}

type FenceCallback = Box<dyn FnOnce(&Fence) + Send>;

pub(crate) enum FenceKind {
    /// Producer-driven; reports signaled whenever asked.
    Acquire,
    /// Signaled once the timeline reaches the fence's seqno.
    Release { timeline: Weak<TimelineInner> },
}

struct FenceState {
    signaled: bool,
    signaling_enabled: bool,
    timestamp: Option<Instant>,
    callbacks: Vec<FenceCallback>,
}

pub struct Fence {
    context: u64,
    seqno: u64,
    name: String,
    kind: FenceKind,
    state: Mutex<FenceState>,
    signaled_cv: Condvar,
}

impl Fence {
    pub(crate) fn new(context: u64, seqno: u64, name: String, kind: FenceKind) -> Arc<Self> {
        Arc::new(Self {
            context,
            seqno,
            name,
            kind,
            state: Mutex::new(FenceState {
                signaled: false,
                signaling_enabled: false,
                timestamp: None,
                callbacks: Vec::new(),
            }),
            signaled_cv: Condvar::new(),
        })
    }

    pub fn context(&self) -> u64 {
        self.context
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver_name(&self) -> &'static str {
        "dpu"
    }

    pub fn timeline_name(&self) -> String {
        match &self.kind {
            FenceKind::Acquire => "acquire".to_string(),
            FenceKind::Release { timeline } => timeline
                .upgrade()
                .map(|tl| tl.name().to_string())
                .unwrap_or_else(|| "detached".to_string()),
        }
    }

    pub fn is_release(&self) -> bool {
        matches!(self.kind, FenceKind::Release { .. })
    }

    /// Back-reference to the owning timeline, for release fences.
    pub fn timeline(&self) -> Option<TimelineRef> {
        match &self.kind {
            FenceKind::Acquire => None,
            FenceKind::Release { timeline } => Some(TimelineRef(Weak::clone(timeline))),
        }
    }

    /// Always succeeds.
    pub fn enable_signaling(&self) -> bool {
        self.state.lock().signaling_enabled = true;
        true
    }

    pub fn signaling_enabled(&self) -> bool {
        self.state.lock().signaling_enabled
    }

    fn kind_signaled(&self) -> bool {
        match &self.kind {
            FenceKind::Acquire => true,
            // Nothing can advance a dropped timeline.
            FenceKind::Release { timeline } => match timeline.upgrade() {
                Some(tl) => value_reached(tl.pt_value(), self.seqno),
                None => true,
            },
        }
    }

    /// Check for completion, latching the signal if the kind reports it.
    pub fn is_signaled(&self) -> bool {
        if self.state.lock().signaled {
            return true;
        }
        if self.kind_signaled() {
            self.signal();
            return true;
        }
        false
    }

    /// Latch the fence signaled and wake everything waiting on it.
    ///
    /// Returns `false` if it was already signaled.
    pub fn signal(&self) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.signaled {
                return false;
            }
            state.signaled = true;
            state.timestamp = Some(Instant::now());
            std::mem::take(&mut state.callbacks)
        };
        self.signaled_cv.notify_all();

        trace!(fence = %self.name, context = self.context, seqno = self.seqno, "Fence signaled");
        for callback in callbacks {
            callback(self);
        }
        true
    }

    /// When the fence was latched signaled.
    pub fn timestamp(&self) -> Option<Instant> {
        self.state.lock().timestamp
    }

    /// Run `callback` once the fence signals.
    ///
    /// Returns `false` without registering if the fence is already signaled.
    pub fn add_callback<F>(&self, callback: F) -> bool
    where
        F: FnOnce(&Fence) + Send + 'static,
    {
        if self.is_signaled() {
            return false;
        }
        let mut state = self.state.lock();
        if state.signaled {
            return false;
        }
        state.signaling_enabled = true;
        state.callbacks.push(Box::new(callback));
        true
    }

    /// Block until signaled or `timeout` elapses. A zero timeout polls.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        if self.is_signaled() {
            return Ok(());
        }
        self.enable_signaling();

        let deadline = Instant::now().checked_add(timeout);
        {
            let mut state = self.state.lock();
            while !state.signaled {
                match deadline {
                    Some(deadline) => {
                        if self.signaled_cv.wait_until(&mut state, deadline).timed_out() {
                            break;
                        }
                    }
                    None => self.signaled_cv.wait(&mut state),
                }
            }
        }

        if self.is_signaled() {
            Ok(())
        } else {
            Err(FenceError::Timeout(timeout))
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("seqno", &self.seqno)
            .field("signaled", &self.state.lock().signaled)
            .finish()
    }
}

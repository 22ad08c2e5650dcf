//! Monotonic completion timeline.
//!
//! A timeline owns one completion counter (`pt_value`) for a hardware
//! pipeline stage, plus the bookkeeping for values handed out to fence
//! creators but not yet completed. Listeners attached to target values are
//! drained, in creation order, by a dedicated worker thread each time an
//! interrupt reports a completed step.
//!
//! Locking: counters live under the value lock and are only ever touched for
//! O(1) work. The listener list has its own lock, held for a whole drain,
//! because listener teardown may block. The list lock may be taken before the
//! value lock, never the other way round.

use crate::config::TimelineConfig;
use crate::error::{FenceError, Result};
use crate::fence::context_alloc;
use crate::isr::{IsrNotification, IsrRegistration, IsrSource};
use crate::listener::{Listener, TimelineListener};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Counter value of a freshly created timeline.
pub const INITIAL_PT_VALUE: u64 = 1;

/// Advance applied by `resync` when the observed value is not ahead.
const RESYNC_FORCE_ADVANCE: u64 = 2;

#[derive(Debug, Clone, Copy)]
struct Counters {
    pt_value: u64,
    next_value: u32,
    inc_step: u32,
}

/// Worker wake-up state.
struct Doorbell {
    queued: bool,
    stop: bool,
    requested: u64,
    completed: u64,
}

pub(crate) struct TimelineInner {
    name: String,
    listening_id: u32,
    context: u64,
    values: Mutex<Counters>,
    listeners: Mutex<Vec<Listener>>,
    doorbell: Mutex<Doorbell>,
    doorbell_cv: Condvar,
    force_recovery: AtomicBool,
    pending_frame_num: AtomicU32,
    last_step: Mutex<Option<Instant>>,
    drains: AtomicU64,
    stopped: AtomicBool,
}

impl TimelineInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn pt_value(&self) -> u64 {
        self.values.lock().pt_value
    }

    fn on_isr(&self, notification: &IsrNotification) {
        if notification.listening_id != self.listening_id {
            return;
        }
        *self.last_step.lock() = Some(notification.timestamp);
        self.notify_step();
    }

    /// Fold pending steps into `pt_value` and queue a drain.
    ///
    /// Returns whether a drain was queued.
    fn notify_step(&self) -> bool {
        let force = self.force_recovery.load(Ordering::Acquire);
        let pt_value = {
            let mut values = self.values.lock();
            if values.inc_step == 0 && !force {
                trace!(timeline = %self.name, pt_value = values.pt_value, "No pending step");
                return false;
            }
            values.pt_value = values.pt_value.wrapping_add(u64::from(values.inc_step));
            values.next_value = values.next_value.saturating_sub(values.inc_step);
            values.inc_step = 0;
            values.pt_value
        };

        trace!(timeline = %self.name, pt_value, force, "Timeline stepped");
        self.queue_drain()
    }

    /// Coalesced: a drain already queued always sees the latest value.
    fn queue_drain(&self) -> bool {
        let mut bell = self.doorbell.lock();
        if bell.stop || bell.queued {
            return false;
        }
        bell.queued = true;
        bell.requested += 1;
        self.doorbell_cv.notify_all();
        true
    }

    /// One pass over the listener list in creation order.
    fn drain(&self) {
        let mut list = self.listeners.lock();
        let tl_val = self.values.lock().pt_value;

        let pending = std::mem::take(&mut *list);
        let mut retired = 0usize;
        for mut listener in pending {
            if !listener.is_signaled(tl_val) {
                list.push(listener);
                continue;
            }

            if let Err(e) = listener.handle_signal() {
                error!(
                    timeline = %self.name,
                    listener = listener.name(),
                    target = listener.pt_value(),
                    "Listener signal handler failed: {}", e
                );
            }
            trace!(
                timeline = %self.name,
                listener = listener.name(),
                target = listener.pt_value(),
                "Listener retired"
            );
            listener.release();
            retired += 1;
        }

        self.drains.fetch_add(1, Ordering::Relaxed);
        debug!(
            timeline = %self.name,
            tl_val,
            retired,
            remaining = list.len(),
            "Drain complete"
        );
    }

    /// Retire every pending listener regardless of its target and release
    /// anyone blocked in `flush`.
    fn retire_all(&self) {
        let pending = std::mem::take(&mut *self.listeners.lock());
        if !pending.is_empty() {
            warn!(
                timeline = %self.name,
                count = pending.len(),
                "Retiring pending listeners on shutdown"
            );
        }
        for mut listener in pending {
            if let Err(e) = listener.handle_signal() {
                error!(
                    timeline = %self.name,
                    listener = listener.name(),
                    "Listener signal handler failed: {}", e
                );
            }
            listener.release();
        }

        let mut bell = self.doorbell.lock();
        bell.completed = bell.requested;
        self.doorbell_cv.notify_all();
    }
}

/// Monotonic completion timeline with a dedicated drain worker.
pub struct Timeline {
    inner: Arc<TimelineInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    isr_registration: Mutex<Option<IsrRegistration>>,
}

impl Timeline {
    /// Create a timeline, start its worker and register it on `isr` under `listening_id`.
    pub fn new(
        name: &str,
        listening_id: u32,
        isr: &IsrSource,
        config: TimelineConfig,
    ) -> Result<Self> {
        let inner = Arc::new(TimelineInner {
            name: name.to_string(),
            listening_id,
            context: context_alloc(1),
            values: Mutex::new(Counters {
                pt_value: INITIAL_PT_VALUE,
                next_value: 0,
                inc_step: 0,
            }),
            listeners: Mutex::new(Vec::new()),
            doorbell: Mutex::new(Doorbell {
                queued: false,
                stop: false,
                requested: 0,
                completed: 0,
            }),
            doorbell_cv: Condvar::new(),
            force_recovery: AtomicBool::new(config.force_recovery),
            pending_frame_num: AtomicU32::new(0),
            last_step: Mutex::new(None),
            drains: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        });

        let worker_inner = Arc::clone(&inner);
        let realtime = config.realtime;
        let handle = std::thread::Builder::new()
            .name(format!("dpu-tl-{}", name))
            .spawn(move || timeline_worker(worker_inner, realtime))
            .map_err(|e| FenceError::ThreadSpawnFailed(e.to_string()))?;

        let weak = Arc::downgrade(&inner);
        let registration = isr.register(listening_id, move |notification| {
            if let Some(inner) = weak.upgrade() {
                inner.on_isr(notification);
            }
        });

        info!(
            timeline = name,
            listening_id,
            context = inner.context,
            isr = isr.name(),
            "Timeline created"
        );

        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
            isr_registration: Mutex::new(Some(registration)),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn listening_id(&self) -> u32 {
        self.inner.listening_id
    }

    /// Fence context scoping every fence created on this timeline.
    pub fn context(&self) -> u64 {
        self.inner.context
    }

    pub fn pt_value(&self) -> u64 {
        self.inner.pt_value()
    }

    pub fn next_value(&self) -> u32 {
        self.inner.values.lock().next_value
    }

    pub fn inc_step(&self) -> u32 {
        self.inner.values.lock().inc_step
    }

    /// Reserve the next future value for a fence or listener.
    pub fn reserve_next(&self) -> u64 {
        let mut values = self.inner.values.lock();
        values.next_value = values.next_value.saturating_add(1);
        values.pt_value.wrapping_add(u64::from(values.next_value))
    }

    /// Roll back one reservation. Never goes below zero.
    pub fn unreserve(&self) {
        let mut values = self.inner.values.lock();
        if values.next_value == 0 {
            warn!(timeline = %self.inner.name, "Unreserve with no outstanding reservation");
            return;
        }
        values.next_value -= 1;
    }

    /// Record that a submitted frame will complete one step.
    ///
    /// Only counts while a reservation is outstanding. Returns whether the
    /// step was recorded.
    pub fn mark_step_pending(&self) -> bool {
        let mut values = self.inner.values.lock();
        if values.next_value == 0 {
            return false;
        }
        values.inc_step = values.inc_step.saturating_add(1);
        true
    }

    /// Force the counter forward after lost interrupts.
    ///
    /// Jumps to `value` when it is ahead of the counter, otherwise advances by
    /// two, wrapping at the top of the range. Outstanding reservations and
    /// pending steps are discarded.
    pub fn resync(&self, value: u64) {
        let (old, new) = {
            let mut values = self.inner.values.lock();
            let old = values.pt_value;
            if value > values.pt_value {
                values.pt_value = value;
            } else {
                values.pt_value = values.pt_value.wrapping_add(RESYNC_FORCE_ADVANCE);
            }
            values.next_value = 0;
            values.inc_step = 0;
            (old, values.pt_value)
        };

        warn!(timeline = %self.inner.name, observed = value, old, new, "Timeline resynced");
        self.inner.queue_drain();
    }

    pub fn set_force_recovery(&self, enable: bool) {
        self.inner.force_recovery.store(enable, Ordering::Release);
    }

    pub fn force_recovery(&self) -> bool {
        self.inner.force_recovery.load(Ordering::Acquire)
    }

    /// Attach a listener signaled at `pt_value`.
    ///
    /// Fails once the timeline has been shut down; the payload is then dropped
    /// without `handle_signal` or `release` being called.
    pub fn add_listener(&self, pt_value: u64, ops: Box<dyn TimelineListener>) -> Result<()> {
        let mut list = self.inner.listeners.lock();
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(FenceError::InvalidArgument(format!(
                "timeline {} is shut down",
                self.inner.name
            )));
        }
        trace!(timeline = %self.inner.name, listener = ops.name(), pt_value, "Listener added");
        list.push(Listener::new(pt_value, ops));
        Ok(())
    }

    pub fn pending_listeners(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    pub fn inc_pending_frames(&self) -> u32 {
        self.inner.pending_frame_num.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Saturates at zero.
    pub fn dec_pending_frames(&self) -> u32 {
        let prev = self
            .inner
            .pending_frame_num
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn pending_frames(&self) -> u32 {
        self.inner.pending_frame_num.load(Ordering::Acquire)
    }

    /// Timestamp of the last interrupt delivered to this timeline.
    pub fn last_step_time(&self) -> Option<Instant> {
        *self.inner.last_step.lock()
    }

    /// Block until every drain queued before this call has run.
    ///
    /// Must not be called from a listener callback.
    pub fn flush(&self) {
        let mut bell = self.inner.doorbell.lock();
        let target = bell.requested;
        while bell.completed < target && !bell.stop {
            self.inner.doorbell_cv.wait(&mut bell);
        }
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        let pending_listeners = self.pending_listeners();
        let values = *self.inner.values.lock();
        TimelineSnapshot {
            name: self.inner.name.clone(),
            pt_value: values.pt_value,
            next_value: values.next_value,
            inc_step: values.inc_step,
            pending_listeners,
            pending_frames: self.pending_frames(),
            drains: self.inner.drains.load(Ordering::Relaxed),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Detach from the interrupt source, stop the worker and retire every
    /// pending listener. Idempotent.
    ///
    /// When the last handle is dropped by a listener callback, this runs on
    /// the worker itself; the worker then retires what is left on its way out.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        drop(self.isr_registration.lock().take());

        {
            let mut bell = self.inner.doorbell.lock();
            bell.stop = true;
            self.inner.doorbell_cv.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() == std::thread::current().id() {
                debug!(timeline = %self.inner.name, "Shutdown from timeline worker, detaching");
                return;
            }
            if let Err(e) = handle.join() {
                error!(timeline = %self.inner.name, "Timeline worker panicked: {:?}", e);
            }
        }

        self.inner.retire_all();
        info!(timeline = %self.inner.name, "Timeline shut down");
    }

    pub(crate) fn downgrade(&self) -> Weak<TimelineInner> {
        Arc::downgrade(&self.inner)
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.snapshot(), f)
    }
}

/// Non-owning back-reference to a timeline.
#[derive(Clone)]
pub struct TimelineRef(pub(crate) Weak<TimelineInner>);

impl TimelineRef {
    /// `None` once the timeline is gone.
    pub fn name(&self) -> Option<String> {
        self.0.upgrade().map(|inner| inner.name().to_string())
    }

    pub fn pt_value(&self) -> Option<u64> {
        self.0.upgrade().map(|inner| inner.pt_value())
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    /// Whether this refers to `timeline`.
    pub fn refers_to(&self, timeline: &Timeline) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&timeline.inner))
    }
}

impl fmt::Debug for TimelineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TimelineRef").field(&self.name()).finish()
    }
}

/// Point-in-time view of a timeline's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineSnapshot {
    pub name: String,
    pub pt_value: u64,
    pub next_value: u32,
    pub inc_step: u32,
    pub pending_listeners: usize,
    pub pending_frames: u32,
    pub drains: u64,
}

impl fmt::Display for TimelineSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timeline {}: pt_value={} next_value={} inc_step={} listeners={} frames={} drains={}",
            self.name,
            self.pt_value,
            self.next_value,
            self.inc_step,
            self.pending_listeners,
            self.pending_frames,
            self.drains
        )
    }
}

/// Main function for the timeline worker thread.
fn timeline_worker(inner: Arc<TimelineInner>, realtime: bool) {
    if realtime {
        if let Err(e) = set_realtime_priority() {
            warn!(timeline = %inner.name, "Realtime priority unavailable: {}", e);
        }
    }
    debug!(timeline = %inner.name, "Timeline worker starting");

    loop {
        let ticket = {
            let mut bell = inner.doorbell.lock();
            while !bell.queued && !bell.stop {
                inner.doorbell_cv.wait(&mut bell);
            }
            if bell.stop {
                break;
            }
            bell.queued = false;
            bell.requested
        };

        inner.drain();

        let mut bell = inner.doorbell.lock();
        bell.completed = ticket;
        inner.doorbell_cv.notify_all();
    }

    inner.retire_all();
    debug!(timeline = %inner.name, "Timeline worker exiting");
}

/// Put the calling thread under `SCHED_FIFO` one below the maximum priority.
fn set_realtime_priority() -> std::io::Result<()> {
    let policy = libc::SCHED_FIFO;
    let max = unsafe { libc::sched_get_priority_max(policy) };
    if max < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let param = libc::sched_param {
        sched_priority: (max - 1).max(1),
    };
    let ret = unsafe { libc::pthread_setschedparam(libc::pthread_self(), policy, &param) };
    if ret != 0 {
        return Err(std::io::Error::from_raw_os_error(ret));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::value_reached;
    use std::sync::atomic::AtomicUsize;

    const VSYNC: u32 = 4;

    fn timeline(name: &str, isr: &IsrSource) -> Timeline {
        Timeline::new(name, VSYNC, isr, TimelineConfig::default().with_realtime(false))
            .expect("timeline creation")
    }

    fn step(tl: &Timeline, isr: &IsrSource) {
        tl.mark_step_pending();
        isr.notify(VSYNC);
    }

    struct Probe {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        released: Arc<AtomicUsize>,
        fail: bool,
    }

    impl TimelineListener for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_signaled(&self, target: u64, tl_val: u64) -> bool {
            value_reached(tl_val, target)
        }

        fn handle_signal(&mut self) -> Result<()> {
            self.log.lock().push(self.name.clone());
            if self.fail {
                return Err(FenceError::Io(format!("{} failed", self.name)));
            }
            Ok(())
        }

        fn release(self: Box<Self>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Probes {
        log: Arc<Mutex<Vec<String>>>,
        released: Arc<AtomicUsize>,
    }

    impl Probes {
        fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                released: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn probe(&self, name: &str) -> Box<Probe> {
            Box::new(Probe {
                name: name.to_string(),
                log: Arc::clone(&self.log),
                released: Arc::clone(&self.released),
                fail: false,
            })
        }

        fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_initial_state() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        assert_eq!(tl.pt_value(), INITIAL_PT_VALUE);
        assert_eq!(tl.next_value(), 0);
        assert_eq!(tl.inc_step(), 0);
        assert_eq!(isr.listener_count(VSYNC), 1);
    }

    #[test]
    fn test_reserve_next() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        assert_eq!(tl.reserve_next(), 2);
        assert_eq!(tl.reserve_next(), 3);
        assert_eq!(tl.next_value(), 2);
        assert_eq!(tl.pt_value(), 1, "reservation must not move the counter");
    }

    #[test]
    fn test_unreserve_floors_at_zero() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        tl.reserve_next();
        tl.unreserve();
        tl.unreserve();
        assert_eq!(tl.next_value(), 0);
    }

    #[test]
    fn test_mark_step_pending_requires_reservation() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        assert!(!tl.mark_step_pending());
        assert_eq!(tl.inc_step(), 0);

        tl.reserve_next();
        assert!(tl.mark_step_pending());
        assert_eq!(tl.inc_step(), 1);
    }

    #[test]
    fn test_notify_folds_step() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        tl.reserve_next();
        tl.reserve_next();
        tl.mark_step_pending();
        tl.mark_step_pending();
        isr.notify(VSYNC);
        tl.flush();

        assert_eq!(tl.pt_value(), 3);
        assert_eq!(tl.next_value(), 0);
        assert_eq!(tl.inc_step(), 0);
        assert!(tl.last_step_time().is_some());
    }

    #[test]
    fn test_notify_without_step_is_noop() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        tl.reserve_next();
        let before = tl.snapshot();

        assert!(!tl.inner.notify_step());
        isr.notify(VSYNC);
        tl.flush();

        assert_eq!(tl.snapshot(), before);
        assert_eq!(tl.inner.doorbell.lock().requested, 0, "no drain may be queued");
    }

    #[test]
    fn test_force_recovery_drains_without_step() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        let probes = Probes::new();
        tl.add_listener(INITIAL_PT_VALUE, probes.probe("stuck")).unwrap();

        isr.notify(VSYNC);
        tl.flush();
        assert_eq!(probes.released(), 0);

        tl.set_force_recovery(true);
        isr.notify(VSYNC);
        tl.flush();
        assert_eq!(probes.released(), 1);
        assert_eq!(tl.pt_value(), INITIAL_PT_VALUE);
    }

    #[test]
    fn test_order_preserved() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        let probes = Probes::new();
        let target = tl.reserve_next();
        tl.add_listener(target, probes.probe("a")).unwrap();
        tl.add_listener(target, probes.probe("b")).unwrap();
        tl.add_listener(target, probes.probe("c")).unwrap();

        step(&tl, &isr);
        tl.flush();

        assert_eq!(*probes.log.lock(), vec!["a", "b", "c"]);
        assert_eq!(tl.pending_listeners(), 0);
    }

    #[test]
    fn test_at_most_once_delivery() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        let probes = Probes::new();
        let target = tl.reserve_next();
        tl.add_listener(target, probes.probe("once")).unwrap();
        let later = tl.reserve_next();
        tl.add_listener(later, probes.probe("later")).unwrap();

        step(&tl, &isr);
        tl.flush();
        assert_eq!(*probes.log.lock(), vec!["once"]);
        assert_eq!(tl.pending_listeners(), 1);

        for _ in 0..3 {
            step(&tl, &isr);
            tl.flush();
        }
        assert_eq!(*probes.log.lock(), vec!["once", "later"]);
        assert_eq!(probes.released(), 2);
    }

    #[test]
    fn test_handler_failure_does_not_stop_drain() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        let probes = Probes::new();
        let target = tl.reserve_next();
        let mut failing = probes.probe("bad");
        failing.fail = true;
        tl.add_listener(target, failing).unwrap();
        tl.add_listener(target, probes.probe("good")).unwrap();

        step(&tl, &isr);
        tl.flush();

        assert_eq!(*probes.log.lock(), vec!["bad", "good"]);
        assert_eq!(probes.released(), 2, "a failing handler is still released");
        assert_eq!(tl.pending_listeners(), 0);
    }

    #[test]
    fn test_resync_stale_value() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        tl.reserve_next();
        tl.reserve_next();
        tl.mark_step_pending();

        let before = tl.pt_value();
        tl.resync(0);
        assert_eq!(tl.pt_value(), before + 2);
        assert_eq!(tl.next_value(), 0);
        assert_eq!(tl.inc_step(), 0);
    }

    #[test]
    fn test_counter_wraps_at_top_of_range() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        tl.resync(u64::MAX - 1);
        tl.resync(0);
        assert_eq!(tl.pt_value(), 0);

        tl.resync(u64::MAX);
        assert_eq!(tl.reserve_next(), 0);
        assert_eq!(tl.pt_value(), u64::MAX);
    }

    #[test]
    fn test_listeners_retire_across_rollover() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        let probes = Probes::new();
        tl.resync(u64::MAX - 1);
        tl.flush();

        let last = tl.reserve_next();
        assert_eq!(last, u64::MAX);
        tl.add_listener(last, probes.probe("max")).unwrap();
        step(&tl, &isr);
        tl.flush();
        assert_eq!(tl.pt_value(), u64::MAX);
        assert_eq!(probes.released(), 1);

        let wrapped = tl.reserve_next();
        assert_eq!(wrapped, 0);
        tl.add_listener(wrapped, probes.probe("zero")).unwrap();
        step(&tl, &isr);
        tl.flush();
        assert_eq!(tl.pt_value(), 0);
        assert_eq!(*probes.log.lock(), vec!["max", "zero"]);
    }

    #[test]
    fn test_resync_catches_up_and_drains() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        let probes = Probes::new();
        for _ in 0..3 {
            let target = tl.reserve_next();
            tl.add_listener(target, probes.probe("frame")).unwrap();
        }

        tl.resync(10);
        tl.flush();
        assert_eq!(tl.pt_value(), 10);
        assert_eq!(probes.released(), 3);
    }

    #[test]
    fn test_drains_coalesce() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        for _ in 0..5 {
            tl.reserve_next();
        }

        let requested_before = tl.inner.doorbell.lock().requested;
        {
            // Block the worker on the list lock while steps arrive.
            let _list = tl.inner.listeners.lock();
            for _ in 0..5 {
                step(&tl, &isr);
            }
        }
        tl.flush();

        let requested = tl.inner.doorbell.lock().requested - requested_before;
        assert!(requested <= 2, "expected coalesced drains, got {}", requested);
        assert_eq!(tl.pt_value(), 6);
    }

    #[test]
    fn test_monotonic_under_concurrency() {
        let isr = IsrSource::new("dpu0");
        let tl = Arc::new(timeline("t0", &isr));

        let reservers: Vec<_> = (0..4)
            .map(|_| {
                let tl = Arc::clone(&tl);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        tl.reserve_next();
                        if i % 3 == 0 {
                            tl.unreserve();
                        }
                    }
                })
            })
            .collect();

        let mut last = tl.pt_value();
        for _ in 0..1000 {
            step(&tl, &isr);
            let now = tl.pt_value();
            assert!(now >= last, "pt_value moved backward: {} -> {}", last, now);
            last = now;
        }
        for r in reservers {
            r.join().unwrap();
        }
        tl.flush();
        assert!(tl.pt_value() >= last);
    }

    #[test]
    fn test_stress_ten_thousand_listeners() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        let probes = Probes::new();
        for i in 0..10_000 {
            let target = tl.reserve_next();
            tl.add_listener(target, probes.probe(&format!("l{}", i)))
                .unwrap();
        }

        for _ in 0..10_000 {
            step(&tl, &isr);
        }
        tl.flush();

        assert_eq!(probes.released(), 10_000);
        assert_eq!(tl.pending_listeners(), 0);
        assert_eq!(tl.pt_value(), INITIAL_PT_VALUE + 10_000);
        assert_eq!(tl.next_value(), 0);
    }

    #[test]
    fn test_shutdown_retires_pending_and_rejects_new() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        let probes = Probes::new();
        let target = tl.reserve_next();
        tl.add_listener(target, probes.probe("pending")).unwrap();

        tl.shutdown();
        assert!(tl.is_shut_down());
        assert_eq!(probes.released(), 1);
        assert_eq!(isr.listener_count(VSYNC), 0);

        let err = tl.add_listener(target, probes.probe("late")).unwrap_err();
        assert!(matches!(err, FenceError::InvalidArgument(_)));
        assert_eq!(probes.released(), 1, "rejected payload is not released");

        // Second shutdown and flush are no-ops
        tl.shutdown();
        tl.flush();
    }

    /// Listener that keeps its timeline alive until it is released.
    struct TimelineOwner {
        _timeline: Arc<Timeline>,
        released: Arc<AtomicUsize>,
    }

    impl TimelineListener for TimelineOwner {
        fn name(&self) -> &str {
            "owner"
        }

        fn is_signaled(&self, target: u64, tl_val: u64) -> bool {
            value_reached(tl_val, target)
        }

        fn release(self: Box<Self>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_last_handle_dropped_by_listener() {
        let isr = IsrSource::new("dpu0");
        let tl = Arc::new(timeline("t0", &isr));
        let inner = Arc::clone(&tl.inner);
        let probes = Probes::new();

        let target = tl.reserve_next();
        tl.add_listener(
            target,
            Box::new(TimelineOwner {
                _timeline: Arc::clone(&tl),
                released: Arc::clone(&probes.released),
            }),
        )
        .unwrap();
        tl.add_listener(target, probes.probe("same-step")).unwrap();
        tl.add_listener(target + 100, probes.probe("future")).unwrap();

        {
            // Hold the worker off until the listener owns the only handle.
            let _list = inner.listeners.lock();
            step(&tl, &isr);
            drop(tl);
        }

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while probes.released() < 3 && Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        assert_eq!(probes.released(), 3);
        assert_eq!(*probes.log.lock(), vec!["same-step", "future"]);
        assert!(inner.stopped.load(Ordering::Acquire));
        assert!(inner.listeners.lock().is_empty());
        assert_eq!(isr.listener_count(VSYNC), 0);
    }

    #[test]
    fn test_independent_timelines() {
        let isr = IsrSource::new("dpu0");
        let a = Timeline::new("a", 1, &isr, TimelineConfig::default().with_realtime(false))
            .unwrap();
        let b = Timeline::new("b", 2, &isr, TimelineConfig::default().with_realtime(false))
            .unwrap();
        assert_ne!(a.context(), b.context());

        a.reserve_next();
        a.mark_step_pending();
        isr.notify(1);
        a.flush();
        b.flush();
        assert_eq!(a.pt_value(), 2);
        assert_eq!(b.pt_value(), INITIAL_PT_VALUE);
    }

    #[test]
    fn test_pending_frames() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        assert_eq!(tl.inc_pending_frames(), 1);
        assert_eq!(tl.inc_pending_frames(), 2);
        assert_eq!(tl.dec_pending_frames(), 1);
        assert_eq!(tl.dec_pending_frames(), 0);
        assert_eq!(tl.dec_pending_frames(), 0);
    }

    #[test]
    fn test_snapshot_display() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        tl.reserve_next();
        let text = tl.snapshot().to_string();
        assert_eq!(
            text,
            "timeline t0: pt_value=1 next_value=1 inc_step=0 listeners=0 frames=0 drains=0"
        );
    }

    #[test]
    fn test_timeline_ref() {
        let isr = IsrSource::new("dpu0");
        let tl = timeline("t0", &isr);
        let r = TimelineRef(tl.downgrade());
        assert!(r.refers_to(&tl));
        assert_eq!(r.name().as_deref(), Some("t0"));
        assert_eq!(r.pt_value(), Some(INITIAL_PT_VALUE));
        drop(tl);
        assert!(!r.is_alive());
        assert_eq!(r.pt_value(), None);
    }
}

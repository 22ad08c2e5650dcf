//! Frame buffer locks.
//!
//! A frame lock keeps the buffers scanned out by one frame, plus the frame's
//! cmdlist and atomic-state handles, alive until the timeline moves strictly
//! past the frame's value. Release fences signal when the value is reached;
//! frame locks retire one step later.

use crate::error::Result;
use crate::listener::{value_passed, TimelineListener};
use crate::timeline::Timeline;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A display-side handle released exactly once when its frame retires.
pub trait FrameResource: Send {
    fn release(self: Box<Self>) -> Result<()>;
}

/// A buffer shared with the display pipeline.
pub trait SyncBuffer: Send + Sync {
    fn id(&self) -> u64;
}

/// One locked buffer of a frame.
pub struct BufSync {
    pub frame_no: u64,
    pub rch_id: u32,
    pub buffer: Arc<dyn SyncBuffer>,
}

impl BufSync {
    pub fn new(frame_no: u64, rch_id: u32, buffer: Arc<dyn SyncBuffer>) -> Self {
        Self {
            frame_no,
            rch_id,
            buffer,
        }
    }
}

impl std::fmt::Debug for BufSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufSync")
            .field("frame_no", &self.frame_no)
            .field("rch_id", &self.rch_id)
            .field("buffer", &self.buffer.id())
            .finish()
    }
}

#[derive(Default)]
struct FramePayload {
    cmdlist: Option<Box<dyn FrameResource>>,
    atomic_state: Option<Box<dyn FrameResource>>,
    buffers: Vec<BufSync>,
    retired: bool,
}

struct FrameLockInfo {
    name: String,
    payload: Mutex<FramePayload>,
}

impl FrameLockInfo {
    /// Release cmdlist, atomic state, then every buffer. Returns the first
    /// handle error after releasing everything.
    fn retire(&self) -> Result<()> {
        let (cmdlist, atomic_state, buffers) = {
            let mut payload = self.payload.lock();
            payload.retired = true;
            (
                payload.cmdlist.take(),
                payload.atomic_state.take(),
                std::mem::take(&mut payload.buffers),
            )
        };

        let mut first_err = None;
        for (what, resource) in [("cmdlist", cmdlist), ("atomic state", atomic_state)] {
            if let Some(resource) = resource {
                if let Err(e) = resource.release() {
                    warn!(lock = %self.name, "Failed to release {}: {}", what, e);
                    first_err.get_or_insert(e);
                }
            }
        }

        let count = buffers.len();
        for buf in buffers {
            trace!(
                lock = %self.name,
                buffer = buf.buffer.id(),
                rch_id = buf.rch_id,
                frame_no = buf.frame_no,
                "Buffer unlocked"
            );
        }
        debug!(lock = %self.name, buffers = count, "Frame lock retired");

        first_err.map_or(Ok(()), Err)
    }

    fn append_buffers(&self, buffers: Vec<BufSync>) {
        let mut payload = self.payload.lock();
        if !payload.retired {
            payload.buffers.extend(buffers);
            return;
        }
        drop(payload);
        warn!(lock = %self.name, count = buffers.len(), "Buffers attached after retirement, unlocking now");
    }

    /// Store `resource` in `slot`, or release it straight away after retirement.
    fn attach(
        &self,
        resource: Box<dyn FrameResource>,
        slot: fn(&mut FramePayload) -> &mut Option<Box<dyn FrameResource>>,
    ) -> Result<()> {
        let mut payload = self.payload.lock();
        if payload.retired {
            drop(payload);
            warn!(lock = %self.name, "Handle attached after retirement, releasing now");
            return resource.release();
        }
        let old = slot(&mut *payload).replace(resource);
        drop(payload);

        match old {
            Some(old) => {
                warn!(lock = %self.name, "Replacing attached handle");
                old.release()
            }
            None => Ok(()),
        }
    }
}

struct FrameLockListener {
    info: Arc<FrameLockInfo>,
}

impl TimelineListener for FrameLockListener {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn is_signaled(&self, target: u64, tl_val: u64) -> bool {
        value_passed(tl_val, target)
    }

    fn handle_signal(&mut self) -> Result<()> {
        self.info.retire()
    }
}

/// Producer-side handle to a registered frame lock.
pub struct FrameLock {
    info: Arc<FrameLockInfo>,
    target: u64,
    frame_no: u64,
}

impl FrameLock {
    /// Register a frame lock on `timeline` retiring once it passes `target_value`.
    ///
    /// Buffers in `buffers` are moved into the lock only once registration has
    /// succeeded; on failure the caller's list is untouched.
    pub fn create(
        timeline: &Timeline,
        buffers: Option<&mut Vec<BufSync>>,
        target_value: u64,
        frame_no: u64,
    ) -> Result<Self> {
        let info = Arc::new(FrameLockInfo {
            name: format!("frame_lock_{}", frame_no),
            payload: Mutex::new(FramePayload::default()),
        });

        timeline.add_listener(
            target_value,
            Box::new(FrameLockListener {
                info: Arc::clone(&info),
            }),
        )?;

        if let Some(list) = buffers {
            info.append_buffers(std::mem::take(list));
        }

        debug!(
            timeline = timeline.name(),
            lock = %info.name,
            target_value,
            "Frame lock created"
        );
        Ok(Self {
            info,
            target: target_value,
            frame_no,
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn frame_no(&self) -> u64 {
        self.frame_no
    }

    pub fn attach_buffer(&self, buf: BufSync) {
        self.info.append_buffers(vec![buf]);
    }

    pub fn set_cmdlist(&self, cmdlist: Box<dyn FrameResource>) -> Result<()> {
        self.info.attach(cmdlist, |p| &mut p.cmdlist)
    }

    pub fn set_atomic_state(&self, state: Box<dyn FrameResource>) -> Result<()> {
        self.info.attach(state, |p| &mut p.atomic_state)
    }

    pub fn buffer_count(&self) -> usize {
        self.info.payload.lock().buffers.len()
    }

    pub fn is_retired(&self) -> bool {
        self.info.payload.lock().retired
    }
}

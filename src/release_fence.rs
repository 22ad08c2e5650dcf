//! Release fences.
//!
//! A release fence tells the producer a buffer may be reused. It targets a
//! freshly reserved timeline value and signals once the timeline reaches it.

use crate::error::Result;
use crate::fence::{Fence, FenceKind};
use crate::fence_fd::FenceFdTable;
use crate::listener::{value_reached, TimelineListener};
use crate::timeline::{Timeline, TimelineRef};
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// A created release fence: its fd and the timeline value it waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseFenceFd {
    pub fd: RawFd,
    pub value: u64,
}

/// Timeline listener holding the engine's reference to a release fence.
struct ReleaseFenceListener {
    name: String,
    fence: Arc<Fence>,
}

impl TimelineListener for ReleaseFenceListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_signaled(&self, target: u64, tl_val: u64) -> bool {
        value_reached(tl_val, target)
    }

    fn release(self: Box<Self>) {
        // Wake waiters before letting go of the fence.
        if self.fence.signal() {
            trace!(fence = %self.name, seqno = self.fence.seqno(), "Release fence signaled");
        }
    }
}

/// Create a release fence on `timeline` and install it in `fds`.
///
/// The reservation is rolled back on every failure path.
pub fn create(
    timeline: &Timeline,
    fds: &FenceFdTable,
    diagnostic_id: u32,
) -> Result<ReleaseFenceFd> {
    let value = timeline.reserve_next();
    attach(timeline, fds, value, diagnostic_id)
}

/// Build the fence for reserved `value`, install its fd and register its listener.
fn attach(
    timeline: &Timeline,
    fds: &FenceFdTable,
    value: u64,
    diagnostic_id: u32,
) -> Result<ReleaseFenceFd> {
    let name = format!("{}_release_{}", timeline.name(), diagnostic_id);
    let fence = Fence::new(
        timeline.context(),
        value,
        name.clone(),
        FenceKind::Release {
            timeline: timeline.downgrade(),
        },
    );

    let fd = match fds.install(Arc::clone(&fence)) {
        Ok(fd) => fd,
        Err(e) => {
            timeline.unreserve();
            error!(fence = %name, value, "Failed to install release fence fd: {}", e);
            return Err(e);
        }
    };

    let listener = Box::new(ReleaseFenceListener {
        name,
        fence: Arc::clone(&fence),
    });
    if let Err(e) = timeline.add_listener(value, listener) {
        if let Err(close_err) = fds.close(fd) {
            error!(fd, "Failed to close release fence fd: {}", close_err);
        }
        timeline.unreserve();
        error!(timeline = timeline.name(), value, "Failed to register release fence: {}", e);
        return Err(e);
    }

    // A drain that ran before registration has already passed this value.
    if fence.is_signaled() {
        trace!(fence = fence.name(), value, "Release fence reached before registration");
    }

    debug!(timeline = timeline.name(), fd, value, "Release fence created");
    Ok(ReleaseFenceFd { fd, value })
}

/// The timeline a release fence belongs to. `None` for other fence kinds.
pub fn get_timeline(fence: &Fence) -> Option<TimelineRef> {
    fence.timeline()
}

//! Acquire fences.
//!
//! An acquire fence gates consumption of a buffer produced outside the
//! timeline's counting domain. It is a thin fd/wait wrapper: the producer
//! signals out of band, so the fence reports signaled whenever asked.
//!
//! Fd arguments follow the sync-file convention: a negative fd means "no
//! fence" and is trivially satisfied.

use crate::error::{FenceError, Result};
use crate::fence::{context_alloc, Fence, FenceKind};
use crate::fence_fd::FenceFdTable;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// New acquire fence on its own context.
pub fn create(initial_value: u64) -> Arc<Fence> {
    let context = context_alloc(1);
    Fence::new(
        context,
        initial_value,
        format!("acquire_{}", context),
        FenceKind::Acquire,
    )
}

/// New acquire fence wrapped in an fd.
pub fn create_fd(fds: &FenceFdTable, initial_value: u64) -> Result<RawFd> {
    let fence = create(initial_value);
    fence.enable_signaling();
    let fd = fds.install(fence).map_err(|e| {
        warn!(initial_value, "Failed to install acquire fence fd: {}", e);
        e
    })?;
    debug!(fd, initial_value, "Acquire fence created");
    Ok(fd)
}

pub fn wait(fence: &Fence, timeout_ms: u64) -> Result<()> {
    fence.wait(Duration::from_millis(timeout_ms)).map_err(|e| {
        warn!(fence = fence.name(), seqno = fence.seqno(), timeout_ms, "Fence wait failed: {}", e);
        e
    })
}

pub fn wait_fd(fds: &FenceFdTable, fd: RawFd, timeout_ms: u64) -> Result<()> {
    if fd < 0 {
        return Ok(());
    }
    let fence = fds.get_fence(fd)?;
    wait(&fence, timeout_ms)
}

/// Confirm the fence behind `fd` has signaled and drop the lookup reference.
///
/// Signaling through this path before the fence completed is a protocol violation.
pub fn signal(fds: &FenceFdTable, fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Ok(());
    }
    let fence = fds.get_fence(fd)?;
    if fence.is_signaled() {
        return Ok(());
    }
    Err(FenceError::ProtocolViolation(format!(
        "fence {} (fd {}) signaled before completion",
        fence.name(),
        fd
    )))
}

/// Best-effort reference drop for teardown paths.
pub fn signal_release(fence: Arc<Fence>) {
    if !fence.is_signaled() {
        warn!(fence = fence.name(), seqno = fence.seqno(), "Releasing unsignaled fence");
    }
}

//! Fence file descriptors.
//!
//! Every installed fence is backed by an `eventfd(2)` whose number is the
//! fence fd. The eventfd turns readable when the fence signals, so the fd can
//! be handed to anything that polls.

use crate::error::{FenceError, Result};
use crate::fence::Fence;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

struct SyncFile {
    event: Arc<OwnedFd>,
    fence: Arc<Fence>,
}

/// Table mapping fence fds to the fences they wrap.
pub struct FenceFdTable {
    files: Mutex<HashMap<RawFd, SyncFile>>,
    limit: Option<usize>,
}

impl Default for FenceFdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceFdTable {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            limit: None,
        }
    }

    /// Table refusing to hold more than `limit` live fds.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            limit: Some(limit),
        }
    }

    /// Wrap `fence` in a new fd. The table keeps a reference until `close`.
    pub fn install(&self, fence: Arc<Fence>) -> Result<RawFd> {
        let event = {
            let mut files = self.files.lock();
            if let Some(limit) = self.limit {
                if files.len() >= limit {
                    return Err(FenceError::Io(format!("fence fd limit {} reached", limit)));
                }
            }
            let event = Arc::new(create_eventfd()?);
            files.insert(
                event.as_raw_fd(),
                SyncFile {
                    event: Arc::clone(&event),
                    fence: Arc::clone(&fence),
                },
            );
            event
        };

        // A closed fd must not be kept open by a fence that never signals.
        let fd = event.as_raw_fd();
        let cb_event: Weak<OwnedFd> = Arc::downgrade(&event);
        let pending = fence.add_callback(move |_| {
            if let Some(event) = cb_event.upgrade() {
                kick_eventfd(&event);
            }
        });
        if !pending {
            kick_eventfd(&event);
        }

        debug!(fd, fence = fence.name(), seqno = fence.seqno(), "Fence fd installed");
        Ok(fd)
    }

    /// Resolve `fd` to its fence, taking a new reference.
    pub fn get_fence(&self, fd: RawFd) -> Result<Arc<Fence>> {
        self.files
            .lock()
            .get(&fd)
            .map(|file| Arc::clone(&file.fence))
            .ok_or_else(|| FenceError::InvalidArgument(format!("fd {} is not a fence", fd)))
    }

    /// Drop the table's fence reference and close `fd`.
    ///
    /// The fd stays open only while a concurrent `poll` on it is in progress.
    pub fn close(&self, fd: RawFd) -> Result<()> {
        let file = self
            .files
            .lock()
            .remove(&fd)
            .ok_or_else(|| FenceError::InvalidArgument(format!("fd {} is not a fence", fd)))?;
        debug!(fd, fence = file.fence.name(), "Fence fd closed");
        Ok(())
    }

    /// Signal the fence behind `fd` from outside the timeline.
    pub fn signal_fd(&self, fd: RawFd) -> Result<()> {
        let fence = self.get_fence(fd)?;
        if !fence.signal() {
            debug!(fd, fence = fence.name(), "Fence already signaled");
        }
        Ok(())
    }

    /// Poll `fd` for readability. Returns whether the fence has signaled.
    ///
    /// Negative `timeout_ms` blocks indefinitely.
    pub fn poll(&self, fd: RawFd, timeout_ms: i32) -> Result<bool> {
        let event = self
            .files
            .lock()
            .get(&fd)
            .map(|file| Arc::clone(&file.event))
            .ok_or_else(|| FenceError::InvalidArgument(format!("fd {} is not a fence", fd)))?;

        let mut pfd = libc::pollfd {
            fd: event.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(ret > 0 && (pfd.revents & libc::POLLIN) != 0)
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

fn create_eventfd() -> Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(FenceError::Io(format!(
            "Failed to create eventfd: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn kick_eventfd(event: &OwnedFd) {
    let value: u64 = 1;
    let ret = unsafe {
        libc::write(
            event.as_raw_fd(),
            &value as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if ret < 0 {
        warn!(
            fd = event.as_raw_fd(),
            "Failed to kick fence eventfd: {}",
            std::io::Error::last_os_error()
        );
    }
}

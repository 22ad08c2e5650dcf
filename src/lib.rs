//! Display fence/timeline synchronization.
//!
//! This crate provides the completion timeline a display pipeline uses to
//! retire frames: a monotonic counter advanced by frame-done interrupts, a
//! dedicated worker that notifies listeners in creation order, release fences
//! that signal when a frame's value is reached, frame locks that keep buffers
//! alive until the frame is retired, and fd-backed acquire fences for
//! producers outside the timeline.

pub mod acquire_fence;
pub mod buf_sync;
pub mod config;
mod error;
pub mod fence;
pub mod fence_fd;
pub mod isr;
pub mod listener;
pub mod release_fence;
pub mod timeline;

pub use buf_sync::{BufSync, FrameLock, FrameResource, SyncBuffer};
pub use config::TimelineConfig;
pub use error::{FenceError, Result};
pub use fence::Fence;
pub use fence_fd::FenceFdTable;
pub use isr::{IsrNotification, IsrRegistration, IsrSource};
pub use listener::{Listener, TimelineListener};
pub use release_fence::ReleaseFenceFd;
pub use timeline::{Timeline, TimelineRef, TimelineSnapshot, INITIAL_PT_VALUE};

//! Timeline listener records.
//!
//! A listener is a pending completion obligation attached to one target value
//! of a timeline. The timeline owns the record; the record exclusively owns
//! its payload until `release` runs.

use crate::error::Result;

/// Capability set every listener payload implements.
pub trait TimelineListener: Send {
    /// Diagnostic name.
    fn name(&self) -> &str;

    /// Whether a listener targeting `target` is signaled once the timeline is at `tl_val`.
    fn is_signaled(&self, target: u64, tl_val: u64) -> bool;

    /// Runs once, when the listener is found signaled. Errors are logged by the
    /// timeline and never stop the drain.
    fn handle_signal(&mut self) -> Result<()> {
        Ok(())
    }

    /// Runs once, after `handle_signal`, and consumes the payload.
    fn release(self: Box<Self>) {}
}

/// `true` once `tl_val` has reached `target`.
///
/// Uses the 64-bit signed delta so values up to 2^63 apart compare correctly
/// across rollover.
pub fn value_reached(tl_val: u64, target: u64) -> bool {
    (tl_val.wrapping_sub(target) as i64) >= 0
}

/// `true` once `tl_val` is strictly past `target`.
pub fn value_passed(tl_val: u64, target: u64) -> bool {
    (tl_val.wrapping_sub(target) as i64) > 0
}

/// A payload bound to its target value, as stored on the timeline.
pub struct Listener {
    pt_value: u64,
    ops: Box<dyn TimelineListener>,
}

impl Listener {
    pub fn new(pt_value: u64, ops: Box<dyn TimelineListener>) -> Self {
        Self { pt_value, ops }
    }

    pub fn pt_value(&self) -> u64 {
        self.pt_value
    }

    pub fn name(&self) -> &str {
        self.ops.name()
    }

    pub fn is_signaled(&self, tl_val: u64) -> bool {
        self.ops.is_signaled(self.pt_value, tl_val)
    }

    pub fn handle_signal(&mut self) -> Result<()> {
        self.ops.handle_signal()
    }

    pub fn release(self) {
        self.ops.release();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name())
            .field("pt_value", &self.pt_value)
            .finish()
    }
}

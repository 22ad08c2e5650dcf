//! Timeline configuration.

/// Environment variable disabling the realtime worker priority when set to `0`/`false`.
pub const ENV_REALTIME: &str = "DPU_TIMELINE_REALTIME";
/// Environment variable enabling force recovery when set to `1`/`true`.
pub const ENV_FORCE_RECOVERY: &str = "DPU_TIMELINE_FORCE_RECOVERY";

/// Per-timeline settings supplied at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineConfig {
    /// Run the drain worker under `SCHED_FIFO` just below the maximum priority.
    pub realtime: bool,
    /// Let a step notification drain listeners even when no step was pending.
    pub force_recovery: bool,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            realtime: true,
            force_recovery: false,
        }
    }
}

impl TimelineConfig {
    /// Defaults overridden by `DPU_TIMELINE_REALTIME` and `DPU_TIMELINE_FORCE_RECOVERY`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_flag(ENV_REALTIME) {
            config.realtime = v;
        }
        if let Some(v) = env_flag(ENV_FORCE_RECOVERY) {
            config.force_recovery = v;
        }
        config
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn with_force_recovery(mut self, force_recovery: bool) -> Self {
        self.force_recovery = force_recovery;
        self
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

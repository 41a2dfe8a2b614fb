//! Tunables that leaves as constants or CLI-flag defaults. Grouped
//! into a single typed value so a host process can override them in one
//! place instead of threading individual numbers through constructors.

use std::path::PathBuf;
use std::time::Duration;

/// Maximum chunk body length: 15 bits, per the wire framing in
pub const MAX_CHUNK_LEN: usize = (1 << 15) - 1;

/// Cap on the agent-protocol name length (Open Question: the
/// source does not bound it; we impose 256 bytes to prevent abuse).
pub const MAX_PROTOCOL_NAME_LEN: usize = 256;

/// Default unread byte budget for a newly created pipe.
pub const DEFAULT_PIPE_WINDOW: u32 = 1 << 16;

#[derive(Debug, Clone)]
pub struct Configuration {
    /// Root directory for persisted state (`jarCache/`, flight recorder
    /// dumps). Mirrors the CLI launcher's `-workDir`/`-internalDir`
    /// boundary, but the core only needs the resolved path.
    pub work_dir: PathBuf,
    /// Initial credit for a pipe's [`crate::pipe::PipeWindow`].
    pub pipe_window: u32,
    /// Number of recent unexport events retained for diagnostics.
    pub unexport_log_capacity: usize,
    /// Size of the per-channel flight recorder ring buffer (raw bytes read),
    /// default 1 MiB
    pub flight_recorder_capacity: usize,
    /// Timeout applied to `Channel::call` when the caller does not supply
    /// one explicitly. `None` means block indefinitely.
    pub default_call_timeout: Option<Duration>,
}

impl Configuration {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            pipe_window: DEFAULT_PIPE_WINDOW,
            unexport_log_capacity: 256,
            flight_recorder_capacity: 1 << 20,
            default_call_timeout: None,
        }
    }

    pub fn with_pipe_window(mut self, window: u32) -> Self {
        self.pipe_window = window;
        self
    }

    pub fn with_unexport_log_capacity(mut self, capacity: usize) -> Self {
        self.unexport_log_capacity = capacity;
        self
    }

    pub fn with_flight_recorder_capacity(mut self, capacity: usize) -> Self {
        self.flight_recorder_capacity = capacity;
        self
    }

    pub fn with_default_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_call_timeout = timeout;
        self
    }

    /// `${workDir}/remoting/jarCache`
    pub fn jar_cache_dir(&self) -> PathBuf {
        self.work_dir.join("remoting").join("jarCache")
    }

    /// `${workDir}/remoting/logs`
    pub fn log_dir(&self) -> PathBuf {
        self.work_dir.join("remoting").join("logs")
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_internal_dir_layout() {
        let cfg = Configuration::new("/srv/agent");
        assert_eq!(cfg.jar_cache_dir(), PathBuf::from("/srv/agent/remoting/jarCache"));
        assert_eq!(cfg.log_dir(), PathBuf::from("/srv/agent/remoting/logs"));
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = Configuration::default()
            .with_pipe_window(4096)
            .with_unexport_log_capacity(8);
        assert_eq!(cfg.pipe_window, 4096);
        assert_eq!(cfg.unexport_log_capacity, 8);
    }
}

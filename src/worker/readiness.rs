//! Readiness marker detection over engine output lines.

use regex::Regex;

/// Scan state for one worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Marker not seen yet.
    Starting,
    /// Marker seen; further matches are ignored.
    Ready,
}

/// Small state machine that fires once on the first matching line.
#[derive(Debug, Clone)]
pub struct ReadinessScanner {
    pattern: Regex,
    state: ScanState,
}

impl ReadinessScanner {
    /// Create a scanner for `pattern`.
    #[must_use]
    pub fn new(pattern: Regex) -> Self {
        Self {
            pattern,
            state: ScanState::Starting,
        }
    }

    /// Feed one output line. Returns `true` only for the line that moves the
    /// scanner from `Starting` to `Ready`.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.state == ScanState::Ready || !self.pattern.is_match(line) {
            return false;
        }
        self.state = ScanState::Ready;
        true
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ScanState {
        self.state
    }
}

use std::time::Instant;

/// Active (visible) time not yet folded into the progress record.
///
/// `baseline_ms` holds time from earlier visible windows; while visible,
/// `running_anchor` marks when the current window started.
#[derive(Debug, Clone, Default)]
pub struct ActivityTracker {
    baseline_ms: u64,
    running_anchor: Option<Instant>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running_anchor.is_some()
    }

    pub fn resume(&mut self, now: Instant) {
        if self.running_anchor.is_none() {
            self.running_anchor = Some(now);
        }
    }

    pub fn pause(&mut self, now: Instant) {
        if let Some(anchor) = self.running_anchor.take() {
            self.baseline_ms = self.baseline_ms.saturating_add(elapsed_ms(anchor, now));
        }
    }

    pub fn pending_ms(&self, now: Instant) -> u64 {
        match self.running_anchor {
            Some(anchor) => self.baseline_ms.saturating_add(elapsed_ms(anchor, now)),
            None => self.baseline_ms,
        }
    }

    /// Returns the pending time and starts counting from zero again,
    /// keeping the running state.
    pub fn take(&mut self, now: Instant) -> u64 {
        let pending = self.pending_ms(now);
        self.baseline_ms = 0;
        if self.running_anchor.is_some() {
            self.running_anchor = Some(now);
        }
        pending
    }
}

fn elapsed_ms(anchor: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(anchor).as_millis()).unwrap_or(u64::MAX)
}

use std::time::{Duration, Instant};

pub const MARKER: &str = "ESP_LOOPBACK_TEST";
pub const TIMEOUT: Duration = Duration::from_millis(2000);

// keep the buffer bounded on a chatty line
const MAX_BUFFER: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone)]
pub struct Loopback {
    started: Instant,
    deadline: Instant,
    buffer: Vec<u8>,
}

impl Loopback {
    pub fn start(now: Instant) -> Self {
        Self { started: now, deadline: now + TIMEOUT, buffer: Vec::new() }
    }

    /// Feeds polarity-corrected RX bytes; returns `Pass` once the marker shows up.
    pub fn observe(&mut self, bytes: &[u8]) -> Option<LoopbackOutcome> {
        self.buffer.extend_from_slice(bytes);
        let marker = MARKER.as_bytes();
        if self.buffer.windows(marker.len()).any(|w| w == marker) {
            return Some(LoopbackOutcome::Pass);
        }
        if self.buffer.len() > MAX_BUFFER {
            let keep = marker.len() - 1;
            let cut = self.buffer.len() - keep;
            self.buffer.drain(..cut);
        }
        None
    }

    pub fn check_deadline(&self, now: Instant) -> Option<LoopbackOutcome> {
        (now >= self.deadline).then_some(LoopbackOutcome::Fail)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }
}

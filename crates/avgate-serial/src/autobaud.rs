use std::time::{Duration, Instant};

/// Candidate rates, highest first. The scan starts at index 0 and wraps.
pub const BAUD_LADDER: [u32; 10] = [115_200, 74_880, 57_600, 38_400, 19_200, 9_600, 4_800, 2_400, 1_200, 300];

pub const WINDOW: Duration = Duration::from_millis(400);
pub const MIN_GOOD_BYTES: u32 = 5;
pub const REQUIRED_SCORE: u32 = 3;

pub fn is_supported_baud(baud: u32) -> bool {
    BAUD_LADDER.contains(&baud)
}

/// Printable ASCII or a line terminator, after polarity correction.
pub fn is_good_byte(b: u8) -> bool {
    (0x20..=0x7E).contains(&b) || b == b'\r' || b == b'\n'
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStep {
    /// Window still open.
    Pending,
    /// Window closed with enough good bytes; keep listening at this rate.
    Scored { good: u32, score: u32 },
    /// Enough consecutive good windows; the scan is over at the current rate.
    Detected { good: u32 },
    /// Window closed without enough good bytes; switch to `baud`.
    Advance { baud: u32 },
}

#[derive(Debug, Clone)]
pub struct AutoBaud {
    index: usize,
    window_start: Instant,
    good_bytes: u32,
    score: u32,
}

impl AutoBaud {
    pub fn start(now: Instant) -> Self {
        Self { index: 0, window_start: now, good_bytes: 0, score: 0 }
    }

    pub fn candidate(&self) -> u32 {
        BAUD_LADDER[self.index]
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn observe(&mut self, bytes: &[u8]) {
        let good = bytes.iter().filter(|&&b| is_good_byte(b)).count() as u32;
        self.good_bytes = self.good_bytes.saturating_add(good);
    }

    pub fn tick(&mut self, now: Instant) -> ScanStep {
        if now.saturating_duration_since(self.window_start) < WINDOW {
            return ScanStep::Pending;
        }

        let good = self.good_bytes;
        self.good_bytes = 0;
        self.window_start = now;

        if good >= MIN_GOOD_BYTES {
            self.score += 1;
            if self.score >= REQUIRED_SCORE {
                return ScanStep::Detected { good };
            }
            return ScanStep::Scored { good, score: self.score };
        }

        self.score = 0;
        self.index = (self.index + 1) % BAUD_LADDER.len();
        ScanStep::Advance { baud: self.candidate() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_stays_open_before_400ms() {
        let t0 = Instant::now();
        let mut scan = AutoBaud::start(t0);
        scan.observe(b"hello world");
        assert_eq!(scan.tick(t0 + Duration::from_millis(399)), ScanStep::Pending);
    }

    #[test]
    fn three_good_windows_detect_the_rate() {
        let t0 = Instant::now();
        let mut scan = AutoBaud::start(t0);
        let mut now = t0;
        for expected_score in 1..=2 {
            scan.observe(b"OK\r\n!");
            now += WINDOW;
            assert_eq!(scan.tick(now), ScanStep::Scored { good: 5, score: expected_score });
        }
        scan.observe(b"READY\r\n");
        now += WINDOW;
        assert_eq!(scan.tick(now), ScanStep::Detected { good: 7 });
        assert_eq!(scan.candidate(), 115_200);
    }

    #[test]
    fn bad_window_resets_score_and_steps_down() {
        let t0 = Instant::now();
        let mut scan = AutoBaud::start(t0);
        scan.observe(b"hello");
        assert!(matches!(scan.tick(t0 + WINDOW), ScanStep::Scored { score: 1, .. }));
        scan.observe(&[0x00, 0xFF, 0x80, b'a']);
        assert_eq!(scan.tick(t0 + WINDOW * 2), ScanStep::Advance { baud: 74_880 });
        assert_eq!(scan.score(), 0);
    }

    #[test]
    fn quiet_line_wraps_from_lowest_to_highest() {
        let t0 = Instant::now();
        let mut scan = AutoBaud::start(t0);
        let mut now = t0;
        let mut seen = Vec::new();
        for _ in 0..BAUD_LADDER.len() {
            now += WINDOW;
            match scan.tick(now) {
                ScanStep::Advance { baud } => seen.push(baud),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(seen.last(), Some(&115_200));
        assert_eq!(seen[seen.len() - 2], 300);
        assert_eq!(scan.candidate(), 115_200);
    }

    #[test]
    fn good_bytes_are_printable_or_line_endings() {
        assert!(is_good_byte(b'A'));
        assert!(is_good_byte(b'\n'));
        assert!(!is_good_byte(0x7F));
        assert!(!is_good_byte(0x00));
        assert!(!is_good_byte(b'\t'));
    }
}

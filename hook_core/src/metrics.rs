use std::time::{Duration, Instant};

use tracing::info;

use ext_bridge::{ExecuteOutcome, Transfer};

/// Counters for the periodic log line.  Everything except `total_frames` resets each time a
/// summary is written.
#[derive(Debug)]
pub struct FrameMetrics {
    pub frames: u32,
    pub total_frames: u64,
    pub draw_calls: u64,
    pub captures: u32,
    pub replays: u32,
    pub bridge_masked: u32,
    pub bridge_copied: u32,
    pub bridge_skipped: u32,
    pub present_time: Duration,
    interval: Duration,
    last_log: Instant,
}

impl FrameMetrics {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            frames: 0,
            total_frames: 0,
            draw_calls: 0,
            captures: 0,
            replays: 0,
            bridge_masked: 0,
            bridge_copied: 0,
            bridge_skipped: 0,
            present_time: Duration::ZERO,
            interval,
            last_log: now,
        }
    }

    pub fn record_bridge(&mut self, outcome: ExecuteOutcome) {
        match outcome {
            ExecuteOutcome::Ran { transfer: Transfer::Masked, .. } => self.bridge_masked += 1,
            ExecuteOutcome::Ran { transfer: Transfer::Copied, .. } => self.bridge_copied += 1,
            ExecuteOutcome::Ran { .. } => {}
            ExecuteOutcome::Skipped(_) => self.bridge_skipped += 1,
        }
    }

    /// Count a finished frame and write the summary if the interval has passed.  Returns true
    /// if it did.
    pub fn end_frame(&mut self, now: Instant) -> bool {
        self.frames += 1;
        self.total_frames += 1;
        let elapsed = now.saturating_duration_since(self.last_log);
        if elapsed < self.interval {
            return false;
        }
        let secs = elapsed.as_secs_f64();
        let fps = self.frames as f64 / secs;
        let avg_present_us = self.present_time.as_micros() as f64 / self.frames as f64;
        info!(
            "{} frames in {:.*} secs ({:.*} fps), {} draws, {} captures, {} replays, \
             bridge {} masked / {} copied / {} skipped, {:.*}us avg present work",
            self.frames,
            2,
            secs,
            2,
            fps,
            self.draw_calls,
            self.captures,
            self.replays,
            self.bridge_masked,
            self.bridge_copied,
            self.bridge_skipped,
            1,
            avg_present_us
        );
        self.frames = 0;
        self.draw_calls = 0;
        self.captures = 0;
        self.replays = 0;
        self.bridge_masked = 0;
        self.bridge_copied = 0;
        self.bridge_skipped = 0;
        self.present_time = Duration::ZERO;
        self.last_log = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ext_bridge::SkipReason;

    #[test]
    fn logs_once_per_interval() {
        let t0 = Instant::now();
        let mut m = FrameMetrics::new(Duration::from_secs(10), t0);
        for i in 1..10 {
            assert!(!m.end_frame(t0 + Duration::from_secs(i)));
        }
        m.captures = 4;
        assert!(m.end_frame(t0 + Duration::from_secs(10)));
        assert_eq!(m.frames, 0);
        assert_eq!(m.captures, 0);
        assert_eq!(m.total_frames, 10);
        assert!(!m.end_frame(t0 + Duration::from_secs(11)));
    }

    #[test]
    fn bridge_outcomes() {
        let mut m = FrameMetrics::new(Duration::from_secs(10), Instant::now());
        m.record_bridge(ExecuteOutcome::Ran {
            transfer: Transfer::Masked,
            depth_synced: true,
        });
        m.record_bridge(ExecuteOutcome::Ran {
            transfer: Transfer::None,
            depth_synced: true,
        });
        m.record_bridge(ExecuteOutcome::Skipped(SkipReason::BuffersNotReady));
        assert_eq!((m.bridge_masked, m.bridge_copied, m.bridge_skipped), (1, 0, 1));
    }
}

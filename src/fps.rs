// Capture rate measurement
use std::time::{Duration, Instant};

/// Rolling capture-rate meter, reported once per interval
pub struct FpsCounter {
    /// When the current interval started
    last_report: Instant,
    /// Frames grabbed in the current interval
    frame_count: u32,
    /// Changed rectangles seen in the current interval
    rect_count: usize,
    /// Frames grabbed since creation
    total_frames: u64,
    /// Last calculated rate
    current_fps: f64,
    report_interval: Duration,
}

/// One interval's worth of measurements
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsReport {
    pub fps: f64,
    /// Average changed rectangles per frame
    pub rects_per_frame: f64,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(5))
    }

    pub fn with_interval(report_interval: Duration) -> Self {
        Self {
            last_report: Instant::now(),
            frame_count: 0,
            rect_count: 0,
            total_frames: 0,
            current_fps: 0.0,
            report_interval,
        }
    }

    /// Call after each grab with the number of changed rectangles.
    /// Returns a report once the interval has elapsed.
    pub fn tick(&mut self, rects: usize) -> Option<FpsReport> {
        self.frame_count += 1;
        self.rect_count += rects;
        self.total_frames += 1;

        let elapsed = self.last_report.elapsed();
        if elapsed >= self.report_interval {
            self.current_fps = f64::from(self.frame_count) / elapsed.as_secs_f64();
            let report = FpsReport {
                fps: self.current_fps,
                rects_per_frame: self.rect_count as f64 / f64::from(self.frame_count),
            };
            self.frame_count = 0;
            self.rect_count = 0;
            self.last_report = Instant::now();
            Some(report)
        } else {
            None
        }
    }

    /// Start a fresh interval, e.g. after the mode changed
    pub fn reset(&mut self) {
        self.frame_count = 0;
        self.rect_count = 0;
        self.last_report = Instant::now();
    }

    /// Get the last calculated FPS
    pub fn fps(&self) -> f64 {
        self.current_fps
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

//! Microphone level monitoring
//!
//! Watches a sliding window of recent frames and flags a microphone that is
//! muted or not capturing. The stream itself is never altered.

use std::collections::VecDeque;

use crate::audio::frame::AudioFrame;

/// Peak below this counts as "very quiet"
pub const LOW_PEAK_THRESHOLD: u16 = 100;

/// RMS below this fraction of full scale counts as "very quiet" (0.1 %)
pub const LOW_RMS_THRESHOLD: f32 = 0.001;

/// Peak and RMS of one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameLevel {
    /// Largest absolute sample
    pub peak: u16,
    /// RMS normalised to full scale (0.0 - 1.0)
    pub rms: f32,
}

impl FrameLevel {
    pub fn measure(frame: &AudioFrame) -> Self {
        let mut peak = 0u16;
        let mut sum_sq = 0.0f64;
        let mut count = 0usize;
        for sample in frame.samples() {
            peak = peak.max(sample.unsigned_abs());
            let v = sample as f64 / i16::MAX as f64;
            sum_sq += v * v;
            count += 1;
        }
        let rms = if count == 0 {
            0.0
        } else {
            (sum_sq / count as f64).sqrt() as f32
        };
        Self { peak, rms }
    }

    pub fn is_low(&self) -> bool {
        self.peak < LOW_PEAK_THRESHOLD && self.rms < LOW_RMS_THRESHOLD
    }
}

/// Raised once per quiet stretch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LowLevelWarning {
    /// Loudest peak seen in the window
    pub peak: u16,
    /// Mean RMS over the window
    pub rms: f32,
}

/// Sliding-window low level detector
pub struct LevelMonitor {
    window: VecDeque<FrameLevel>,
    capacity: usize,
    warned: bool,
    warnings: u64,
}

impl LevelMonitor {
    pub fn new(window_frames: usize) -> Self {
        let capacity = window_frames.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            warned: false,
            warnings: 0,
        }
    }

    /// Feed a frame. Returns a warning when the window has just become
    /// entirely quiet; stays silent until the level recovers.
    pub fn observe(&mut self, frame: &AudioFrame) -> Option<LowLevelWarning> {
        let level = FrameLevel::measure(frame);
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(level);

        if !level.is_low() {
            self.warned = false;
            return None;
        }

        if self.warned || self.window.len() < self.capacity {
            return None;
        }

        if self.window.iter().all(FrameLevel::is_low) {
            self.warned = true;
            self.warnings += 1;
            let peak = self.window.iter().map(|l| l.peak).max().unwrap_or(0);
            let rms = self.window.iter().map(|l| l.rms).sum::<f32>() / self.window.len() as f32;
            return Some(LowLevelWarning { peak, rms });
        }
        None
    }

    /// Warnings raised so far
    pub fn warnings(&self) -> u64 {
        self.warnings
    }

    /// Most recent frame level
    pub fn last(&self) -> Option<FrameLevel> {
        self.window.back().copied()
    }
}

//! Network quality monitoring
//!
//! Samples round-trip latency, derives jitter, and classifies link quality.
//! The position synchronizer reads the resulting interpolation window every
//! tick, so degrading quality smoothly widens the blend budget instead of
//! letting remote avatars stutter.

use shared::{DEFAULT_INTERPOLATION_MS, LATENCY_SAMPLE_CAPACITY};
use std::collections::VecDeque;
use std::time::Duration;

/// Link quality classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    /// No samples yet; consumers fall back to a safe default window.
    Unknown,
}

impl QualityLevel {
    /// Interpolation window for this quality level. Monotonically
    /// non-decreasing as quality degrades.
    pub fn interpolation_window(self) -> Duration {
        match self {
            QualityLevel::Excellent => Duration::from_millis(50),
            QualityLevel::Good => Duration::from_millis(100),
            QualityLevel::Fair => Duration::from_millis(150),
            QualityLevel::Poor => Duration::from_millis(200),
            QualityLevel::Unknown => Duration::from_millis(DEFAULT_INTERPOLATION_MS),
        }
    }
}

/// Bounded history of latency samples plus derived statistics.
pub struct NetworkQualityMonitor {
    samples: VecDeque<f32>,
    capacity: usize,
    level: QualityLevel,
}

impl NetworkQualityMonitor {
    pub fn new() -> Self {
        Self::with_capacity(LATENCY_SAMPLE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            level: QualityLevel::Unknown,
        }
    }

    /// Records one round-trip measurement. Negative and NaN samples are
    /// measurement noise and are ignored.
    pub fn record_sample(&mut self, latency_ms: f32) {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return;
        }
        self.samples.push_back(latency_ms);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn average_latency(&self) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f32>() / self.samples.len() as f32)
    }

    /// Mean absolute delta between consecutive samples.
    pub fn jitter(&self) -> Option<f32> {
        if self.samples.len() < 2 {
            return if self.samples.is_empty() {
                None
            } else {
                Some(0.0)
            };
        }
        let total: f32 = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .map(|(a, b)| (b - a).abs())
            .sum();
        Some(total / (self.samples.len() - 1) as f32)
    }

    /// Re-classifies link quality from the current sample window and
    /// returns the new level. Called on a fixed period, not per sample.
    pub fn assess(&mut self) -> QualityLevel {
        let (Some(avg), Some(jitter)) = (self.average_latency(), self.jitter()) else {
            self.level = QualityLevel::Unknown;
            return self.level;
        };

        self.level = if avg < 50.0 && jitter < 10.0 {
            QualityLevel::Excellent
        } else if avg < 100.0 && jitter < 20.0 {
            QualityLevel::Good
        } else if avg < 200.0 && jitter < 50.0 {
            QualityLevel::Fair
        } else {
            QualityLevel::Poor
        };
        self.level
    }

    /// Most recent classification without recomputing.
    pub fn level(&self) -> QualityLevel {
        self.level
    }

    /// Window the synchronizer should use right now.
    pub fn interpolation_window(&self) -> Duration {
        self.level.interpolation_window()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Clears history. Called on (re)connection: samples from the previous
    /// link say nothing about the new one.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.level = QualityLevel::Unknown;
    }
}

impl Default for NetworkQualityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

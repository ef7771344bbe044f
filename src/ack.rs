//! Service mode ACK detection on the track current.
//!
//! A decoder acknowledges a service mode packet by drawing at least 60 mA more
//! for 6 ms (RCN-216). The detector slides a window of 5 ms over all current
//! samples collected since the CV packets started. The first window is the
//! reference. Any later window whose sum exceeds the reference by
//! `window * delta` is an ACK, unless 10% or more of its samples are zero
//! (ADC dropouts).

use alloc::vec::Vec;

use crate::config::AnalogCalibration;

/// Minimum ACK duration the window covers [ms].
pub const ACK_MIN_DURATION_MS: u32 = 5;

/// Sliding window ACK detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckDetector {
    window: usize,
    delta: u32,
}

impl AckDetector {
    /// Detector with `window` samples and a per-sample threshold of `delta`
    /// raw measurement units.
    pub fn new(window: usize, delta: u32) -> Self {
        Self {
            window: window.max(1),
            delta,
        }
    }

    /// Detector for `ack_current_ma` using the ADC calibration.
    pub fn from_calibration(calibration: &AnalogCalibration, ack_current_ma: u16) -> Self {
        Self::new(
            calibration.samples_for_ms(ACK_MIN_DURATION_MS),
            calibration.milliamps_to_measurement(ack_current_ma),
        )
    }

    /// Window length in samples.
    pub fn window(&self) -> usize {
        self.window
    }

    /// True if `samples` contain an ACK pulse.
    pub fn detect(&self, samples: &[u16]) -> bool {
        if samples.len() < self.window {
            return false;
        }
        let ten_pct = self.window / 10;
        let threshold = self.window as i64 * self.delta as i64;

        let mut windows = samples.windows(self.window);
        let Some(first) = windows.next() else {
            return false;
        };
        let reference = sum(first);

        windows.any(|w| {
            let zeros = w.iter().filter(|&&s| s == 0).count();
            zeros < ten_pct && sum(w) - reference > threshold
        })
    }
}

fn sum(window: &[u16]) -> i64 {
    window.iter().map(|&s| s as i64).sum()
}

/// Current samples collected while one CV request is on the track.
#[derive(Clone, Debug, Default)]
pub struct CurrentRecorder {
    samples: Vec<u16>,
}

impl CurrentRecorder {
    /// Empty recorder.
    pub fn new() -> Self {
        Self {
            samples: Vec::with_capacity(2048),
        }
    }

    /// Appends `window` unless it is the window appended last.
    ///
    /// The ADC publishes a new window every 20 ms while packets take about
    /// 5 ms, so the same window is usually peeked several times.
    pub fn append(&mut self, window: &[u16]) {
        let n = window.len();
        if self.samples.len() < n || self.samples[self.samples.len() - n..] != *window {
            self.samples.extend_from_slice(window);
        }
    }

    /// All samples.
    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    /// Forgets all samples.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> AckDetector {
        AckDetector::new(20, 46)
    }

    // =========================================================================
    // AckDetector Tests
    // =========================================================================

    #[test]
    fn flat_current_is_no_ack() {
        let samples = [300u16; 200];
        assert!(!detector().detect(&samples));
    }

    #[test]
    fn pulse_above_threshold_is_ack() {
        let mut samples = vec![300u16; 100];
        samples.extend([360u16; 40]);
        samples.extend([300u16; 60]);
        assert!(detector().detect(&samples));
    }

    #[test]
    fn pulse_below_threshold_is_no_ack() {
        let mut samples = vec![300u16; 100];
        samples.extend([340u16; 40]);
        assert!(!detector().detect(&samples));
    }

    #[test]
    fn dropouts_reject_window() {
        let mut samples = vec![300u16; 20];
        // Huge pulse, but every second sample is a dropout
        samples.extend((0..40).map(|i| if i % 2 == 0 { 0 } else { 1000 }));
        assert!(!detector().detect(&samples));
    }

    #[test]
    fn too_few_samples() {
        assert!(!detector().detect(&[1000u16; 19]));
        assert!(!AckDetector::new(0, 0).detect(&[]));
    }

    #[test]
    fn calibrated_window() {
        let detector = AckDetector::from_calibration(&AnalogCalibration::default(), 50);
        assert_eq!(detector.window(), 20);
    }

    // =========================================================================
    // CurrentRecorder Tests
    // =========================================================================

    #[test]
    fn recorder_skips_repeated_window() {
        let mut recorder = CurrentRecorder::new();
        recorder.append(&[1, 2, 3]);
        recorder.append(&[1, 2, 3]);
        assert_eq!(recorder.samples(), &[1, 2, 3]);

        recorder.append(&[4, 5, 6]);
        assert_eq!(recorder.samples().len(), 6);

        recorder.clear();
        assert!(recorder.samples().is_empty());
    }
}

use std::time::SystemTime;

use crate::error::{MpsError, Result};

/// One acquisition's worth of voltage samples from a single analog channel.
#[derive(Clone, Debug)]
pub struct Waveform {
    captured_at: SystemTime,
    sample_rate_hz: f64,
    samples: Vec<f64>,
}

impl Waveform {
    pub fn new(sample_rate_hz: f64, samples: Vec<f64>) -> Result<Self> {
        if !(sample_rate_hz > 0.0) {
            return Err(MpsError::InvalidSampleRate);
        }
        if samples.is_empty() {
            return Err(MpsError::EmptyWaveform);
        }
        Ok(Self {
            captured_at: SystemTime::now(),
            sample_rate_hz,
            samples,
        })
    }

    /// Same as [`Waveform::new`] but rejects captures that came back short or long.
    pub fn with_expected_len(
        sample_rate_hz: f64,
        samples: Vec<f64>,
        expected: usize,
    ) -> Result<Self> {
        if samples.len() != expected {
            return Err(MpsError::SampleCountMismatch {
                expected,
                actual: samples.len(),
            });
        }
        Self::new(sample_rate_hz, samples)
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }
}

/// Number of samples covering `num_periods` drive periods: round(periods * fs / f_drive).
pub fn samples_for_periods(num_periods: u32, sample_rate_hz: f64, drive_hz: f64) -> Result<usize> {
    if !(sample_rate_hz > 0.0) {
        return Err(MpsError::InvalidSampleRate);
    }
    if !(drive_hz > 0.0) {
        return Err(MpsError::InvalidDriveFrequency);
    }
    let n = (num_periods as f64 * sample_rate_hz / drive_hz).round() as usize;
    if n == 0 {
        return Err(MpsError::EmptyWaveform);
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_count_for_reference_scenario() {
        assert_eq!(samples_for_periods(100, 100_000.0, 1000.0).unwrap(), 10_000);
        assert_eq!(samples_for_periods(3, 1000.0, 300.0).unwrap(), 10);
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(matches!(
            Waveform::new(0.0, vec![1.0]),
            Err(MpsError::InvalidSampleRate)
        ));
        assert!(matches!(
            Waveform::new(10.0, vec![]),
            Err(MpsError::EmptyWaveform)
        ));
        assert!(matches!(
            Waveform::with_expected_len(10.0, vec![0.0; 3], 4),
            Err(MpsError::SampleCountMismatch { expected: 4, actual: 3 })
        ));
        assert!(matches!(
            samples_for_periods(1, 10.0, 0.0),
            Err(MpsError::InvalidDriveFrequency)
        ));
    }
}

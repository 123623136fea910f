use std::f64::consts::PI;

use rustfft::{num_complex::Complex64, FftPlanner};

use crate::dsp::Waveform;

/// One-sided harmonic spectrum of a single capture.
///
/// All four vectors have the same length and share indexing; frequencies are
/// non-negative and ascending, coefficients are normalised by the sample count.
#[derive(Clone, Debug)]
pub struct Spectrum {
    pub sample_rate_hz: f64,
    pub num_samples: usize,
    pub frequencies_hz: Vec<f64>,
    pub complex: Vec<Complex64>,
    pub magnitudes: Vec<f64>,
    pub phases: Vec<f64>,
}

impl Spectrum {
    /// Builds a spectrum from complex bins, deriving magnitude and phase.
    pub fn from_complex(
        sample_rate_hz: f64,
        num_samples: usize,
        frequencies_hz: Vec<f64>,
        complex: Vec<Complex64>,
    ) -> Self {
        let magnitudes = complex.iter().map(|c| c.norm()).collect();
        let phases = complex.iter().copied().map(phase_of).collect();
        Self {
            sample_rate_hz,
            num_samples,
            frequencies_hz,
            complex,
            magnitudes,
            phases,
        }
    }

    pub fn len(&self) -> usize {
        self.frequencies_hz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies_hz.is_empty()
    }

    /// Spacing between adjacent bins, fs / N.
    pub fn bin_spacing_hz(&self) -> f64 {
        self.sample_rate_hz / self.num_samples as f64
    }

    /// Index of the bin closest to `frequency_hz`, or `None` if it lies outside the spectrum.
    pub fn nearest_bin(&self, frequency_hz: f64) -> Option<usize> {
        if self.is_empty() || frequency_hz < 0.0 {
            return None;
        }
        let idx = (frequency_hz / self.bin_spacing_hz()).round() as usize;
        (idx < self.len()).then_some(idx)
    }

    /// Magnitude and phase at the bin nearest to `order * drive_hz`.
    pub fn harmonic(&self, order: u32, drive_hz: f64) -> Option<(f64, f64)> {
        let idx = self.nearest_bin(order as f64 * drive_hz)?;
        Some((*self.magnitudes.get(idx)?, *self.phases.get(idx)?))
    }

    /// Zeroes one bin in all representations.
    pub(crate) fn clear_bin(&mut self, idx: usize) {
        self.complex[idx] = Complex64::new(0.0, 0.0);
        self.magnitudes[idx] = 0.0;
        self.phases[idx] = 0.0;
    }
}

/// Phase in (-pi, pi]; an exactly-zero coefficient has phase 0.
pub fn phase_of(c: Complex64) -> f64 {
    if c.re == 0.0 && c.im == 0.0 {
        return 0.0;
    }
    let phase = c.im.atan2(c.re);
    if phase <= -PI {
        PI
    } else {
        phase
    }
}

/// Frequencies of bins 0..N in FFT order, folded so that k >= N/2 are negative.
pub fn fft_frequencies(num_samples: usize, sample_rate_hz: f64) -> Vec<f64> {
    let spacing = sample_rate_hz / num_samples as f64;
    let positive = (num_samples - 1) / 2 + 1;
    (0..num_samples)
        .map(|k| {
            if k < positive {
                k as f64 * spacing
            } else {
                (k as f64 - num_samples as f64) * spacing
            }
        })
        .collect()
}

/// Forward DFT of a capture, normalised by N, keeping only non-negative frequencies.
pub fn analyze_harmonics(waveform: &Waveform) -> Spectrum {
    let mut planner = FftPlanner::<f64>::new();
    analyze_with(&mut planner, waveform)
}

/// Reuses a planner across captures of the same length (live view).
pub fn analyze_with(planner: &mut FftPlanner<f64>, waveform: &Waveform) -> Spectrum {
    let n = waveform.len();
    let fs = waveform.sample_rate_hz();
    let fft = planner.plan_fft_forward(n);
    let mut buffer: Vec<Complex64> = waveform
        .samples()
        .iter()
        .map(|&v| Complex64::new(v, 0.0))
        .collect();
    fft.process(&mut buffer);
    let scale = 1.0 / n as f64;
    let (frequencies, complex): (Vec<f64>, Vec<Complex64>) = fft_frequencies(n, fs)
        .into_iter()
        .zip(buffer)
        .filter(|(freq, _)| *freq >= 0.0)
        .map(|(freq, c)| (freq, c * scale))
        .unzip();
    Spectrum::from_complex(fs, n, frequencies, complex)
}

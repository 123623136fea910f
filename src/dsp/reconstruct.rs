use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::dsp::Spectrum;
use crate::error::{MpsError, Result};

/// Dense time grid the harmonic synthesis is evaluated on.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisGrid {
    /// Drive periods covered by the grid.
    pub periods: u32,
    /// Total grid points, endpoint included.
    pub points: usize,
}

impl Default for SynthesisGrid {
    fn default() -> Self {
        Self {
            periods: 4,
            points: 40_000,
        }
    }
}

impl SynthesisGrid {
    fn validate(&self) -> Result<()> {
        if self.periods < 2 {
            return Err(MpsError::InvalidGrid(format!(
                "need at least 2 periods, got {}",
                self.periods
            )));
        }
        if self.points < 4 * self.periods as usize {
            return Err(MpsError::InvalidGrid(format!(
                "{} points is too coarse for {} periods",
                self.points, self.periods
            )));
        }
        Ok(())
    }

    /// Start index and length of the one-period window taken from the interior.
    ///
    /// The window starts 0.75 periods into the grid so neither edge is used.
    fn period_window(&self) -> (usize, usize) {
        let per_period = self.points / self.periods as usize;
        let start = per_period / 2 + per_period / 4;
        (start, per_period)
    }

    fn times(&self, drive_hz: f64) -> impl Iterator<Item = f64> {
        let span = self.periods as f64 / drive_hz;
        let step = span / (self.points - 1) as f64;
        (0..self.points).map(move |i| i as f64 * step)
    }
}

/// One drive period synthesised from a spectrum, plus its time integral.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReconstructedPeriod {
    pub waveform: Vec<f64>,
    /// Running integral with the mean of the window removed.
    pub integral: Vec<f64>,
}

impl ReconstructedPeriod {
    pub fn len(&self) -> usize {
        self.waveform.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waveform.is_empty()
    }
}

/// Synthesises `sum c_k cos(w_k t + p_k)` and its integral `sum c_k/w_k sin(w_k t + p_k)`.
///
/// The DC bin is skipped. `phases` of `None` synthesises with zero phase, which
/// is what the bench does when only magnitudes are plotted.
pub fn reconstruct_period(
    frequencies_hz: &[f64],
    coefficients: &[f64],
    phases: Option<&[f64]>,
    drive_hz: f64,
    grid: SynthesisGrid,
) -> Result<ReconstructedPeriod> {
    if !(drive_hz > 0.0) {
        return Err(MpsError::InvalidDriveFrequency);
    }
    grid.validate()?;
    let (start, len) = grid.period_window();
    let times: Vec<f64> = grid.times(drive_hz).skip(start).take(len).collect();
    let mut waveform = vec![0.0; len];
    let mut integral = vec![0.0; len];

    for (k, (&freq, &coeff)) in frequencies_hz.iter().zip(coefficients).enumerate() {
        let omega = 2.0 * PI * freq;
        // Empty bins contribute nothing.
        if omega == 0.0 || coeff == 0.0 {
            continue;
        }
        let phase = phases.and_then(|p| p.get(k)).copied().unwrap_or(0.0);
        for ((t, out), acc) in times.iter().zip(&mut waveform).zip(&mut integral) {
            let arg = omega * t + phase;
            *out += coeff * arg.cos();
            *acc += coeff / omega * arg.sin();
        }
    }

    let mean = integral.iter().sum::<f64>() / len as f64;
    integral.iter_mut().for_each(|v| *v -= mean);
    Ok(ReconstructedPeriod { waveform, integral })
}

impl Spectrum {
    /// Reconstructs one period from the magnitudes, optionally honouring phases.
    pub fn reconstruct_period(
        &self,
        drive_hz: f64,
        with_phase: bool,
        grid: SynthesisGrid,
    ) -> Result<ReconstructedPeriod> {
        let phases = with_phase.then_some(self.phases.as_slice());
        reconstruct_period(&self.frequencies_hz, &self.magnitudes, phases, drive_hz, grid)
    }
}

/// Applied field over one period, `H(t) = H_peak * cos(w t - pi)`.
pub fn field_period(peak: f64, drive_hz: f64, points: usize) -> Vec<f64> {
    if points < 2 {
        return vec![-peak; points];
    }
    let omega = 2.0 * PI * drive_hz;
    let step = 1.0 / drive_hz / (points - 1) as f64;
    (0..points)
        .map(|i| peak * (omega * i as f64 * step - PI).cos())
        .collect()
}

/// Finite-difference derivative with unit spacing: central in the interior,
/// second-order one-sided at both ends.
pub fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        2 => vec![values[1] - values[0]; 2],
        _ => {
            let mut out = Vec::with_capacity(n);
            out.push((-3.0 * values[0] + 4.0 * values[1] - values[2]) / 2.0);
            out.extend(values.windows(3).map(|w| (w[2] - w[0]) / 2.0));
            out.push((3.0 * values[n - 1] - 4.0 * values[n - 2] + values[n - 3]) / 2.0);
            out
        }
    }
}

/// Differential susceptibility dM/dH along a period.
///
/// End points are forced to zero and points where H is stationary give zero.
pub fn differential_susceptibility(magnetization: &[f64], field: &[f64]) -> Vec<f64> {
    let dm = gradient(magnetization);
    let dh = gradient(field);
    let mut out: Vec<f64> = dm
        .iter()
        .zip(&dh)
        .map(|(&m, &h)| if h.abs() <= f64::EPSILON { 0.0 } else { m / h })
        .collect();
    if let Some(first) = out.first_mut() {
        *first = 0.0;
    }
    if let Some(last) = out.last_mut() {
        *last = 0.0;
    }
    out
}

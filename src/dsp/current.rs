//! Hall-effect current transducer on the excitation coil.
//!
//! The transducer outputs `VQ + sensitivity * i`, where the quiescent voltage
//! `VQ` is half of its supply. The RMS current of the coil drive is recovered
//! from one capture of that output:
//!
//! - `i[n] = (v[n] - VQ) / sensitivity`
//! - `i_rms = sqrt(mean(i^2))`
//!
//! The peak field follows from the coil constant: `H = k * i_rms * sqrt(2)`.
use serde::{Deserialize, Serialize};

use crate::dsp::Waveform;

/// Transfer function of a current-sense transducer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentSensor {
    /// Transducer supply voltage (V); the zero-current output sits at half of it.
    pub supply_voltage_v: f64,
    /// Output slope in volts per ampere.
    pub sensitivity_v_per_a: f64,
}

impl Default for CurrentSensor {
    fn default() -> Self {
        // 5 V part with a 100 mV/A slope, as fitted on the bench.
        Self {
            supply_voltage_v: 5.0,
            sensitivity_v_per_a: 0.1,
        }
    }
}

impl CurrentSensor {
    pub fn quiescent_voltage(&self) -> f64 {
        0.5 * self.supply_voltage_v
    }

    /// Instantaneous coil current for one transducer reading.
    pub fn current_from_voltage(&self, volts: f64) -> f64 {
        (volts - self.quiescent_voltage()) / self.sensitivity_v_per_a
    }

    /// Transducer output for a given coil current (inverse of [`Self::current_from_voltage`]).
    pub fn voltage_for_current(&self, amps: f64) -> f64 {
        self.quiescent_voltage() + amps * self.sensitivity_v_per_a
    }

    /// Root-mean-square current over every sample of the capture.
    pub fn estimate_rms_current(&self, waveform: &Waveform) -> f64 {
        let samples = waveform.samples();
        let sum_sq: f64 = samples
            .iter()
            .map(|&v| {
                let amps = self.current_from_voltage(v);
                amps * amps
            })
            .sum();
        (sum_sq / samples.len() as f64).sqrt()
    }
}

/// Peak field amplitude for a sinusoidal coil current of the given RMS value.
pub fn field_from_rms_current(field_per_amp: f64, i_rms: f64) -> f64 {
    field_per_amp * i_rms * std::f64::consts::SQRT_2
}

//! Bench configuration.
//!
//! Every section has the defaults the rig has been run with, so a config file
//! only needs to list what differs.
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::dsp::{CurrentSensor, SynthesisGrid};
use crate::instruments::daqmx;
use crate::instruments::sim::BenchModel;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub daq: DaqConfig,
    pub excitation: ExcitationConfig,
    pub instruments: InstrumentConfig,
    pub current_sensor: CurrentSensor,
    pub coil: CoilConfig,
    pub timing: TimingConfig,
    pub sweep: SweepConfig,
    pub calibration: CalibrationConfig,
    pub reconstruction: SynthesisGrid,
    pub simulation: BenchModel,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    pub signal_channel: String,
    pub current_channel: String,
    pub trigger_channel: String,
    /// Gate every capture on the generator's sync output.
    pub triggering: bool,
    pub sample_rate_hz: f64,
    pub num_periods: u32,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub timeout_secs: f64,
    pub library: String,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            signal_channel: "Dev3/ai0".to_owned(),
            current_channel: "Dev3/ai1".to_owned(),
            trigger_channel: "/Dev3/pfi0".to_owned(),
            triggering: true,
            // Plenty for the 11th harmonic of a 1 kHz drive.
            sample_rate_hz: 100_000.0,
            num_periods: 100,
            min_voltage: -10.0,
            max_voltage: 10.0,
            timeout_secs: daqmx::DEFAULT_TIMEOUT.as_secs_f64(),
            library: daqmx::DEFAULT_LIBRARY.to_owned(),
        }
    }
}

impl DaqConfig {
    pub fn trigger(&self) -> Option<String> {
        self.triggering.then(|| self.trigger_channel.clone())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

/// Excitation amplitude, either straight in volts or as a field target.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Amplitude {
    Volts(f64),
    Millitesla(f64),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExcitationConfig {
    pub frequency_hz: f64,
    pub channel: u8,
    pub amplitude: Amplitude,
    /// DC current through the bias coils, 0 leaves the supply untouched.
    pub bias_current_a: f64,
    pub only_odd_harmonics: bool,
    /// Generator amplitudes above this wrap back to 0 V.
    pub amplitude_ceiling_v: f64,
}

impl Default for ExcitationConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 1000.0,
            channel: 1,
            amplitude: Amplitude::Millitesla(10.0),
            bias_current_a: 0.0,
            only_odd_harmonics: false,
            amplitude_ceiling_v: 4.5,
        }
    }
}

impl ExcitationConfig {
    pub fn bias(&self) -> Option<f64> {
        (self.bias_current_a != 0.0).then_some(self.bias_current_a)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub waveform_generator_port: String,
    pub power_supply_port: String,
    pub baud_rate: u32,
    /// Voltage limit programmed on the bias supply.
    pub compliance_voltage_v: f64,
    pub io_timeout_ms: u64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            waveform_generator_port: "/dev/ttyUSB0".to_owned(),
            power_supply_port: "/dev/ttyUSB1".to_owned(),
            baud_rate: 9600,
            compliance_voltage_v: 12.0,
            io_timeout_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoilConfig {
    /// Peak field per amp of coil current (mT/A); depends on the rig size.
    pub field_per_amp_mt: f64,
}

impl Default for CoilConfig {
    fn default() -> Self {
        Self {
            field_per_amp_mt: 5.0093,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait between programming the generator and trusting a capture.
    pub settle_ms: u64,
    /// Wait between sweep steps.
    pub step_settle_ms: u64,
    /// Wait between calibration steps.
    pub calibration_step_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 10,
            step_settle_ms: 10,
            calibration_step_ms: 50,
        }
    }
}

impl TimingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn step_settle(&self) -> Duration {
        Duration::from_millis(self.step_settle_ms)
    }

    pub fn calibration_step(&self) -> Duration {
        Duration::from_millis(self.calibration_step_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub num_steps: usize,
    pub max_field_mt: f64,
    pub max_bias_a: f64,
    pub max_harmonic: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            num_steps: 50,
            max_field_mt: 25.0,
            max_bias_a: 10.0,
            max_harmonic: 11,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub steps: usize,
    pub step_v: f64,
    pub ceiling_v: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            steps: 50,
            step_v: 0.05,
            ceiling_v: 3.0,
        }
    }
}

impl BenchConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: BenchConfig = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.daq.sample_rate_hz > 0.0) {
            bail!("daq.sample_rate_hz must be positive");
        }
        if self.daq.num_periods == 0 {
            bail!("daq.num_periods must be at least 1");
        }
        if !(self.excitation.frequency_hz > 0.0) {
            bail!("excitation.frequency_hz must be positive");
        }
        if self.excitation.frequency_hz * 2.0 > self.daq.sample_rate_hz {
            bail!(
                "sample rate {} Hz cannot resolve a {} Hz drive",
                self.daq.sample_rate_hz,
                self.excitation.frequency_hz
            );
        }
        if !(self.current_sensor.sensitivity_v_per_a > 0.0) {
            bail!("current_sensor.sensitivity_v_per_a must be positive");
        }
        if !(self.coil.field_per_amp_mt > 0.0) {
            bail!("coil.field_per_amp_mt must be positive");
        }
        if self.sweep.num_steps == 0 || self.calibration.steps < 2 {
            bail!("sweeps need at least one step and calibration at least two");
        }
        if self.sweep.max_harmonic == 0 {
            bail!("sweep.max_harmonic must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BenchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.daq.trigger().as_deref(), Some("/Dev3/pfi0"));
        assert_eq!(config.excitation.bias(), None);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.json");
        fs::write(
            &path,
            r#"{ "excitation": { "frequency_hz": 2000.0, "amplitude": { "volts": 1.5 } },
                 "daq": { "triggering": false } }"#,
        )
        .unwrap();
        let config = BenchConfig::load(&path).unwrap();
        assert_eq!(config.excitation.frequency_hz, 2000.0);
        assert_eq!(config.excitation.amplitude, Amplitude::Volts(1.5));
        assert_eq!(config.excitation.channel, 1);
        assert_eq!(config.daq.trigger(), None);
        assert_eq!(config.coil.field_per_amp_mt, 5.0093);
    }

    #[test]
    fn save_then_load_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.json");
        let mut config = BenchConfig::default();
        config.sweep.num_steps = 7;
        config.save(&path).unwrap();
        assert_eq!(BenchConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn rejects_undersampled_drive() {
        let mut config = BenchConfig::default();
        config.excitation.frequency_hz = 60_000.0;
        assert!(config.validate().is_err());
    }
}

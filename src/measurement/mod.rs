// src/measurement/mod.rs
pub mod background;
pub mod calibrate;
pub mod sample;
pub mod session;
pub mod sweep;

use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::BenchConfig;
use crate::dsp::samples_for_periods;
use crate::error::{HardwareStage, MpsError, Result};
use crate::instruments::{Acquirer, BiasSource, CaptureRequest, Clock, Rig, SignalSource};

pub use background::{capture_background, BackgroundRecord};
pub use calibrate::{fit_line, CalibrationCurve, CalibrationPlan, Calibrator};
pub use sample::{
    keep_odd_harmonics, subtract_background, MagnetizationCurve, SampleMeasurement, SampleResult,
};
pub use session::{Session, SessionState};
pub use sweep::{
    CancelToken, SweepController, SweepKind, SweepPlan, SweepPoint, SweepSeries, SweepState,
};

/// What the generator and bias supply are asked to produce.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Excitation {
    pub amplitude_vpp: f64,
    pub frequency_hz: f64,
    pub channel: u8,
    /// DC bias current; `None` leaves the supply alone.
    pub bias_a: Option<f64>,
}

/// How the DAQ card is set up for one measurement.
#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionPlan {
    pub signal_channel: String,
    pub current_channel: String,
    pub trigger: Option<String>,
    pub sample_rate_hz: f64,
    pub num_periods: u32,
    pub timeout: Duration,
    /// Delay between programming the generator and the first capture.
    pub settle: Duration,
}

impl AcquisitionPlan {
    pub fn from_config(config: &BenchConfig) -> Self {
        Self {
            signal_channel: config.daq.signal_channel.clone(),
            current_channel: config.daq.current_channel.clone(),
            trigger: config.daq.trigger(),
            sample_rate_hz: config.daq.sample_rate_hz,
            num_periods: config.daq.num_periods,
            timeout: config.daq.timeout(),
            settle: config.timing.settle(),
        }
    }

    pub fn num_samples(&self, drive_hz: f64) -> Result<usize> {
        samples_for_periods(self.num_periods, self.sample_rate_hz, drive_hz)
    }

    pub fn request(&self, channel: &str, num_samples: usize) -> CaptureRequest {
        CaptureRequest {
            channel: channel.to_owned(),
            sample_rate_hz: self.sample_rate_hz,
            num_samples,
            trigger: self.trigger.clone(),
            timeout: self.timeout,
        }
    }
}

/// Enables bias and excitation, waits `settle`, runs `body` against the DAQ and
/// switches both outputs off again.
///
/// A failing stage stops the sequence. Outputs that were already enabled are
/// still switched off, and the first error is the one returned.
pub(crate) fn with_outputs<S, B, A, C, T>(
    rig: &mut Rig<S, B, A, C>,
    excitation: &Excitation,
    settle: Duration,
    body: impl FnOnce(&mut A) -> Result<T>,
) -> Result<T>
where
    S: SignalSource,
    B: BiasSource,
    A: Acquirer,
    C: Clock,
{
    let bias = match excitation.bias_a {
        Some(current_a) => {
            debug!("bias supply -> {current_a} A");
            Some(
                rig.bias
                    .program(current_a)
                    .map_err(MpsError::hardware(HardwareStage::BiasSource))?,
            )
        }
        None => None,
    };

    debug!(
        "generator ch{} -> {} Vpp @ {} Hz",
        excitation.channel, excitation.amplitude_vpp, excitation.frequency_hz
    );
    if let Err(source) = rig.source.program(
        excitation.amplitude_vpp,
        excitation.frequency_hz,
        excitation.channel,
    ) {
        if let Some(handle) = bias {
            if let Err(e) = rig.bias.off(handle) {
                warn!("bias supply did not switch off after generator fault: {e}");
            }
        }
        return Err(MpsError::Hardware {
            stage: HardwareStage::SignalSource,
            source,
        });
    }

    rig.clock.sleep(settle);
    let outcome = body(&mut rig.daq);

    debug!("generator ch{} -> off", excitation.channel);
    let source_off = rig
        .source
        .off(excitation.channel)
        .map_err(MpsError::hardware(HardwareStage::SignalSource));
    let bias_off = match bias {
        Some(handle) => {
            debug!("bias supply -> off");
            rig.bias
                .off(handle)
                .map_err(MpsError::hardware(HardwareStage::BiasSource))
        }
        None => Ok(()),
    };

    match outcome {
        Ok(value) => {
            source_off?;
            bias_off?;
            Ok(value)
        }
        Err(e) => {
            for off in [source_off, bias_off] {
                if let Err(off_err) = off {
                    warn!("output shutdown after failed capture: {off_err}");
                }
            }
            Err(e)
        }
    }
}

/// Captures `num_samples` from `channel`, tagging failures with `stage`.
pub(crate) fn capture<A: Acquirer>(
    daq: &mut A,
    plan: &AcquisitionPlan,
    channel: &str,
    num_samples: usize,
    stage: HardwareStage,
) -> Result<crate::dsp::Waveform> {
    let request = plan.request(channel, num_samples);
    debug!("capture {channel}: {num_samples} samples @ {} Hz", plan.sample_rate_hz);
    let samples = daq
        .capture(&request)
        .map_err(MpsError::hardware(stage))?;
    crate::dsp::Waveform::with_expected_len(plan.sample_rate_hz, samples, num_samples)
}

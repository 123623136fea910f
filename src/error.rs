use std::fmt;
use thiserror::Error;

use crate::instruments::InstrumentError;

/// Hardware stage that was active when an instrument call failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HardwareStage {
    SignalSource,
    BiasSource,
    SignalAcquisition,
    CurrentAcquisition,
}

impl fmt::Display for HardwareStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HardwareStage::SignalSource => "waveform generator",
            HardwareStage::BiasSource => "DC bias supply",
            HardwareStage::SignalAcquisition => "signal acquisition",
            HardwareStage::CurrentAcquisition => "current-sense acquisition",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum MpsError {
    #[error("{stage} failed: {source}")]
    Hardware {
        stage: HardwareStage,
        #[source]
        source: InstrumentError,
    },
    #[error("no background captured yet; capture one before measuring a sample")]
    NoBackground,
    #[error("background is stale: captured with {captured}, measurement uses {requested}")]
    StaleBackground { captured: String, requested: String },
    #[error("no volts-to-field calibration; run the calibrator first")]
    NoCalibration,
    #[error("sample rate must be greater than zero")]
    InvalidSampleRate,
    #[error("drive frequency must be greater than zero")]
    InvalidDriveFrequency,
    #[error("waveform has no samples")]
    EmptyWaveform,
    #[error("sample count mismatch: expected {expected}, got {actual}")]
    SampleCountMismatch { expected: usize, actual: usize },
    #[error("calibration fit is degenerate: {0}")]
    DegenerateFit(String),
    #[error("invalid reconstruction grid: {0}")]
    InvalidGrid(String),
    #[error("a sweep is already running")]
    SweepBusy,
    #[error("operation cancelled")]
    Cancelled,
}

impl MpsError {
    pub fn hardware(stage: HardwareStage) -> impl FnOnce(InstrumentError) -> MpsError {
        move |source| MpsError::Hardware { stage, source }
    }
}

pub type Result<T, E = MpsError> = std::result::Result<T, E>;

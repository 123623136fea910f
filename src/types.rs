// src/types.rs
use crate::config::Amplitude;
use crate::dsp::Spectrum;
use crate::measurement::{
    CalibrationCurve, MagnetizationCurve, SampleResult, SessionState, SweepKind, SweepPoint,
    SweepSeries,
};

// 发给引擎线程的命令
#[derive(Clone, Debug)]
pub enum EngineCommand {
    Calibrate,
    CaptureBackground,
    MeasureSample,
    RunSweep(SweepKind),
    // 实时频谱
    StartLive,
    StopLive,
    SetFieldAmplitude(Amplitude),
    SetBias(f64),
    SetOddHarmonicsOnly(bool),
    Shutdown,
}

// 引擎线程发回的消息
#[derive(Clone, Debug)]
pub enum EngineMessage {
    Log(String),
    State(SessionState),
    Calibration(CalibrationCurve),
    BackgroundCaptured { num_samples: usize, bins: usize },
    Sample {
        result: Box<SampleResult>,
        curve: Option<MagnetizationCurve>,
    },
    SweepProgress(SweepPoint),
    SweepFinished(SweepSeries),
    SweepAborted { kind: SweepKind, points: usize, reason: String },
    LiveSpectrum(Box<Spectrum>),
    LiveStatus(bool),
    Error(String),
}

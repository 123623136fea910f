// src/dsp/mod.rs
pub mod current;
pub mod fft;
pub mod reconstruct;
pub mod waveform;

pub use current::{field_from_rms_current, CurrentSensor};
pub use fft::{analyze_harmonics, analyze_with, fft_frequencies, phase_of, Spectrum};
pub use reconstruct::{
    differential_susceptibility, field_period, gradient, reconstruct_period, ReconstructedPeriod,
    SynthesisGrid,
};
pub use waveform::{samples_for_periods, Waveform};

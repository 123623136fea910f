//! Magnetic particle spectrometer bench: drives the excitation and bias coils,
//! digitizes the pickup coil and turns the captures into background-corrected
//! harmonic spectra, magnetization curves and sweep series.
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod instruments;
pub mod measurement;
pub mod types;

pub use config::BenchConfig;
pub use error::{MpsError, Result};
pub use measurement::Session;

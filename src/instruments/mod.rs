// src/instruments/mod.rs
//! Capabilities the measurement layer needs from the bench hardware.
//!
//! Real adapters live in [`scpi`] (waveform generator, DC supply) and
//! [`daqmx`] (acquisition card); [`sim`] provides a software bench with the
//! same interfaces for tests and dry runs.
pub mod daqmx;
pub mod scpi;
pub mod sim;

use std::thread;
use std::time::Duration;

use thiserror::Error;

pub use daqmx::DaqmxAcquirer;
pub use scpi::{ScpiLink, ScpiPowerSupply, ScpiWaveformGenerator};
pub use sim::{BenchEvent, SimulatedBench};

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("failed to load driver library: {0}")]
    Library(#[from] libloading::Error),
    #[error("{context} failed (driver code {code})")]
    Driver { code: i32, context: String },
    #[error("acquisition timed out after {0:?}")]
    Timeout(Duration),
    #[error("short read: expected {expected} samples, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("instrument unavailable: {0}")]
    Unavailable(String),
}

/// Sinusoidal excitation output (function generator).
pub trait SignalSource {
    fn program(&mut self, amplitude_vpp: f64, frequency_hz: f64, channel: u8)
        -> Result<(), InstrumentError>;
    fn off(&mut self, channel: u8) -> Result<(), InstrumentError>;
}

/// DC bias current through the Helmholtz pair.
pub trait BiasSource {
    /// Token for an enabled output; handed back to [`BiasSource::off`].
    type Handle;
    fn program(&mut self, current_a: f64) -> Result<Self::Handle, InstrumentError>;
    fn off(&mut self, handle: Self::Handle) -> Result<(), InstrumentError>;
}

/// Parameters of one finite, hardware-clocked capture.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureRequest {
    pub channel: String,
    pub sample_rate_hz: f64,
    pub num_samples: usize,
    /// Digital line gating the start on a rising edge.
    pub trigger: Option<String>,
    pub timeout: Duration,
}

/// Data-acquisition card.
pub trait Acquirer {
    fn capture(&mut self, request: &CaptureRequest) -> Result<Vec<f64>, InstrumentError>;
}

/// Source of settle delays; swapped for a recording clock in tests.
pub trait Clock {
    fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

/// The bench: excitation source, bias supply, DAQ card and clock.
pub struct Rig<S, B, A, C = SystemClock> {
    pub source: S,
    pub bias: B,
    pub daq: A,
    pub clock: C,
}

impl<S, B, A> Rig<S, B, A, SystemClock> {
    pub fn new(source: S, bias: B, daq: A) -> Self {
        Self {
            source,
            bias,
            daq,
            clock: SystemClock,
        }
    }
}

impl<S, B, A, C> Rig<S, B, A, C> {
    pub fn with_clock<C2: Clock>(self, clock: C2) -> Rig<S, B, A, C2> {
        Rig {
            source: self.source,
            bias: self.bias,
            daq: self.daq,
            clock,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::time::Duration;

    use super::Clock;

    /// Clock that records requested sleeps instead of blocking.
    #[derive(Default)]
    pub struct RecordingClock {
        pub sleeps: RefCell<Vec<Duration>>,
    }

    impl Clock for RecordingClock {
        fn sleep(&self, duration: Duration) {
            self.sleeps.borrow_mut().push(duration);
        }
    }

    impl RecordingClock {
        pub fn total(&self) -> Duration {
            self.sleeps.borrow().iter().sum()
        }
    }
}

//! Software stand-in for the bench.
//!
//! The drive coil current follows the programmed amplitude, the current-sense
//! transducer reports it through its transfer function, and the pickup coil sees
//! direct feed-through of dH/dt plus, with a sample loaded, the dM/dt of a
//! Langevin particle ensemble. Triggered captures start at the rising zero
//! crossing of the drive; untriggered ones start at a random phase.
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::dsp::CurrentSensor;
use crate::instruments::{
    Acquirer, BiasSource, CaptureRequest, InstrumentError, Rig, SignalSource,
};

/// Physical parameters of the simulated coil set and sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchModel {
    /// Peak coil current per volt of peak generator output.
    pub coil_amps_per_volt: f64,
    /// Drive field per amp of coil current (mT/A).
    pub field_per_amp_mt: f64,
    /// Bias field per amp through the Helmholtz pair (mT/A).
    pub bias_field_per_amp_mt: f64,
    /// Pickup voltage per mT/s of empty-coil dH/dt.
    pub feedthrough_v_per_mt_s: f64,
    /// Pickup voltage per unit d(M/Ms)/dt of the sample.
    pub sample_v_per_unit_s: f64,
    /// Langevin field scale of the particles (mT).
    pub sample_field_scale_mt: f64,
    /// Half-width of uniform noise added to every capture (V).
    pub noise_v: f64,
    pub current_sensor: CurrentSensor,
    pub seed: u64,
}

impl Default for BenchModel {
    fn default() -> Self {
        Self {
            coil_amps_per_volt: 1.0,
            field_per_amp_mt: 5.0093,
            bias_field_per_amp_mt: 1.0,
            feedthrough_v_per_mt_s: 1.0e-5,
            sample_v_per_unit_s: 2.0e-5,
            sample_field_scale_mt: 2.0,
            noise_v: 1.0e-4,
            current_sensor: CurrentSensor::default(),
            seed: 0x4d50_5331,
        }
    }
}

/// Hardware-level action observed by the bench, in issue order.
#[derive(Clone, Debug, PartialEq)]
pub enum BenchEvent {
    SourceProgrammed {
        amplitude_vpp: f64,
        frequency_hz: f64,
        channel: u8,
    },
    SourceOff {
        channel: u8,
    },
    BiasOn {
        current_a: f64,
    },
    BiasOff,
    Captured {
        channel: String,
        num_samples: usize,
        triggered: bool,
    },
}

/// Oldest events are dropped once the log holds this many.
pub const EVENT_LOG_CAPACITY: usize = 1024;

/// Operation to fail on its next invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum Fault {
    SourceProgram,
    SourceOff,
    BiasProgram,
    Capture { channel: String },
}

#[derive(Clone, Copy, Debug)]
struct Drive {
    amplitude_vpp: f64,
    frequency_hz: f64,
}

struct BenchState {
    model: BenchModel,
    drive: Option<Drive>,
    bias_a: f64,
    sample_loaded: bool,
    faults: Vec<Fault>,
    events: VecDeque<BenchEvent>,
    rng: StdRng,
}

impl BenchState {
    fn take_fault(&mut self, fault: &Fault) -> bool {
        match self.faults.iter().position(|f| f == fault) {
            Some(idx) => {
                self.faults.remove(idx);
                true
            }
            None => false,
        }
    }

    fn record(&mut self, event: BenchEvent) {
        if self.events.len() == EVENT_LOG_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Shared simulated bench; clones drive the same state.
#[derive(Clone)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
    signal_channel: String,
    current_channel: String,
}

impl SimulatedBench {
    pub fn new(
        model: BenchModel,
        signal_channel: impl Into<String>,
        current_channel: impl Into<String>,
    ) -> Self {
        let state = BenchState {
            model,
            drive: None,
            bias_a: 0.0,
            sample_loaded: false,
            faults: Vec::new(),
            events: VecDeque::with_capacity(EVENT_LOG_CAPACITY),
            rng: StdRng::seed_from_u64(model.seed),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            signal_channel: signal_channel.into(),
            current_channel: current_channel.into(),
        }
    }

    /// Source, supply and DAQ all backed by this bench.
    pub fn rig(&self) -> Rig<SimulatedBench, SimulatedBench, SimulatedBench> {
        Rig::new(self.clone(), self.clone(), self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_sample(&self) {
        self.lock().sample_loaded = true;
    }

    pub fn fail_next(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// The most recent events, oldest first.
    pub fn events(&self) -> Vec<BenchEvent> {
        self.lock().events.iter().cloned().collect()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    pub fn source_enabled(&self) -> bool {
        self.lock().drive.is_some()
    }

    pub fn bias_current(&self) -> f64 {
        self.lock().bias_a
    }

    fn synthesize(&self, state: &mut BenchState, request: &CaptureRequest) -> Vec<f64> {
        let model = state.model;
        let dt = 1.0 / request.sample_rate_hz;
        let drive = state.drive;
        let start = match (drive, request.trigger.is_some()) {
            (Some(d), false) => state.rng.gen::<f64>() / d.frequency_hz,
            _ => 0.0,
        };
        let is_signal = request.channel == self.signal_channel;
        let bias_field = model.bias_field_per_amp_mt * state.bias_a;
        let mut out = Vec::with_capacity(request.num_samples);
        for i in 0..request.num_samples {
            let t = start + i as f64 * dt;
            let (current, field, field_rate) = match drive {
                Some(d) => {
                    let omega = 2.0 * PI * d.frequency_hz;
                    let peak = 0.5 * d.amplitude_vpp * model.coil_amps_per_volt;
                    let current = peak * (omega * t).sin();
                    let field = model.field_per_amp_mt * current + bias_field;
                    let rate = model.field_per_amp_mt * peak * omega * (omega * t).cos();
                    (current, field, rate)
                }
                None => (0.0, bias_field, 0.0),
            };
            let clean = if is_signal {
                let mut v = model.feedthrough_v_per_mt_s * field_rate;
                if state.sample_loaded {
                    let x = field / model.sample_field_scale_mt;
                    v += model.sample_v_per_unit_s * langevin_slope(x) * field_rate
                        / model.sample_field_scale_mt;
                }
                -v
            } else {
                model.current_sensor.voltage_for_current(current)
            };
            let noise = if model.noise_v > 0.0 {
                state.rng.gen_range(-model.noise_v..model.noise_v)
            } else {
                0.0
            };
            out.push(clean + noise);
        }
        out
    }
}

/// Derivative of the Langevin function L(x) = coth(x) - 1/x.
pub fn langevin_slope(x: f64) -> f64 {
    if x.abs() < 1.0e-2 {
        let x2 = x * x;
        1.0 / 3.0 - x2 / 15.0 + 2.0 * x2 * x2 / 189.0
    } else {
        let s = x.sinh();
        1.0 / (x * x) - 1.0 / (s * s)
    }
}

impl SignalSource for SimulatedBench {
    fn program(
        &mut self,
        amplitude_vpp: f64,
        frequency_hz: f64,
        channel: u8,
    ) -> Result<(), InstrumentError> {
        let mut state = self.lock();
        if state.take_fault(&Fault::SourceProgram) {
            return Err(InstrumentError::Unavailable("simulated generator fault".into()));
        }
        state.drive = Some(Drive {
            amplitude_vpp,
            frequency_hz,
        });
        state.record(BenchEvent::SourceProgrammed {
            amplitude_vpp,
            frequency_hz,
            channel,
        });
        Ok(())
    }

    fn off(&mut self, channel: u8) -> Result<(), InstrumentError> {
        let mut state = self.lock();
        if state.take_fault(&Fault::SourceOff) {
            return Err(InstrumentError::Unavailable("simulated generator fault".into()));
        }
        state.drive = None;
        state.record(BenchEvent::SourceOff { channel });
        Ok(())
    }
}

impl BiasSource for SimulatedBench {
    type Handle = ();

    fn program(&mut self, current_a: f64) -> Result<(), InstrumentError> {
        let mut state = self.lock();
        if state.take_fault(&Fault::BiasProgram) {
            return Err(InstrumentError::Unavailable("simulated supply fault".into()));
        }
        state.bias_a = current_a;
        state.record(BenchEvent::BiasOn { current_a });
        Ok(())
    }

    fn off(&mut self, _handle: ()) -> Result<(), InstrumentError> {
        let mut state = self.lock();
        state.bias_a = 0.0;
        state.record(BenchEvent::BiasOff);
        Ok(())
    }
}

impl Acquirer for SimulatedBench {
    fn capture(&mut self, request: &CaptureRequest) -> Result<Vec<f64>, InstrumentError> {
        if request.channel != self.signal_channel && request.channel != self.current_channel {
            return Err(InstrumentError::Unavailable(format!(
                "no simulated channel {}",
                request.channel
            )));
        }
        let mut state = self.lock();
        let fault = Fault::Capture {
            channel: request.channel.clone(),
        };
        if state.take_fault(&fault) {
            return Err(InstrumentError::Timeout(request.timeout));
        }
        debug!(
            "simulated capture {} x{} (sample loaded: {})",
            request.channel, request.num_samples, state.sample_loaded
        );
        let samples = self.synthesize(&mut state, request);
        state.record(BenchEvent::Captured {
            channel: request.channel.clone(),
            num_samples: request.num_samples,
            triggered: request.trigger.is_some(),
        });
        Ok(samples)
    }
}

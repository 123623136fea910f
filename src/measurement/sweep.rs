use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{MpsError, Result};
use crate::instruments::{Acquirer, BiasSource, Clock, Rig, SignalSource};
use crate::measurement::{Excitation, SampleMeasurement};

/// Generator amplitude after a step, reset to 0 V once it passes `ceiling_v`.
pub(crate) fn wrap_amplitude(amplitude_v: f64, ceiling_v: f64) -> f64 {
    if amplitude_v > ceiling_v {
        warn!("amplitude {amplitude_v:.3} V is above the {ceiling_v} V ceiling, wrapping to 0");
        0.0
    } else {
        amplitude_v
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepKind {
    /// Step the drive amplitude with the bias current held.
    FieldAtFixedBias,
    /// Step the bias current with the drive amplitude held.
    BiasAtFixedField,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SweepPlan {
    pub kind: SweepKind,
    pub num_steps: usize,
    /// Volts per step for a field sweep, amps per step for a bias sweep.
    pub step_size: f64,
    /// Bias current (A) for a field sweep, drive amplitude (V) for a bias sweep.
    pub fixed: f64,
    pub amplitude_ceiling_v: f64,
    /// Wait between consecutive steps.
    pub settle: Duration,
    pub max_harmonic: u32,
    pub frequency_hz: f64,
    pub channel: u8,
    pub field_per_amp: f64,
}

impl SweepPlan {
    fn excitation(&self, setpoint: f64) -> Excitation {
        let (amplitude_vpp, bias_a) = match self.kind {
            SweepKind::FieldAtFixedBias => (setpoint, (self.fixed != 0.0).then_some(self.fixed)),
            SweepKind::BiasAtFixedField => (self.fixed, Some(setpoint)),
        };
        Excitation {
            amplitude_vpp,
            frequency_hz: self.frequency_hz,
            channel: self.channel,
            bias_a,
        }
    }

    fn setpoint(&self, step: usize, previous: f64) -> f64 {
        match self.kind {
            SweepKind::FieldAtFixedBias if step == 0 => 0.0,
            SweepKind::FieldAtFixedBias => {
                wrap_amplitude(previous + self.step_size, self.amplitude_ceiling_v)
            }
            SweepKind::BiasAtFixedField => step as f64 * self.step_size,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepState {
    Idle,
    Running,
    Complete,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub step: usize,
    /// Swept value: generator volts or bias amps.
    pub setpoint: f64,
    pub field_mt: f64,
    pub i_rms: f64,
    pub magnitudes: BTreeMap<u32, f64>,
    pub phases: BTreeMap<u32, f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepSeries {
    pub kind: SweepKind,
    pub points: Vec<SweepPoint>,
}

impl SweepSeries {
    pub fn new(kind: SweepKind) -> Self {
        Self {
            kind,
            points: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Swept values in step order.
    pub fn axis(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.setpoint).collect()
    }

    /// Magnitude of one harmonic across the sweep, 0 where it was out of range.
    pub fn harmonic(&self, order: u32) -> Vec<f64> {
        self.points
            .iter()
            .map(|p| p.magnitudes.get(&order).copied().unwrap_or(0.0))
            .collect()
    }
}

/// Cooperative stop flag, checked between sweep steps.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct SweepController {
    state: SweepState,
    series: Option<SweepSeries>,
}

impl Default for SweepController {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepController {
    pub fn new() -> Self {
        Self {
            state: SweepState::Idle,
            series: None,
        }
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    /// Points of the running or most recent sweep, partial if it aborted.
    pub fn series(&self) -> Option<&SweepSeries> {
        self.series.as_ref()
    }

    pub fn start(&mut self, kind: SweepKind) -> Result<()> {
        if self.state == SweepState::Running {
            return Err(MpsError::SweepBusy);
        }
        self.state = SweepState::Running;
        self.series = Some(SweepSeries::new(kind));
        Ok(())
    }

    /// Runs every step of `plan`, calling `on_step` after each one.
    pub fn run<S, B, A, C>(
        &mut self,
        rig: &mut Rig<S, B, A, C>,
        plan: &SweepPlan,
        measurement: &SampleMeasurement<'_>,
        cancel: &CancelToken,
        mut on_step: impl FnMut(&SweepPoint),
    ) -> Result<SweepSeries>
    where
        S: SignalSource,
        B: BiasSource,
        A: Acquirer,
        C: Clock,
    {
        self.start(plan.kind)?;
        info!(
            "{:?} sweep: {} steps of {}",
            plan.kind, plan.num_steps, plan.step_size
        );
        let mut setpoint = 0.0;
        for step in 0..plan.num_steps {
            if step > 0 {
                if cancel.is_cancelled() {
                    info!("sweep cancelled after {step} steps");
                    self.state = SweepState::Aborted;
                    return Err(MpsError::Cancelled);
                }
                rig.clock.sleep(plan.settle);
            }
            setpoint = plan.setpoint(step, setpoint);
            let point = match self.step(rig, plan, measurement, step, setpoint) {
                Ok(point) => point,
                Err(e) => {
                    warn!("sweep aborted at step {step}: {e}");
                    self.state = SweepState::Aborted;
                    return Err(e);
                }
            };
            on_step(&point);
            if let Some(series) = self.series.as_mut() {
                series.points.push(point);
            }
        }
        self.state = SweepState::Complete;
        let series = self
            .series
            .clone()
            .unwrap_or_else(|| SweepSeries::new(plan.kind));
        info!("{:?} sweep complete: {} points", plan.kind, series.len());
        Ok(series)
    }

    fn step<S, B, A, C>(
        &self,
        rig: &mut Rig<S, B, A, C>,
        plan: &SweepPlan,
        measurement: &SampleMeasurement<'_>,
        step: usize,
        setpoint: f64,
    ) -> Result<SweepPoint>
    where
        S: SignalSource,
        B: BiasSource,
        A: Acquirer,
        C: Clock,
    {
        let excitation = plan.excitation(setpoint);
        // Sweeps always keep even orders; the bias sweep exists to watch them grow.
        let result = measurement.run(rig, &excitation, false)?;
        let mut magnitudes = BTreeMap::new();
        let mut phases = BTreeMap::new();
        for order in 1..=plan.max_harmonic {
            if let Some((magnitude, phase)) = result.harmonic(order) {
                magnitudes.insert(order, magnitude);
                phases.insert(order, phase);
            }
        }
        let field_mt = result.field_amplitude(plan.field_per_amp);
        info!("sweep step {step}: setpoint {setpoint:.4}, field {field_mt:.4} mT");
        Ok(SweepPoint {
            step,
            setpoint,
            field_mt,
            i_rms: result.i_rms,
            magnitudes,
            phases,
        })
    }
}

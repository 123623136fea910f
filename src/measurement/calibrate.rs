use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::BenchConfig;
use crate::dsp::{field_from_rms_current, CurrentSensor};
use crate::error::{HardwareStage, MpsError, Result};
use crate::instruments::{Acquirer, BiasSource, Clock, Rig, SignalSource};
use crate::measurement::sweep::wrap_amplitude;
use crate::measurement::{capture, AcquisitionPlan};

/// Least-squares fit of `y = slope * x + intercept`.
pub fn fit_line(xs: &[f64], ys: &[f64]) -> Result<(f64, f64)> {
    if xs.len() != ys.len() {
        return Err(MpsError::DegenerateFit(format!(
            "{} amplitudes for {} fields",
            xs.len(),
            ys.len()
        )));
    }
    if xs.len() < 2 {
        return Err(MpsError::DegenerateFit(format!(
            "{} point(s), need at least 2",
            xs.len()
        )));
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let (mut sxx, mut sxy) = (0.0, 0.0);
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        sxx += dx * dx;
        sxy += dx * (y - mean_y);
    }
    if sxx == 0.0 {
        return Err(MpsError::DegenerateFit("all amplitudes are equal".into()));
    }
    let slope = sxy / sxx;
    Ok((slope, mean_y - slope * mean_x))
}

/// Amplitude ramp used to relate generator volts to coil field.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationPlan {
    pub steps: usize,
    pub step_v: f64,
    pub ceiling_v: f64,
    /// Wait after each reprogramming before the current is sampled.
    pub step_delay: Duration,
    pub frequency_hz: f64,
    pub channel: u8,
    /// Coil constant, mT per amp.
    pub field_per_amp: f64,
}

impl CalibrationPlan {
    pub fn from_config(config: &BenchConfig) -> Self {
        Self {
            steps: config.calibration.steps,
            step_v: config.calibration.step_v,
            ceiling_v: config.calibration.ceiling_v,
            step_delay: config.timing.calibration_step(),
            frequency_hz: config.excitation.frequency_hz,
            channel: config.excitation.channel,
            field_per_amp: config.coil.field_per_amp_mt,
        }
    }
}

/// Measured (amplitude, field) pairs and their linear fit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCurve {
    pub amplitudes_v: Vec<f64>,
    pub fields_mt: Vec<f64>,
    /// mT per volt.
    pub slope: f64,
    pub intercept: f64,
}

impl CalibrationCurve {
    pub fn from_points(amplitudes_v: Vec<f64>, fields_mt: Vec<f64>) -> Result<Self> {
        let (slope, intercept) = fit_line(&amplitudes_v, &fields_mt)?;
        if !(slope > 0.0) {
            return Err(MpsError::DegenerateFit(format!(
                "field does not grow with amplitude (slope {slope})"
            )));
        }
        Ok(Self {
            amplitudes_v,
            fields_mt,
            slope,
            intercept,
        })
    }

    /// Generator amplitude for a target field; the intercept is ignored.
    pub fn volts_for_field(&self, field_mt: f64) -> f64 {
        field_mt / self.slope
    }
}

pub struct Calibrator<'a> {
    pub plan: &'a CalibrationPlan,
    pub acquisition: &'a AcquisitionPlan,
    pub sensor: &'a CurrentSensor,
}

impl<'a> Calibrator<'a> {
    pub fn new(
        plan: &'a CalibrationPlan,
        acquisition: &'a AcquisitionPlan,
        sensor: &'a CurrentSensor,
    ) -> Self {
        Self {
            plan,
            acquisition,
            sensor,
        }
    }

    /// Ramps the generator from 0 V, reading the coil current at each step.
    pub fn run<S, B, A, C>(&self, rig: &mut Rig<S, B, A, C>) -> Result<CalibrationCurve>
    where
        S: SignalSource,
        B: BiasSource,
        A: Acquirer,
        C: Clock,
    {
        let plan = self.plan;
        let n = self.acquisition.num_samples(plan.frequency_hz)?;
        let ramp = self.ramp(rig, n);

        let off = rig
            .source
            .off(plan.channel)
            .map_err(MpsError::hardware(HardwareStage::SignalSource));
        let (amplitudes, fields) = match ramp {
            Ok(points) => {
                off?;
                points
            }
            Err(e) => {
                if let Err(off_err) = off {
                    warn!("generator did not switch off after calibration fault: {off_err}");
                }
                return Err(e);
            }
        };

        let curve = CalibrationCurve::from_points(amplitudes, fields)?;
        info!(
            "calibration: {:.4} mT/V (intercept {:.4} mT) over {} steps",
            curve.slope,
            curve.intercept,
            curve.amplitudes_v.len()
        );
        Ok(curve)
    }

    fn ramp<S, B, A, C>(
        &self,
        rig: &mut Rig<S, B, A, C>,
        num_samples: usize,
    ) -> Result<(Vec<f64>, Vec<f64>)>
    where
        S: SignalSource,
        B: BiasSource,
        A: Acquirer,
        C: Clock,
    {
        let plan = self.plan;
        let mut amplitudes = Vec::with_capacity(plan.steps);
        let mut fields = Vec::with_capacity(plan.steps);
        let mut amplitude = 0.0;
        for step in 0..plan.steps {
            if step > 0 {
                amplitude = wrap_amplitude(amplitude + plan.step_v, plan.ceiling_v);
            }
            rig.source
                .program(amplitude, plan.frequency_hz, plan.channel)
                .map_err(MpsError::hardware(HardwareStage::SignalSource))?;
            rig.clock.sleep(plan.step_delay);
            let current = capture(
                &mut rig.daq,
                self.acquisition,
                &self.acquisition.current_channel,
                num_samples,
                HardwareStage::CurrentAcquisition,
            )?;
            let i_rms = self.sensor.estimate_rms_current(&current);
            let field = field_from_rms_current(plan.field_per_amp, i_rms);
            debug!("calibration step {step}: {amplitude:.3} V -> {field:.4} mT");
            amplitudes.push(amplitude);
            fields.push(field);
        }
        Ok((amplitudes, fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::sim::{BenchEvent, BenchModel, Fault, SimulatedBench};
    use crate::instruments::testing::RecordingClock;
    use crate::measurement::testing::*;

    const K: f64 = 5.0093;

    fn plan(steps: usize) -> CalibrationPlan {
        CalibrationPlan {
            steps,
            step_v: 0.05,
            ceiling_v: 3.0,
            step_delay: Duration::from_millis(50),
            frequency_hz: 1000.0,
            channel: 1,
            field_per_amp: K,
        }
    }

    #[test]
    fn fit_recovers_exact_line() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 10.0 * x).collect();
        let (slope, intercept) = fit_line(&xs, &ys).unwrap();
        assert!((slope - 10.0).abs() < 1e-12);
        assert!(intercept.abs() < 1e-12);
    }

    #[test]
    fn fit_rejects_degenerate_input() {
        assert!(matches!(
            fit_line(&[1.0], &[2.0]),
            Err(MpsError::DegenerateFit(_))
        ));
        assert!(fit_line(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_err());
        assert!(fit_line(&[1.0, 2.0], &[1.0]).is_err());
    }

    #[test]
    fn calibrator_recovers_ten_millitesla_per_volt() {
        // field = K * 0.5 * Vpp * gain, so gain = 20 / K gives 10 mT/V.
        let model = BenchModel {
            noise_v: 0.0,
            coil_amps_per_volt: 20.0 / K,
            ..BenchModel::default()
        };
        let bench = SimulatedBench::new(model, "sig", "cur");
        let mut rig = bench.rig().with_clock(RecordingClock::default());
        let plan = plan(10);
        let sensor = CurrentSensor::default();
        let curve = Calibrator::new(&plan, &small_plan(), &sensor)
            .run(&mut rig)
            .unwrap();
        assert_eq!(curve.amplitudes_v.len(), 10);
        assert_eq!(curve.amplitudes_v[0], 0.0);
        assert!((curve.slope - 10.0).abs() < 1e-6);
        assert!(curve.intercept.abs() < 1e-6);
        assert!((curve.volts_for_field(5.0) - 0.5).abs() < 1e-6);
        assert!(!bench.source_enabled());
        assert_eq!(rig.clock.total(), Duration::from_millis(500));
    }

    #[test]
    fn ramp_wraps_above_ceiling() {
        let (_bench, mut rig) = quiet_bench();
        let mut plan = plan(6);
        plan.step_v = 1.0;
        plan.ceiling_v = 2.5;
        let sensor = CurrentSensor::default();
        let curve = Calibrator::new(&plan, &small_plan(), &sensor)
            .run(&mut rig)
            .unwrap();
        assert_eq!(curve.amplitudes_v, vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn capture_fault_switches_source_off() {
        let (bench, mut rig) = quiet_bench();
        bench.fail_next(Fault::Capture {
            channel: "cur".into(),
        });
        let sensor = CurrentSensor::default();
        let err = Calibrator::new(&plan(5), &small_plan(), &sensor)
            .run(&mut rig)
            .unwrap_err();
        assert!(matches!(
            err,
            MpsError::Hardware {
                stage: HardwareStage::CurrentAcquisition,
                ..
            }
        ));
        assert!(!bench.source_enabled());
        assert!(matches!(
            bench.events().last(),
            Some(BenchEvent::SourceOff { channel: 1 })
        ));
    }

    #[test]
    fn flat_response_is_degenerate() {
        let model = BenchModel {
            noise_v: 0.0,
            coil_amps_per_volt: 0.0,
            ..BenchModel::default()
        };
        let bench = SimulatedBench::new(model, "sig", "cur");
        let mut rig = bench.rig().with_clock(RecordingClock::default());
        let sensor = CurrentSensor::default();
        let err = Calibrator::new(&plan(5), &small_plan(), &sensor)
            .run(&mut rig)
            .unwrap_err();
        assert!(matches!(err, MpsError::DegenerateFit(_)));
    }
}

use log::info;
use serde::{Deserialize, Serialize};

use crate::config::{Amplitude, BenchConfig};
use crate::error::{MpsError, Result};
use crate::instruments::{Acquirer, BiasSource, Clock, Rig, SignalSource};
use crate::measurement::sweep::wrap_amplitude;
use crate::measurement::{
    capture_background, AcquisitionPlan, BackgroundRecord, CalibrationCurve, CalibrationPlan,
    Calibrator, CancelToken, Excitation, MagnetizationCurve, SampleMeasurement, SampleResult,
    SweepController, SweepKind, SweepPlan, SweepPoint, SweepSeries, SweepState,
};

/// What a session has on hand for dependent operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Neither a background nor a volts-to-field slope.
    Uncalibrated,
    /// Slope only.
    Calibrated,
    /// Background only.
    BackgroundCaptured,
    /// Both; field-specified sample measurements and sweeps can run.
    Ready,
}

/// Single owner of the background record, calibration and sweep state.
///
/// Every operation either replaces its piece of state on success or leaves it
/// exactly as it was.
pub struct Session {
    config: BenchConfig,
    background: Option<BackgroundRecord>,
    calibration: Option<CalibrationCurve>,
    sweep: SweepController,
}

impl Session {
    pub fn new(config: BenchConfig) -> Self {
        Self {
            config,
            background: None,
            calibration: None,
            sweep: SweepController::new(),
        }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        match (self.background.is_some(), self.calibration.is_some()) {
            (false, false) => SessionState::Uncalibrated,
            (false, true) => SessionState::Calibrated,
            (true, false) => SessionState::BackgroundCaptured,
            (true, true) => SessionState::Ready,
        }
    }

    pub fn background(&self) -> Option<&BackgroundRecord> {
        self.background.as_ref()
    }

    pub fn calibration(&self) -> Option<&CalibrationCurve> {
        self.calibration.as_ref()
    }

    pub fn sweep_state(&self) -> SweepState {
        self.sweep.state()
    }

    /// Points of the most recent sweep, partial if it was aborted.
    pub fn last_sweep(&self) -> Option<&SweepSeries> {
        self.sweep.series()
    }

    /// mT per volt from the last calibration.
    pub fn slope(&self) -> Result<f64> {
        self.calibration
            .as_ref()
            .map(|c| c.slope)
            .ok_or(MpsError::NoCalibration)
    }

    /// Generator amplitude for `field_mt`, wrapped to 0 V above the ceiling.
    pub fn volts_for_field(&self, field_mt: f64) -> Result<f64> {
        let volts = field_mt / self.slope()?;
        Ok(wrap_amplitude(
            volts,
            self.config.excitation.amplitude_ceiling_v,
        ))
    }

    pub fn set_field_amplitude(&mut self, amplitude: Amplitude) {
        self.config.excitation.amplitude = amplitude;
    }

    pub fn set_bias(&mut self, current_a: f64) {
        self.config.excitation.bias_current_a = current_a;
    }

    pub fn set_only_odd_harmonics(&mut self, only_odd: bool) {
        self.config.excitation.only_odd_harmonics = only_odd;
    }

    fn amplitude_volts(&self) -> Result<f64> {
        match self.config.excitation.amplitude {
            Amplitude::Volts(v) => Ok(v),
            Amplitude::Millitesla(field) => self.volts_for_field(field),
        }
    }

    /// Current excitation settings resolved to generator volts.
    pub fn excitation(&self) -> Result<Excitation> {
        let exc = &self.config.excitation;
        Ok(Excitation {
            amplitude_vpp: self.amplitude_volts()?,
            frequency_hz: exc.frequency_hz,
            channel: exc.channel,
            bias_a: exc.bias(),
        })
    }

    pub fn acquisition_plan(&self) -> AcquisitionPlan {
        AcquisitionPlan::from_config(&self.config)
    }

    pub fn calibrate<S, B, A, C>(&mut self, rig: &mut Rig<S, B, A, C>) -> Result<&CalibrationCurve>
    where
        S: SignalSource,
        B: BiasSource,
        A: Acquirer,
        C: Clock,
    {
        let plan = CalibrationPlan::from_config(&self.config);
        let acquisition = self.acquisition_plan();
        let curve =
            Calibrator::new(&plan, &acquisition, &self.config.current_sensor).run(rig)?;
        Ok(&*self.calibration.insert(curve))
    }

    pub fn capture_background<S, B, A, C>(
        &mut self,
        rig: &mut Rig<S, B, A, C>,
    ) -> Result<&BackgroundRecord>
    where
        S: SignalSource,
        B: BiasSource,
        A: Acquirer,
        C: Clock,
    {
        let excitation = self.excitation()?;
        let record = capture_background(rig, &excitation, &self.acquisition_plan())?;
        Ok(&*self.background.insert(record))
    }

    pub fn measure_sample<S, B, A, C>(&self, rig: &mut Rig<S, B, A, C>) -> Result<SampleResult>
    where
        S: SignalSource,
        B: BiasSource,
        A: Acquirer,
        C: Clock,
    {
        let background = self.background.as_ref().ok_or(MpsError::NoBackground)?;
        let excitation = self.excitation()?;
        let plan = self.acquisition_plan();
        SampleMeasurement::new(&plan, &self.config.current_sensor, background).run(
            rig,
            &excitation,
            self.config.excitation.only_odd_harmonics,
        )
    }

    pub fn magnetization_curve(
        &self,
        result: &SampleResult,
        with_phase: bool,
    ) -> Result<MagnetizationCurve> {
        result.magnetization_curve(
            self.config.coil.field_per_amp_mt,
            self.config.reconstruction,
            with_phase,
        )
    }

    /// Steps for `kind`, spreading the configured maximum over `num_steps`.
    pub fn sweep_plan(&self, kind: SweepKind) -> Result<SweepPlan> {
        let sweep = &self.config.sweep;
        let steps = sweep.num_steps as f64;
        let (step_size, fixed) = match kind {
            SweepKind::FieldAtFixedBias => {
                let max_v = sweep.max_field_mt / self.slope()?;
                (max_v / steps, self.config.excitation.bias_current_a)
            }
            SweepKind::BiasAtFixedField => (sweep.max_bias_a / steps, self.amplitude_volts()?),
        };
        Ok(SweepPlan {
            kind,
            num_steps: sweep.num_steps,
            step_size,
            fixed,
            amplitude_ceiling_v: self.config.excitation.amplitude_ceiling_v,
            settle: self.config.timing.step_settle(),
            max_harmonic: sweep.max_harmonic,
            frequency_hz: self.config.excitation.frequency_hz,
            channel: self.config.excitation.channel,
            field_per_amp: self.config.coil.field_per_amp_mt,
        })
    }

    pub fn run_sweep<S, B, A, C>(
        &mut self,
        rig: &mut Rig<S, B, A, C>,
        kind: SweepKind,
        cancel: &CancelToken,
        on_step: impl FnMut(&SweepPoint),
    ) -> Result<SweepSeries>
    where
        S: SignalSource,
        B: BiasSource,
        A: Acquirer,
        C: Clock,
    {
        let plan = self.sweep_plan(kind)?;
        let acquisition = self.acquisition_plan();
        let background = self.background.as_ref().ok_or(MpsError::NoBackground)?;
        let measurement =
            SampleMeasurement::new(&acquisition, &self.config.current_sensor, background);
        let series = self.sweep.run(rig, &plan, &measurement, cancel, on_step)?;
        info!("{kind:?} sweep stored {} points", series.len());
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::sim::{BenchModel, Fault, SimulatedBench};
    use crate::instruments::testing::RecordingClock;
    use crate::measurement::testing::SimRig;

    const K: f64 = 5.0093;

    fn config() -> BenchConfig {
        let mut config = BenchConfig::default();
        config.daq.signal_channel = "sig".into();
        config.daq.current_channel = "cur".into();
        config.daq.sample_rate_hz = 20_000.0;
        config.daq.num_periods = 10;
        config.calibration.steps = 10;
        config.sweep.num_steps = 5;
        config.sweep.max_field_mt = 20.0;
        config.excitation.amplitude = Amplitude::Millitesla(10.0);
        config
    }

    /// Bench with a 10 mT/V coil.
    fn bench() -> (SimulatedBench, SimRig) {
        let model = BenchModel {
            noise_v: 0.0,
            coil_amps_per_volt: 20.0 / K,
            ..BenchModel::default()
        };
        let bench = SimulatedBench::new(model, "sig", "cur");
        let rig = bench.rig().with_clock(RecordingClock::default());
        (bench, rig)
    }

    #[test]
    fn state_follows_captured_pieces() {
        let (_bench, mut rig) = bench();
        let mut session = Session::new(config());
        assert_eq!(session.state(), SessionState::Uncalibrated);
        session.calibrate(&mut rig).unwrap();
        assert_eq!(session.state(), SessionState::Calibrated);
        session.capture_background(&mut rig).unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn background_alone_with_volts_amplitude() {
        let (_bench, mut rig) = bench();
        let mut session = Session::new(config());
        session.set_field_amplitude(Amplitude::Volts(1.0));
        session.capture_background(&mut rig).unwrap();
        assert_eq!(session.state(), SessionState::BackgroundCaptured);
        assert!(session.measure_sample(&mut rig).is_ok());
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        let (bench, mut rig) = bench();
        let mut session = Session::new(config());
        assert!(matches!(
            session.measure_sample(&mut rig),
            Err(MpsError::NoBackground)
        ));
        assert!(matches!(
            session.capture_background(&mut rig),
            Err(MpsError::NoCalibration)
        ));
        assert!(matches!(
            session.sweep_plan(SweepKind::FieldAtFixedBias),
            Err(MpsError::NoCalibration)
        ));
        assert!(bench.events().is_empty());
    }

    #[test]
    fn field_target_uses_calibrated_slope() {
        let (_bench, mut rig) = bench();
        let mut session = Session::new(config());
        session.calibrate(&mut rig).unwrap();
        let exc = session.excitation().unwrap();
        assert!((exc.amplitude_vpp - 1.0).abs() < 1e-6);
        // 100 mT needs 10 V, above the 4.5 V ceiling.
        assert_eq!(session.volts_for_field(100.0).unwrap(), 0.0);
    }

    #[test]
    fn failed_recapture_keeps_previous_background() {
        let (bench, mut rig) = bench();
        let mut session = Session::new(config());
        session.calibrate(&mut rig).unwrap();
        let first = session.capture_background(&mut rig).unwrap().captured_at;
        bench.fail_next(Fault::Capture {
            channel: "sig".into(),
        });
        assert!(session.capture_background(&mut rig).is_err());
        assert_eq!(session.background().map(|b| b.captured_at), Some(first));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn sweep_plans_spread_the_maximum() {
        let (_bench, mut rig) = bench();
        let mut session = Session::new(config());
        session.calibrate(&mut rig).unwrap();
        session.set_bias(0.5);
        let field = session.sweep_plan(SweepKind::FieldAtFixedBias).unwrap();
        // 20 mT at 10 mT/V over 5 steps.
        assert!((field.step_size - 0.4).abs() < 1e-6);
        assert_eq!(field.fixed, 0.5);
        let bias = session.sweep_plan(SweepKind::BiasAtFixedField).unwrap();
        assert!((bias.step_size - 2.0).abs() < 1e-12);
        assert!((bias.fixed - 1.0).abs() < 1e-6);
    }

    #[test]
    fn full_protocol_runs_end_to_end() {
        let (bench, mut rig) = bench();
        let mut session = Session::new(config());
        session.calibrate(&mut rig).unwrap();
        session.capture_background(&mut rig).unwrap();
        bench.insert_sample();
        let result = session.measure_sample(&mut rig).unwrap();
        assert!((result.field_amplitude(K) - 10.0).abs() < 1e-4);
        let curve = session.magnetization_curve(&result, false).unwrap();
        assert_eq!(curve.field.len(), 10_000);

        let series = session
            .run_sweep(
                &mut rig,
                SweepKind::FieldAtFixedBias,
                &CancelToken::new(),
                |_| {},
            )
            .unwrap();
        assert_eq!(series.len(), 5);
        assert_eq!(session.sweep_state(), SweepState::Complete);
        let series = session
            .run_sweep(
                &mut rig,
                SweepKind::BiasAtFixedField,
                &CancelToken::new(),
                |_| {},
            )
            .unwrap();
        assert_eq!(series.axis(), vec![0.0, 2.0, 4.0, 6.0, 8.0]);
        assert!(!bench.source_enabled());
        assert_eq!(bench.bias_current(), 0.0);
    }

    #[test]
    fn bias_sweep_reports_even_orders_with_odd_filter_on() {
        let (bench, mut rig) = bench();
        let mut session = Session::new(config());
        session.set_only_odd_harmonics(true);
        session.calibrate(&mut rig).unwrap();
        session.capture_background(&mut rig).unwrap();
        bench.insert_sample();
        let filtered = session.measure_sample(&mut rig).unwrap();
        assert_eq!(filtered.harmonic(2).map(|(m, _)| m), Some(0.0));

        let series = session
            .run_sweep(
                &mut rig,
                SweepKind::BiasAtFixedField,
                &CancelToken::new(),
                |_| {},
            )
            .unwrap();
        let second = series.harmonic(2);
        assert_eq!(second.len(), 5);
        assert!(second[4] > second[0]);
        assert!(second[4] > 1e-6);
    }
}

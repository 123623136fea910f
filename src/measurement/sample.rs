use log::info;
use serde::{Deserialize, Serialize};

use crate::dsp::{
    analyze_harmonics, differential_susceptibility, field_from_rms_current, field_period,
    CurrentSensor, Spectrum, SynthesisGrid, Waveform,
};
use crate::error::{HardwareStage, MpsError, Result};
use crate::instruments::{Acquirer, BiasSource, Clock, Rig, SignalSource};
use crate::measurement::{capture, with_outputs, AcquisitionPlan, BackgroundRecord, Excitation};

/// Background-subtracted response of a loaded sample.
#[derive(Clone, Debug)]
pub struct SampleResult {
    /// Signal minus background, optionally reduced to odd harmonics.
    pub spectrum: Spectrum,
    /// Spectrum of the raw capture, background included.
    pub raw_spectrum: Spectrum,
    pub raw: Waveform,
    pub i_rms: f64,
    pub excitation: Excitation,
}

/// M(H) loop over one drive period.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MagnetizationCurve {
    pub reconstructed: Vec<f64>,
    pub magnetization: Vec<f64>,
    pub field: Vec<f64>,
    pub dm_dh: Vec<f64>,
}

impl SampleResult {
    /// Peak drive field implied by the measured coil current.
    pub fn field_amplitude(&self, field_per_amp: f64) -> f64 {
        field_from_rms_current(field_per_amp, self.i_rms)
    }

    /// Magnitude and phase of harmonic `order` of the drive.
    pub fn harmonic(&self, order: u32) -> Option<(f64, f64)> {
        self.spectrum
            .harmonic(order, self.excitation.frequency_hz)
    }

    pub fn magnetization_curve(
        &self,
        field_per_amp: f64,
        grid: SynthesisGrid,
        with_phase: bool,
    ) -> Result<MagnetizationCurve> {
        let drive_hz = self.excitation.frequency_hz;
        let period = self.spectrum.reconstruct_period(drive_hz, with_phase, grid)?;
        let field = field_period(self.field_amplitude(field_per_amp), drive_hz, period.len());
        let dm_dh = differential_susceptibility(&period.integral, &field);
        Ok(MagnetizationCurve {
            reconstructed: period.waveform,
            magnetization: period.integral,
            field,
            dm_dh,
        })
    }
}

/// Bin-wise complex difference `signal - background`.
pub fn subtract_background(signal: &Spectrum, background: &Spectrum) -> Result<Spectrum> {
    if signal.len() != background.len() {
        return Err(MpsError::SampleCountMismatch {
            expected: background.num_samples,
            actual: signal.num_samples,
        });
    }
    let complex = signal
        .complex
        .iter()
        .zip(&background.complex)
        .map(|(s, b)| s - b)
        .collect();
    Ok(Spectrum::from_complex(
        signal.sample_rate_hz,
        signal.num_samples,
        signal.frequencies_hz.clone(),
        complex,
    ))
}

/// Clears every bin that is not an odd multiple of the drive frequency.
pub fn keep_odd_harmonics(spectrum: &mut Spectrum, drive_hz: f64) {
    for idx in 0..spectrum.len() {
        let ratio = spectrum.frequencies_hz[idx] / drive_hz;
        let order = ratio.round();
        let on_grid = (ratio - order).abs() <= 1e-9 * ratio.max(1.0);
        let odd = order % 2.0 == 1.0;
        if !(on_grid && odd) {
            spectrum.clear_bin(idx);
        }
    }
}

/// Loaded-coil measurement against a previously captured background.
pub struct SampleMeasurement<'a> {
    pub plan: &'a AcquisitionPlan,
    pub sensor: &'a CurrentSensor,
    pub background: &'a BackgroundRecord,
}

impl<'a> SampleMeasurement<'a> {
    pub fn new(
        plan: &'a AcquisitionPlan,
        sensor: &'a CurrentSensor,
        background: &'a BackgroundRecord,
    ) -> Self {
        Self {
            plan,
            sensor,
            background,
        }
    }

    pub fn run<S, B, A, C>(
        &self,
        rig: &mut Rig<S, B, A, C>,
        excitation: &Excitation,
        only_odd_harmonics: bool,
    ) -> Result<SampleResult>
    where
        S: SignalSource,
        B: BiasSource,
        A: Acquirer,
        C: Clock,
    {
        let plan = self.plan;
        let n = plan.num_samples(excitation.frequency_hz)?;
        self.background
            .check_compatible(excitation.frequency_hz, plan.sample_rate_hz, n)?;

        // Signal and current are two back-to-back captures on the same trigger.
        let (raw, current) = with_outputs(rig, excitation, plan.settle, |daq| {
            let raw = capture(
                daq,
                plan,
                &plan.signal_channel,
                n,
                HardwareStage::SignalAcquisition,
            )?;
            let current = capture(
                daq,
                plan,
                &plan.current_channel,
                n,
                HardwareStage::CurrentAcquisition,
            )?;
            Ok((raw, current))
        })?;

        let i_rms = self.sensor.estimate_rms_current(&current);
        let raw_spectrum = analyze_harmonics(&raw);
        let mut spectrum = subtract_background(&raw_spectrum, &self.background.spectrum)?;
        if only_odd_harmonics {
            keep_odd_harmonics(&mut spectrum, excitation.frequency_hz);
        }
        info!(
            "sample measured at {} Vpp: i_rms = {:.3} A",
            excitation.amplitude_vpp, i_rms
        );
        Ok(SampleResult {
            spectrum,
            raw_spectrum,
            raw,
            i_rms,
            excitation: excitation.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::Waveform;
    use crate::instruments::sim::{BenchEvent, Fault};
    use crate::measurement::capture_background;
    use crate::measurement::testing::*;

    fn spectrum_of(samples: Vec<f64>) -> Spectrum {
        analyze_harmonics(&Waveform::new(1000.0, samples).unwrap())
    }

    #[test]
    fn identical_background_cancels() {
        let samples: Vec<f64> = (0..64).map(|i| (i as f64 * 0.37).sin() + 0.2).collect();
        let a = spectrum_of(samples.clone());
        let diff = subtract_background(&a, &a).unwrap();
        assert!(diff.magnitudes.iter().all(|&m| m < 1e-15));
        assert!(diff.phases.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn subtraction_rejects_mismatched_lengths() {
        let a = spectrum_of(vec![0.0; 64]);
        let b = spectrum_of(vec![0.0; 32]);
        assert!(matches!(
            subtract_background(&a, &b),
            Err(MpsError::SampleCountMismatch { .. })
        ));
    }

    #[test]
    fn odd_filter_keeps_only_odd_multiples() {
        // fs = 1000, N = 100 -> 10 Hz bins; drive at 50 Hz.
        let samples = (0..100).map(|i| (i as f64 * 0.9).cos() + 1.0).collect();
        let mut spectrum = analyze_harmonics(&Waveform::new(1000.0, samples).unwrap());
        keep_odd_harmonics(&mut spectrum, 50.0);
        for (f, m) in spectrum.frequencies_hz.iter().zip(&spectrum.magnitudes) {
            let keep = [50.0, 150.0, 250.0, 350.0, 450.0].contains(f);
            if !keep {
                assert_eq!(*m, 0.0, "bin at {f} Hz should be cleared");
            }
        }
        assert_eq!(spectrum.magnitudes[0], 0.0);
    }

    #[test]
    fn sample_response_survives_background_subtraction() {
        let (bench, mut rig) = quiet_bench();
        let plan = small_plan();
        let exc = drive(2.0);
        let background = capture_background(&mut rig, &exc, &plan).unwrap();
        bench.insert_sample();
        bench.clear_events();
        let sensor = CurrentSensor::default();
        let result = SampleMeasurement::new(&plan, &sensor, &background)
            .run(&mut rig, &exc, false)
            .unwrap();

        // Programming precedes both captures, which precede shutdown.
        let events = bench.events();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], BenchEvent::SourceProgrammed { .. }));
        assert!(matches!(&events[1], BenchEvent::Captured { channel, .. } if channel == "sig"));
        assert!(matches!(&events[2], BenchEvent::Captured { channel, .. } if channel == "cur"));
        assert!(matches!(events[3], BenchEvent::SourceOff { .. }));

        // 2 Vpp at 1 A/V peak -> 1 A peak.
        assert!((result.i_rms - 1.0 / 2f64.sqrt()).abs() < 1e-9);
        let (third, _) = result.harmonic(3).unwrap();
        let (second, _) = result.harmonic(2).unwrap();
        assert!(third > 1e-5);
        assert!(second < third * 1e-6);
    }

    #[test]
    fn odd_only_flag_clears_even_bins() {
        let (bench, mut rig) = quiet_bench();
        let plan = small_plan();
        let mut exc = drive(2.0);
        exc.bias_a = Some(1.0);
        let background = capture_background(&mut rig, &exc, &plan).unwrap();
        bench.insert_sample();
        let sensor = CurrentSensor::default();
        let measurement = SampleMeasurement::new(&plan, &sensor, &background);
        let full = measurement.run(&mut rig, &exc, false).unwrap();
        let odd = measurement.run(&mut rig, &exc, true).unwrap();
        // Bias breaks the symmetry, so even harmonics appear until filtered.
        assert!(full.harmonic(2).unwrap().0 > 1e-6);
        assert_eq!(odd.harmonic(2).unwrap().0, 0.0);
        assert!((odd.harmonic(3).unwrap().0 - full.harmonic(3).unwrap().0).abs() < 1e-12);
    }

    #[test]
    fn current_capture_failure_returns_no_result() {
        let (bench, mut rig) = quiet_bench();
        let plan = small_plan();
        let background = capture_background(&mut rig, &drive(1.0), &plan).unwrap();
        bench.fail_next(Fault::Capture {
            channel: "cur".into(),
        });
        let sensor = CurrentSensor::default();
        let err = SampleMeasurement::new(&plan, &sensor, &background)
            .run(&mut rig, &drive(1.0), false)
            .unwrap_err();
        assert!(matches!(
            err,
            MpsError::Hardware {
                stage: HardwareStage::CurrentAcquisition,
                ..
            }
        ));
        assert!(!bench.source_enabled());
    }

    #[test]
    fn stale_background_is_rejected_before_touching_hardware() {
        let (bench, mut rig) = quiet_bench();
        let plan = small_plan();
        let background = capture_background(&mut rig, &drive(1.0), &plan).unwrap();
        bench.clear_events();
        let mut exc = drive(1.0);
        exc.frequency_hz = 500.0;
        let sensor = CurrentSensor::default();
        let err = SampleMeasurement::new(&plan, &sensor, &background)
            .run(&mut rig, &exc, false)
            .unwrap_err();
        assert!(matches!(err, MpsError::StaleBackground { .. }));
        assert!(bench.events().is_empty());
    }

    #[test]
    fn magnetization_curve_has_one_period() {
        let (bench, mut rig) = quiet_bench();
        let plan = small_plan();
        let exc = drive(2.0);
        let background = capture_background(&mut rig, &exc, &plan).unwrap();
        bench.insert_sample();
        let sensor = CurrentSensor::default();
        let result = SampleMeasurement::new(&plan, &sensor, &background)
            .run(&mut rig, &exc, false)
            .unwrap();
        let grid = SynthesisGrid {
            periods: 4,
            points: 800,
        };
        let curve = result.magnetization_curve(5.0093, grid, true).unwrap();
        assert_eq!(curve.magnetization.len(), 200);
        assert_eq!(curve.field.len(), 200);
        assert_eq!(curve.dm_dh.len(), 200);
        let peak_field = curve.field.iter().fold(0.0f64, |a, &v| a.max(v.abs()));
        assert!((peak_field - 5.0093).abs() < 1e-9);
    }
}

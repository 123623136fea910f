use std::time::SystemTime;

use log::info;

use crate::dsp::{analyze_harmonics, Spectrum, Waveform};
use crate::error::{HardwareStage, MpsError, Result};
use crate::instruments::{Acquirer, BiasSource, Clock, Rig, SignalSource};
use crate::measurement::{capture, with_outputs, AcquisitionPlan, Excitation};

/// Empty-coil spectrum and the conditions it was taken under.
#[derive(Clone, Debug)]
pub struct BackgroundRecord {
    pub spectrum: Spectrum,
    pub waveform: Waveform,
    pub excitation: Excitation,
    pub captured_at: SystemTime,
}

impl BackgroundRecord {
    pub fn num_samples(&self) -> usize {
        self.spectrum.num_samples
    }

    /// Rejects measurements whose frequency grid would not line up with this background.
    pub fn check_compatible(
        &self,
        drive_hz: f64,
        sample_rate_hz: f64,
        num_samples: usize,
    ) -> Result<()> {
        let same = self.excitation.frequency_hz == drive_hz
            && self.spectrum.sample_rate_hz == sample_rate_hz
            && self.num_samples() == num_samples;
        if same {
            return Ok(());
        }
        Err(MpsError::StaleBackground {
            captured: describe(
                self.excitation.frequency_hz,
                self.spectrum.sample_rate_hz,
                self.num_samples(),
            ),
            requested: describe(drive_hz, sample_rate_hz, num_samples),
        })
    }
}

fn describe(drive_hz: f64, sample_rate_hz: f64, num_samples: usize) -> String {
    format!("{drive_hz} Hz drive, {sample_rate_hz} Hz sampling, {num_samples} samples")
}

/// Drives the empty coil and records its spectrum.
pub fn capture_background<S, B, A, C>(
    rig: &mut Rig<S, B, A, C>,
    excitation: &Excitation,
    plan: &AcquisitionPlan,
) -> Result<BackgroundRecord>
where
    S: SignalSource,
    B: BiasSource,
    A: Acquirer,
    C: Clock,
{
    let n = plan.num_samples(excitation.frequency_hz)?;
    let waveform = with_outputs(rig, excitation, plan.settle, |daq| {
        capture(daq, plan, &plan.signal_channel, n, HardwareStage::SignalAcquisition)
    })?;
    let spectrum = analyze_harmonics(&waveform);
    info!(
        "background captured: {} samples, {} bins at {} Vpp",
        n,
        spectrum.len(),
        excitation.amplitude_vpp
    );
    Ok(BackgroundRecord {
        spectrum,
        captured_at: waveform.captured_at(),
        waveform,
        excitation: excitation.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::sim::{BenchEvent, Fault};
    use crate::measurement::testing::*;

    #[test]
    fn captures_signal_channel_between_program_and_off() {
        let (bench, mut rig) = quiet_bench();
        let record = capture_background(&mut rig, &drive(1.0), &small_plan()).unwrap();
        assert_eq!(record.num_samples(), 200);
        assert_eq!(record.spectrum.len(), 100);
        let events = bench.events();
        assert!(matches!(events[0], BenchEvent::SourceProgrammed { .. }));
        assert!(matches!(
            &events[1],
            BenchEvent::Captured { channel, num_samples: 200, triggered: true } if channel == "sig"
        ));
        assert!(matches!(events[2], BenchEvent::SourceOff { channel: 1 }));
        // Feed-through is at the drive frequency only.
        let (fundamental, _) = record.spectrum.harmonic(1, 1000.0).unwrap();
        let (third, _) = record.spectrum.harmonic(3, 1000.0).unwrap();
        assert!(fundamental > 1e-3);
        assert!(third < 1e-9);
    }

    #[test]
    fn compatibility_checks_frequency_grid() {
        let (_bench, mut rig) = quiet_bench();
        let record = capture_background(&mut rig, &drive(1.0), &small_plan()).unwrap();
        assert!(record.check_compatible(1000.0, 20_000.0, 200).is_ok());
        assert!(matches!(
            record.check_compatible(1000.0, 20_000.0, 400),
            Err(MpsError::StaleBackground { .. })
        ));
        assert!(record.check_compatible(2000.0, 20_000.0, 200).is_err());
    }

    #[test]
    fn acquisition_timeout_is_reported_with_stage() {
        let (bench, mut rig) = quiet_bench();
        bench.fail_next(Fault::Capture {
            channel: "sig".into(),
        });
        let err = capture_background(&mut rig, &drive(1.0), &small_plan()).unwrap_err();
        assert!(matches!(
            err,
            MpsError::Hardware {
                stage: HardwareStage::SignalAcquisition,
                ..
            }
        ));
        assert!(err.to_string().starts_with("signal acquisition failed"));
        assert!(!bench.source_enabled());
    }
}

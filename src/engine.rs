// src/engine.rs
use crate::dsp::{analyze_with, Spectrum};
use crate::error::{HardwareStage, MpsError, Result};
use crate::instruments::{Acquirer, BiasSource, Clock, Rig, SignalSource};
use crate::measurement::{capture, CancelToken, Session};
use crate::types::*;
use log::{error, info, warn};
use rustfft::FftPlanner;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Runs `session` against `rig` on a worker thread until `Shutdown` arrives or
/// the command channel closes.
///
/// Long operations block the worker; `cancel` is the only way to stop a sweep
/// early.
pub fn spawn_thread<S, B, A, C>(
    session: Session,
    rig: Rig<S, B, A, C>,
    tx: Sender<EngineMessage>,
    rx_cmd: Receiver<EngineCommand>,
    cancel: CancelToken,
) -> JoinHandle<()>
where
    S: SignalSource + Send + 'static,
    B: BiasSource + Send + 'static,
    A: Acquirer + Send + 'static,
    C: Clock + Send + 'static,
{
    thread::spawn(move || {
        let mut engine = Engine {
            session,
            rig,
            tx,
            cancel,
            live: false,
            planner: FftPlanner::new(),
        };
        engine.send(EngineMessage::Log("engine ready".to_owned()));
        engine.send(EngineMessage::State(engine.session.state()));

        'main: loop {
            // 1. 消息处理
            for _ in 0..10 {
                match rx_cmd.try_recv() {
                    Ok(EngineCommand::Shutdown) => break 'main,
                    Ok(cmd) => engine.handle(cmd),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'main,
                }
            }

            // 2. 实时频谱
            if engine.live {
                match engine.live_frame() {
                    Ok(spectrum) => engine.send(EngineMessage::LiveSpectrum(Box::new(spectrum))),
                    Err(e) => {
                        engine.report(&e);
                        engine.stop_live();
                    }
                }
            } else {
                thread::sleep(Duration::from_millis(50));
            }
        }

        engine.stop_live();
        info!("engine stopped");
    })
}

struct Engine<S, B, A, C> {
    session: Session,
    rig: Rig<S, B, A, C>,
    tx: Sender<EngineMessage>,
    cancel: CancelToken,
    live: bool,
    planner: FftPlanner<f64>,
}

impl<S, B, A, C> Engine<S, B, A, C>
where
    S: SignalSource,
    B: BiasSource,
    A: Acquirer,
    C: Clock,
{
    fn send(&self, msg: EngineMessage) {
        self.tx.send(msg).ok();
    }

    fn report(&self, e: &MpsError) {
        error!("{e}");
        self.send(EngineMessage::Error(e.to_string()));
    }

    fn handle(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::SetFieldAmplitude(amplitude) => {
                self.session.set_field_amplitude(amplitude)
            }
            EngineCommand::SetBias(current_a) => self.session.set_bias(current_a),
            EngineCommand::SetOddHarmonicsOnly(on) => self.session.set_only_odd_harmonics(on),
            EngineCommand::StartLive => {
                if let Err(e) = self.start_live() {
                    self.report(&e);
                }
            }
            EngineCommand::StopLive => self.stop_live(),
            EngineCommand::Shutdown => {}
            measurement => {
                // 测量会自行控制信号源
                if self.live {
                    warn!("live monitor stopped for {measurement:?}");
                    self.stop_live();
                }
                let label = format!("{measurement:?}");
                match self.measure(measurement) {
                    Ok(()) => self.send(EngineMessage::Log(format!("{label} done"))),
                    Err(e) => self.report(&e),
                }
                self.send(EngineMessage::State(self.session.state()));
            }
        }
    }

    fn measure(&mut self, cmd: EngineCommand) -> Result<()> {
        match cmd {
            EngineCommand::Calibrate => {
                let curve = self.session.calibrate(&mut self.rig)?.clone();
                self.send(EngineMessage::Calibration(curve));
            }
            EngineCommand::CaptureBackground => {
                let record = self.session.capture_background(&mut self.rig)?;
                let msg = EngineMessage::BackgroundCaptured {
                    num_samples: record.num_samples(),
                    bins: record.spectrum.len(),
                };
                self.send(msg);
            }
            EngineCommand::MeasureSample => {
                let result = self.session.measure_sample(&mut self.rig)?;
                let curve = match self.session.magnetization_curve(&result, false) {
                    Ok(curve) => Some(curve),
                    Err(e) => {
                        warn!("no magnetization curve: {e}");
                        None
                    }
                };
                self.send(EngineMessage::Sample {
                    result: Box::new(result),
                    curve,
                });
            }
            EngineCommand::RunSweep(kind) => {
                self.cancel.reset();
                let tx = self.tx.clone();
                let outcome = self.session.run_sweep(&mut self.rig, kind, &self.cancel, |point| {
                    tx.send(EngineMessage::SweepProgress(point.clone())).ok();
                });
                match outcome {
                    Ok(series) => self.send(EngineMessage::SweepFinished(series)),
                    Err(e) => {
                        self.send(EngineMessage::SweepAborted {
                            kind,
                            points: self.session.last_sweep().map_or(0, |s| s.len()),
                            reason: e.to_string(),
                        });
                        return Err(e);
                    }
                }
            }
            other => warn!("{other:?} is not a measurement"),
        }
        Ok(())
    }

    fn start_live(&mut self) -> Result<()> {
        if self.live {
            return Ok(());
        }
        let exc = self.session.excitation()?;
        self.rig
            .source
            .program(exc.amplitude_vpp, exc.frequency_hz, exc.channel)
            .map_err(MpsError::hardware(HardwareStage::SignalSource))?;
        self.rig.clock.sleep(self.session.config().timing.settle());
        self.live = true;
        self.send(EngineMessage::LiveStatus(true));
        Ok(())
    }

    fn stop_live(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;
        let channel = self.session.config().excitation.channel;
        if let Err(e) = self.rig.source.off(channel) {
            warn!("generator did not switch off after live monitor: {e}");
        }
        self.send(EngineMessage::LiveStatus(false));
    }

    fn live_frame(&mut self) -> Result<Spectrum> {
        let plan = self.session.acquisition_plan();
        let drive_hz = self.session.config().excitation.frequency_hz;
        // 实时视图多读一个采样点
        let n = plan.num_samples(drive_hz)? + 1;
        let waveform = capture(
            &mut self.rig.daq,
            &plan,
            &plan.signal_channel,
            n,
            HardwareStage::SignalAcquisition,
        )?;
        Ok(analyze_with(&mut self.planner, &waveform))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Amplitude, BenchConfig};
    use crate::instruments::sim::{BenchModel, SimulatedBench};
    use crate::instruments::SystemClock;
    use crate::measurement::SweepKind;
    use std::sync::mpsc::channel;

    fn config() -> BenchConfig {
        let mut config = BenchConfig::default();
        config.daq.signal_channel = "sig".into();
        config.daq.current_channel = "cur".into();
        config.daq.sample_rate_hz = 20_000.0;
        config.daq.num_periods = 10;
        config.timing.settle_ms = 0;
        config.timing.step_settle_ms = 0;
        config.timing.calibration_step_ms = 0;
        config.calibration.steps = 5;
        config.sweep.num_steps = 3;
        config.excitation.amplitude = Amplitude::Volts(1.0);
        config
    }

    fn start() -> (
        SimulatedBench,
        Sender<EngineCommand>,
        Receiver<EngineMessage>,
        JoinHandle<()>,
    ) {
        let model = BenchModel {
            noise_v: 0.0,
            ..BenchModel::default()
        };
        let bench = SimulatedBench::new(model, "sig", "cur");
        let rig = bench.rig().with_clock(SystemClock);
        let (tx, rx) = channel();
        let (tx_cmd, rx_cmd) = channel();
        let handle = spawn_thread(
            Session::new(config()),
            rig,
            tx,
            rx_cmd,
            CancelToken::new(),
        );
        (bench, tx_cmd, rx, handle)
    }

    fn wait_for(
        rx: &Receiver<EngineMessage>,
        pred: impl Fn(&EngineMessage) -> bool,
    ) -> EngineMessage {
        loop {
            let msg = rx
                .recv_timeout(Duration::from_secs(10))
                .expect("engine went quiet");
            if pred(&msg) {
                return msg;
            }
        }
    }

    #[test]
    fn commands_run_in_order_and_report_state() {
        let (bench, tx_cmd, rx, handle) = start();
        tx_cmd.send(EngineCommand::MeasureSample).unwrap();
        let err = wait_for(&rx, |m| matches!(m, EngineMessage::Error(_)));
        assert!(matches!(err, EngineMessage::Error(e) if e.contains("no background")));

        tx_cmd.send(EngineCommand::CaptureBackground).unwrap();
        let msg = wait_for(&rx, |m| matches!(m, EngineMessage::BackgroundCaptured { .. }));
        assert!(matches!(
            msg,
            EngineMessage::BackgroundCaptured {
                num_samples: 200,
                bins: 100
            }
        ));
        bench.insert_sample();
        tx_cmd.send(EngineCommand::MeasureSample).unwrap();
        let msg = wait_for(&rx, |m| matches!(m, EngineMessage::Sample { .. }));
        assert!(matches!(msg, EngineMessage::Sample { curve: Some(_), .. }));

        tx_cmd.send(EngineCommand::SetBias(0.5)).unwrap();
        tx_cmd
            .send(EngineCommand::RunSweep(SweepKind::BiasAtFixedField))
            .unwrap();
        let first = wait_for(&rx, |m| matches!(m, EngineMessage::SweepProgress(_)));
        assert!(matches!(first, EngineMessage::SweepProgress(p) if p.step == 0));
        let finished = wait_for(&rx, |m| matches!(m, EngineMessage::SweepFinished(_)));
        assert!(matches!(finished, EngineMessage::SweepFinished(s) if s.len() == 3));

        tx_cmd.send(EngineCommand::Shutdown).unwrap();
        handle.join().unwrap();
        assert!(!bench.source_enabled());
    }

    #[test]
    fn live_monitor_streams_until_stopped() {
        let (bench, tx_cmd, rx, handle) = start();
        tx_cmd.send(EngineCommand::StartLive).unwrap();
        wait_for(&rx, |m| matches!(m, EngineMessage::LiveStatus(true)));
        let frame = wait_for(&rx, |m| matches!(m, EngineMessage::LiveSpectrum(_)));
        // 201 samples per frame
        assert!(matches!(
            frame,
            EngineMessage::LiveSpectrum(s) if s.num_samples == 201 && s.len() == 101
        ));
        assert!(bench.source_enabled());
        tx_cmd.send(EngineCommand::StopLive).unwrap();
        wait_for(&rx, |m| matches!(m, EngineMessage::LiveStatus(false)));
        assert!(!bench.source_enabled());
        drop(tx_cmd);
        handle.join().unwrap();
    }
}

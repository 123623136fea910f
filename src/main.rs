// src/main.rs
use std::io::{self, BufRead, Write};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use mps_bench::config::BenchConfig;
use mps_bench::engine;
use mps_bench::instruments::sim::SimulatedBench;
use mps_bench::instruments::{
    Acquirer, BiasSource, DaqmxAcquirer, Rig, ScpiLink, ScpiPowerSupply, ScpiWaveformGenerator,
    SignalSource,
};
use mps_bench::measurement::{CancelToken, Session, SweepKind};
use mps_bench::types::{EngineCommand, EngineMessage};

const USAGE: &str = "usage: mps-bench [CONFIG.json] [--hardware]";

fn main() -> Result<()> {
    env_logger::init();

    let mut config_path = None;
    let mut hardware = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--hardware" => hardware = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                return Ok(());
            }
            flag if flag.starts_with('-') => bail!("unknown option {flag}\n{USAGE}"),
            path => config_path = Some(path.to_owned()),
        }
    }

    let config = match &config_path {
        Some(path) => BenchConfig::load(path)?,
        None => BenchConfig::default(),
    };

    if hardware {
        let io_timeout = Duration::from_millis(config.instruments.io_timeout_ms);
        let generator = ScpiLink::open_serial(
            &config.instruments.waveform_generator_port,
            config.instruments.baud_rate,
            io_timeout,
        )
        .context("waveform generator")?;
        let supply = ScpiLink::open_serial(
            &config.instruments.power_supply_port,
            config.instruments.baud_rate,
            io_timeout,
        )
        .context("DC bias supply")?;
        let daq = DaqmxAcquirer::connect(
            &config.daq.library,
            config.daq.min_voltage,
            config.daq.max_voltage,
        )
        .context("DAQ card")?;
        let rig = Rig::new(
            ScpiWaveformGenerator::new(generator),
            ScpiPowerSupply::new(supply, config.instruments.compliance_voltage_v),
            daq,
        );
        run_protocol(config, rig, prompt_for_sample)
    } else {
        let bench = SimulatedBench::new(
            config.simulation,
            config.daq.signal_channel.clone(),
            config.daq.current_channel.clone(),
        );
        let rig = bench.rig();
        run_protocol(config, rig, move || {
            info!("simulated sample loaded");
            bench.insert_sample();
            Ok(())
        })
    }
}

fn prompt_for_sample() -> Result<()> {
    print!("Insert the sample and press Enter to continue... ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}

/// Calibrate, take a background, measure the sample, then run both sweeps.
fn run_protocol<S, B, A>(
    config: BenchConfig,
    rig: Rig<S, B, A>,
    mut insert_sample: impl FnMut() -> Result<()>,
) -> Result<()>
where
    S: SignalSource + Send + 'static,
    B: BiasSource + Send + 'static,
    A: Acquirer + Send + 'static,
{
    let (tx, rx) = channel();
    let (tx_cmd, rx_cmd) = channel();
    let cancel = CancelToken::new();
    let handle = engine::spawn_thread(Session::new(config), rig, tx, rx_cmd, cancel);

    let outcome = (|| {
        request(&tx_cmd, &rx, EngineCommand::Calibrate)?;
        request(&tx_cmd, &rx, EngineCommand::CaptureBackground)?;
        insert_sample()?;
        request(&tx_cmd, &rx, EngineCommand::MeasureSample)?;
        request(&tx_cmd, &rx, EngineCommand::RunSweep(SweepKind::FieldAtFixedBias))?;
        request(&tx_cmd, &rx, EngineCommand::RunSweep(SweepKind::BiasAtFixedField))
    })();

    tx_cmd.send(EngineCommand::Shutdown).ok();
    if handle.join().is_err() {
        warn!("engine thread panicked");
    }
    outcome
}

/// Sends `cmd` and logs engine output until it has been answered.
fn request(
    tx_cmd: &Sender<EngineCommand>,
    rx: &Receiver<EngineMessage>,
    cmd: EngineCommand,
) -> Result<()> {
    info!("> {cmd:?}");
    tx_cmd
        .send(cmd)
        .context("engine thread is no longer running")?;
    loop {
        let msg = rx.recv().context("engine thread is no longer running")?;
        match msg {
            EngineMessage::Log(line) => info!("{line}"),
            EngineMessage::State(state) => info!("session state: {state:?}"),
            EngineMessage::LiveStatus(_) | EngineMessage::LiveSpectrum(_) => {}
            EngineMessage::SweepProgress(point) => info!(
                "  step {:>3}: setpoint {:.4}, field {:.3} mT, H3 {:.3e}",
                point.step,
                point.setpoint,
                point.field_mt,
                point.magnitudes.get(&3).copied().unwrap_or(0.0)
            ),
            EngineMessage::Calibration(curve) => {
                info!(
                    "calibration: {:.4} mT/V, intercept {:.4} mT",
                    curve.slope, curve.intercept
                );
                return Ok(());
            }
            EngineMessage::BackgroundCaptured { num_samples, bins } => {
                info!("background: {num_samples} samples, {bins} bins");
                return Ok(());
            }
            EngineMessage::Sample { result, curve } => {
                let drive_hz = result.excitation.frequency_hz;
                for order in (1..=11).step_by(2) {
                    if let Some((magnitude, phase)) = result.spectrum.harmonic(order, drive_hz) {
                        info!("  H{order:<2} {magnitude:.4e} V  {phase:+.3} rad");
                    }
                }
                if let Some(curve) = curve {
                    let peak = curve.magnetization.iter().fold(0.0f64, |a, &m| a.max(m.abs()));
                    info!("magnetization curve: {} points, peak {peak:.4e}", curve.field.len());
                }
                return Ok(());
            }
            EngineMessage::SweepFinished(series) => {
                info!("{:?} sweep: {} points", series.kind, series.len());
                return Ok(());
            }
            EngineMessage::SweepAborted { kind, points, reason } => {
                bail!("{kind:?} sweep aborted after {points} points: {reason}")
            }
            EngineMessage::Error(e) => bail!(e),
        }
    }
}

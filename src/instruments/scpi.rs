use std::io::Write;
use std::time::Duration;

use log::debug;
use serialport::{DataBits, SerialPort};

use crate::instruments::{BiasSource, InstrumentError, SignalSource};

/// Line-oriented SCPI command link.
pub struct ScpiLink<W: Write> {
    name: String,
    port: W,
}

impl ScpiLink<Box<dyn SerialPort>> {
    /// Opens a serial SCPI link (8 data bits, no parity).
    pub fn open_serial(
        path: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Self, InstrumentError> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .timeout(timeout)
            .open()?;
        Ok(Self::new(path, port))
    }
}

impl<W: Write> ScpiLink<W> {
    pub fn new(name: impl Into<String>, port: W) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }

    pub fn write(&mut self, command: &str) -> Result<(), InstrumentError> {
        debug!("{} <- {}", self.name, command);
        self.port.write_all(command.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.port
    }
}

/// Arbitrary waveform generator driven over SCPI.
pub struct ScpiWaveformGenerator<W: Write> {
    link: ScpiLink<W>,
}

impl<W: Write> ScpiWaveformGenerator<W> {
    pub fn new(link: ScpiLink<W>) -> Self {
        Self { link }
    }

    pub fn into_link(self) -> ScpiLink<W> {
        self.link
    }
}

impl<W: Write> SignalSource for ScpiWaveformGenerator<W> {
    fn program(
        &mut self,
        amplitude_vpp: f64,
        frequency_hz: f64,
        channel: u8,
    ) -> Result<(), InstrumentError> {
        self.link
            .write(&format!("SOURCE{channel}:VOLTage {amplitude_vpp}Vpp"))?;
        self.link
            .write(&format!("SOURCE{channel}:FREQuency {frequency_hz} HZ"))?;
        self.link.write(&format!("OUTPUT{channel} ON"))?;
        // Sync output feeds the DAQ start trigger.
        self.link.write(&format!("OUTPUT:SYNC{channel} ON"))?;
        self.link
            .write(&format!("TRIGger:MODE:SOURCE{channel} IMM"))?;
        self.link.write(&format!("TRIGger:SOURCE{channel} BUS"))?;
        Ok(())
    }

    fn off(&mut self, channel: u8) -> Result<(), InstrumentError> {
        self.link.write(&format!("OUTPUT{channel} OFF"))
    }
}

/// Enabled output of a [`ScpiPowerSupply`].
#[derive(Debug, PartialEq)]
pub struct SupplyOutput {
    pub current_a: f64,
}

/// Programmable DC supply driving the bias coils in constant-current mode.
pub struct ScpiPowerSupply<W: Write> {
    link: ScpiLink<W>,
    compliance_voltage_v: f64,
}

impl<W: Write> ScpiPowerSupply<W> {
    pub fn new(link: ScpiLink<W>, compliance_voltage_v: f64) -> Self {
        Self {
            link,
            compliance_voltage_v,
        }
    }

    pub fn into_link(self) -> ScpiLink<W> {
        self.link
    }
}

impl<W: Write> BiasSource for ScpiPowerSupply<W> {
    type Handle = SupplyOutput;

    fn program(&mut self, current_a: f64) -> Result<SupplyOutput, InstrumentError> {
        self.link.write(&format!(
            ":SOURce:VOLTage:LEVel {}",
            self.compliance_voltage_v
        ))?;
        self.link
            .write(&format!(":SOURce:CURRent:LEVel {current_a}"))?;
        self.link.write(":OUTPut:STATe ON")?;
        Ok(SupplyOutput { current_a })
    }

    fn off(&mut self, _handle: SupplyOutput) -> Result<(), InstrumentError> {
        self.link.write(":OUTPut:STATe OFF")
    }
}

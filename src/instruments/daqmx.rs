use std::ffi::CString;
use std::os::raw::{c_char, c_void};
use std::ptr;
use std::time::Duration;

use libloading::Library;
use log::debug;
use once_cell::sync::OnceCell;

use crate::instruments::{Acquirer, CaptureRequest, InstrumentError};

type TaskHandle = *mut c_void;

const DAQMX_VAL_CFG_DEFAULT: i32 = -1;
const DAQMX_VAL_VOLTS: i32 = 10348;
const DAQMX_VAL_RISING: i32 = 10280;
const DAQMX_VAL_FINITE_SAMPS: i32 = 10178;
const DAQMX_VAL_GROUP_BY_CHANNEL: u32 = 0;
const DAQMX_ERROR_SAMPLES_NOT_YET_AVAILABLE: i32 = -200284;
const DAQMX_ERROR_TIMEOUT: i32 = -200474;

#[cfg(windows)]
pub const DEFAULT_LIBRARY: &str = "nicaiu.dll";
#[cfg(not(windows))]
pub const DEFAULT_LIBRARY: &str = "libnidaqmx.so";

struct DaqmxApi {
    #[allow(dead_code)]
    lib: Library,
    create_task: unsafe extern "C" fn(*const c_char, *mut TaskHandle) -> i32,
    create_ai_voltage_chan: unsafe extern "C" fn(
        TaskHandle,
        *const c_char,
        *const c_char,
        i32,
        f64,
        f64,
        i32,
        *const c_char,
    ) -> i32,
    cfg_samp_clk_timing:
        unsafe extern "C" fn(TaskHandle, *const c_char, f64, i32, i32, u64) -> i32,
    cfg_dig_edge_start_trig: unsafe extern "C" fn(TaskHandle, *const c_char, i32) -> i32,
    start_task: unsafe extern "C" fn(TaskHandle) -> i32,
    read_analog_f64: unsafe extern "C" fn(
        TaskHandle,
        i32,
        f64,
        u32,
        *mut f64,
        u32,
        *mut i32,
        *mut u32,
    ) -> i32,
    stop_task: unsafe extern "C" fn(TaskHandle) -> i32,
    clear_task: unsafe extern "C" fn(TaskHandle) -> i32,
}

impl DaqmxApi {
    fn load(path: &str) -> Result<Self, InstrumentError> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| InstrumentError::Unavailable(format!("{path}: {e}")))?;
        // Safety: signatures follow NIDAQmx.h from the NI-DAQmx C API.
        unsafe {
            Ok(Self {
                create_task: *lib.get(b"DAQmxCreateTask\0")?,
                create_ai_voltage_chan: *lib.get(b"DAQmxCreateAIVoltageChan\0")?,
                cfg_samp_clk_timing: *lib.get(b"DAQmxCfgSampClkTiming\0")?,
                cfg_dig_edge_start_trig: *lib.get(b"DAQmxCfgDigEdgeStartTrig\0")?,
                start_task: *lib.get(b"DAQmxStartTask\0")?,
                read_analog_f64: *lib.get(b"DAQmxReadAnalogF64\0")?,
                stop_task: *lib.get(b"DAQmxStopTask\0")?,
                clear_task: *lib.get(b"DAQmxClearTask\0")?,
                lib,
            })
        }
    }

    fn instance(path: &str) -> Result<&'static DaqmxApi, InstrumentError> {
        static API: OnceCell<DaqmxApi> = OnceCell::new();
        API.get_or_try_init(|| Self::load(path))
    }

    fn check(code: i32, ctx: &str) -> Result<(), InstrumentError> {
        // Positive codes are warnings; the read still produced data.
        if code >= 0 {
            Ok(())
        } else {
            Err(InstrumentError::Driver {
                code,
                context: ctx.to_owned(),
            })
        }
    }
}

/// DAQmx task that is cleared when dropped.
struct Task<'a> {
    api: &'a DaqmxApi,
    handle: TaskHandle,
}

impl<'a> Task<'a> {
    fn create(api: &'a DaqmxApi) -> Result<Self, InstrumentError> {
        let mut handle: TaskHandle = ptr::null_mut();
        DaqmxApi::check(
            unsafe { (api.create_task)(empty_c_str(), &mut handle as *mut TaskHandle) },
            "DAQmxCreateTask",
        )?;
        Ok(Self { api, handle })
    }
}

impl Drop for Task<'_> {
    fn drop(&mut self) {
        unsafe {
            let _ = (self.api.stop_task)(self.handle);
            let _ = (self.api.clear_task)(self.handle);
        }
    }
}

fn empty_c_str() -> *const c_char {
    b"\0".as_ptr().cast()
}

fn c_string(value: &str) -> Result<CString, InstrumentError> {
    CString::new(value)
        .map_err(|_| InstrumentError::Unavailable(format!("invalid channel name {value:?}")))
}

/// NI-DAQmx analog input, one finite task per capture.
pub struct DaqmxAcquirer {
    api: &'static DaqmxApi,
    min_voltage: f64,
    max_voltage: f64,
}

impl DaqmxAcquirer {
    /// Loads the DAQmx runtime; only the first library path in a process is used.
    pub fn connect(
        library: &str,
        min_voltage: f64,
        max_voltage: f64,
    ) -> Result<Self, InstrumentError> {
        let api = DaqmxApi::instance(library)?;
        Ok(Self {
            api,
            min_voltage,
            max_voltage,
        })
    }
}

impl Acquirer for DaqmxAcquirer {
    fn capture(&mut self, request: &CaptureRequest) -> Result<Vec<f64>, InstrumentError> {
        debug!(
            "DAQmx capture {} x{} @ {} Hz (trigger {:?})",
            request.channel, request.num_samples, request.sample_rate_hz, request.trigger
        );
        let api = self.api;
        let task = Task::create(api)?;
        let channel = c_string(&request.channel)?;
        DaqmxApi::check(
            unsafe {
                (api.create_ai_voltage_chan)(
                    task.handle,
                    channel.as_ptr(),
                    empty_c_str(),
                    DAQMX_VAL_CFG_DEFAULT,
                    self.min_voltage,
                    self.max_voltage,
                    DAQMX_VAL_VOLTS,
                    ptr::null(),
                )
            },
            "DAQmxCreateAIVoltageChan",
        )?;
        DaqmxApi::check(
            unsafe {
                (api.cfg_samp_clk_timing)(
                    task.handle,
                    ptr::null(),
                    request.sample_rate_hz,
                    DAQMX_VAL_RISING,
                    DAQMX_VAL_FINITE_SAMPS,
                    request.num_samples as u64,
                )
            },
            "DAQmxCfgSampClkTiming",
        )?;
        if let Some(trigger) = &request.trigger {
            let trigger = c_string(trigger)?;
            DaqmxApi::check(
                unsafe {
                    (api.cfg_dig_edge_start_trig)(task.handle, trigger.as_ptr(), DAQMX_VAL_RISING)
                },
                "DAQmxCfgDigEdgeStartTrig",
            )?;
        }
        DaqmxApi::check(unsafe { (api.start_task)(task.handle) }, "DAQmxStartTask")?;

        let mut buffer = vec![0.0f64; request.num_samples];
        let mut read: i32 = 0;
        let code = unsafe {
            (api.read_analog_f64)(
                task.handle,
                request.num_samples as i32,
                request.timeout.as_secs_f64(),
                DAQMX_VAL_GROUP_BY_CHANNEL,
                buffer.as_mut_ptr(),
                buffer.len() as u32,
                &mut read as *mut i32,
                ptr::null_mut(),
            )
        };
        if code == DAQMX_ERROR_TIMEOUT || code == DAQMX_ERROR_SAMPLES_NOT_YET_AVAILABLE {
            return Err(InstrumentError::Timeout(request.timeout));
        }
        DaqmxApi::check(code, "DAQmxReadAnalogF64")?;
        let read = read.max(0) as usize;
        if read < request.num_samples {
            return Err(InstrumentError::ShortRead {
                expected: request.num_samples,
                actual: read,
            });
        }
        Ok(buffer)
    }
}

/// Timeout used when the caller does not configure one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_runtime_is_unavailable() {
        let err = DaqmxApi::load("definitely-not-nidaqmx-runtime.so").err().unwrap();
        assert!(matches!(err, InstrumentError::Unavailable(_)));
    }

    #[test]
    fn negative_codes_are_errors_and_warnings_pass() {
        assert!(DaqmxApi::check(0, "x").is_ok());
        assert!(DaqmxApi::check(200_000, "x").is_ok());
        let err = DaqmxApi::check(-200_077, "DAQmxStartTask").unwrap_err();
        assert_eq!(err.to_string(), "DAQmxStartTask failed (driver code -200077)");
    }
}

// Copyright 2025 CEMAXECUTER LLC

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_double, c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rad_arena::Arena;

use crate::select::resolve_bandwidth;
use crate::{ChannelInfo, Gain, PingPong, Range, Receiver, SampleBatch, StreamFormat, StreamInfo};

type SoapyDevice = c_void;
type SoapyStream = c_void;

const SOAPY_SDR_RX: c_int = 0;
const SOAPY_SDR_TX: c_int = 1;
const SOAPY_SDR_TIMEOUT: c_int = -1;
const SOAPY_SDR_OVERFLOW: c_int = -4;

#[repr(C)]
struct SoapyKwargs {
    size: usize,
    keys: *mut *mut c_char,
    vals: *mut *mut c_char,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SoapyRange {
    minimum: c_double,
    maximum: c_double,
    step: c_double,
}

extern "C" {
    fn SoapySDRDevice_enumerate(args: *const SoapyKwargs, length: *mut usize) -> *mut SoapyKwargs;
    fn SoapySDRDevice_make(args: *const SoapyKwargs) -> *mut SoapyDevice;
    fn SoapySDRDevice_unmake(device: *mut SoapyDevice) -> c_int;
    fn SoapySDRDevice_setSampleRate(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        rate: c_double,
    ) -> c_int;
    fn SoapySDRDevice_setFrequency(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        frequency: c_double,
        args: *const SoapyKwargs,
    ) -> c_int;
    fn SoapySDRDevice_setGainMode(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        automatic: bool,
    ) -> c_int;
    fn SoapySDRDevice_setGain(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        value: c_double,
    ) -> c_int;
    fn SoapySDRDevice_getGainRange(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
    ) -> SoapyRange;
    fn SoapySDRDevice_setBandwidth(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        bw: c_double,
    ) -> c_int;
    fn SoapySDRDevice_listBandwidths(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        length: *mut usize,
    ) -> *mut c_double;
    fn SoapySDRDevice_setAntenna(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        name: *const c_char,
    ) -> c_int;
    fn SoapySDRDevice_listAntennas(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        length: *mut usize,
    ) -> *mut *mut c_char;
    fn SoapySDRDevice_getFrequencyRange(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        length: *mut usize,
    ) -> *mut SoapyRange;
    fn SoapySDRDevice_getSampleRateRange(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        length: *mut usize,
    ) -> *mut SoapyRange;
    fn SoapySDRDevice_getNumChannels(dev: *mut SoapyDevice, direction: c_int) -> usize;
    fn SoapySDRDevice_getNativeStreamFormat(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        full_scale: *mut c_double,
    ) -> *mut c_char;
    fn SoapySDRDevice_setupStream(
        dev: *mut SoapyDevice,
        direction: c_int,
        format: *const c_char,
        channels: *const usize,
        num_chans: usize,
        args: *const SoapyKwargs,
    ) -> *mut SoapyStream;
    fn SoapySDRDevice_activateStream(
        dev: *mut SoapyDevice,
        stream: *mut SoapyStream,
        flags: c_int,
        time_ns: i64,
        num_elems: usize,
    ) -> c_int;
    fn SoapySDRDevice_deactivateStream(
        dev: *mut SoapyDevice,
        stream: *mut SoapyStream,
        flags: c_int,
        time_ns: i64,
    ) -> c_int;
    fn SoapySDRDevice_closeStream(dev: *mut SoapyDevice, stream: *mut SoapyStream) -> c_int;
    fn SoapySDRDevice_readStream(
        dev: *mut SoapyDevice,
        stream: *mut SoapyStream,
        buffs: *const *mut c_void,
        num_elems: usize,
        flags: *mut c_int,
        time_ns: *mut i64,
        timeout_us: i64,
    ) -> c_int;
    fn SoapySDRDevice_getStreamMTU(dev: *mut SoapyDevice, stream: *mut SoapyStream) -> usize;
    fn SoapySDRDevice_lastError() -> *const c_char;
    fn SoapySDRKwargsList_clear(info: *mut SoapyKwargs, length: usize);
    fn SoapySDRStrings_clear(strings: *mut *mut c_char, length: usize);
    fn SoapySDR_free(ptr: *mut c_void);
}

fn last_error() -> String {
    unsafe {
        let p = SoapySDRDevice_lastError();
        if p.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(p).to_string_lossy().to_string()
        }
    }
}

fn check(r: c_int, what: &str) -> Result<(), String> {
    if r != 0 {
        Err(format!("SoapySDR {} failed: {}", what, last_error()))
    } else {
        Ok(())
    }
}

/// Copy out and free a SoapySDR string list.
unsafe fn take_strings(list: *mut *mut c_char, length: usize) -> Vec<String> {
    if list.is_null() {
        return Vec::new();
    }
    let out = (0..length)
        .map(|i| CStr::from_ptr(*list.add(i)).to_string_lossy().to_string())
        .collect();
    SoapySDRStrings_clear(list, length);
    out
}

/// Copy out and free a SoapySDR range list, converting Hz to MHz.
unsafe fn take_ranges_mhz(list: *mut SoapyRange, length: usize) -> Vec<Range> {
    if list.is_null() {
        return Vec::new();
    }
    let out = (0..length)
        .map(|i| {
            let r = *list.add(i);
            Range {
                from: r.minimum / 1e6,
                to: r.maximum / 1e6,
            }
        })
        .collect();
    SoapySDR_free(list as *mut c_void);
    out
}

/// One enumerated device, described by its kwargs.
#[derive(Debug, Clone)]
pub struct SoapyInfo {
    pub index: usize,
    pub driver: String,
    pub label: String,
}

pub fn list_devices() -> Vec<SoapyInfo> {
    let mut length: usize = 0;
    let results = unsafe { SoapySDRDevice_enumerate(ptr::null(), &mut length) };
    if results.is_null() || length == 0 {
        return Vec::new();
    }

    let mut devices = Vec::with_capacity(length);
    for i in 0..length {
        let kw = unsafe { &*results.add(i) };
        let mut driver = String::new();
        let mut label = String::new();
        for j in 0..kw.size {
            let key = unsafe { CStr::from_ptr(*kw.keys.add(j)) }.to_string_lossy();
            let val = unsafe { CStr::from_ptr(*kw.vals.add(j)) }.to_string_lossy();
            match key.as_ref() {
                "driver" => driver = val.to_string(),
                "label" => label = val.to_string(),
                _ => {}
            }
        }
        devices.push(SoapyInfo {
            index: i,
            driver,
            label,
        });
    }

    unsafe { SoapySDRKwargsList_clear(results, length) };
    devices
}

/// One receiver candidate per enumerated SoapySDR device; the device's
/// driver key becomes the mode so `--filter-mode` can pick a backend.
pub fn candidates() -> Vec<SoapyReceiver> {
    list_devices().into_iter().map(SoapyReceiver::new).collect()
}

pub struct SoapyReceiver {
    info: SoapyInfo,
    dev: *mut SoapyDevice,
    format: StreamFormat,
    full_scale: f64,
    sample_rate: u32,
    running: Arc<AtomicBool>,
}

// Single owner; the device is driven from one thread at a time.
unsafe impl Send for SoapyReceiver {}

impl SoapyReceiver {
    pub fn new(info: SoapyInfo) -> Self {
        Self {
            info,
            dev: ptr::null_mut(),
            format: StreamFormat::S16C,
            full_scale: 32768.0,
            sample_rate: 0,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn device(&self) -> Result<*mut SoapyDevice, String> {
        if self.dev.is_null() {
            Err(format!("SoapySDR device {} not open", self.info.index))
        } else {
            Ok(self.dev)
        }
    }

    /// Pick CS8 when the hardware is natively 8-bit, CS16 otherwise.
    fn detect_native_format(&mut self) {
        let mut full_scale: c_double = 0.0;
        let p = unsafe { SoapySDRDevice_getNativeStreamFormat(self.dev, SOAPY_SDR_RX, 0, &mut full_scale) };
        let native = if p.is_null() {
            String::new()
        } else {
            let s = unsafe { CStr::from_ptr(p) }.to_string_lossy().to_string();
            unsafe { SoapySDR_free(p as *mut c_void) };
            s
        };
        if native == "CS8" {
            self.format = StreamFormat::S8C;
            self.full_scale = if full_scale > 0.0 { full_scale } else { 128.0 };
        } else {
            self.format = StreamFormat::S16C;
            self.full_scale = if native == "CS16" && full_scale > 0.0 {
                full_scale
            } else {
                32768.0
            };
        }
    }
}

impl Drop for SoapyReceiver {
    fn drop(&mut self) {
        if !self.dev.is_null() {
            unsafe { SoapySDRDevice_unmake(self.dev) };
        }
    }
}

impl Receiver for SoapyReceiver {
    fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            format: self.format,
            full_scale: self.full_scale,
            name: "soapysdr".to_string(),
            mode: self.info.driver.clone(),
        }
    }

    fn open(&mut self, device_id: Option<usize>) -> Result<(), String> {
        if let Some(id) = device_id {
            if id != self.info.index {
                return Err(format!("SoapySDR candidate {} is not device {}", self.info.index, id));
            }
        }

        let mut length: usize = 0;
        let results = unsafe { SoapySDRDevice_enumerate(ptr::null(), &mut length) };
        if results.is_null() || self.info.index >= length {
            if !results.is_null() {
                unsafe { SoapySDRKwargsList_clear(results, length) };
            }
            return Err(format!(
                "SoapySDR device index {} not found ({} devices)",
                self.info.index, length
            ));
        }

        let dev = unsafe { SoapySDRDevice_make(results.add(self.info.index)) };
        unsafe { SoapySDRKwargsList_clear(results, length) };
        if dev.is_null() {
            return Err(format!("SoapySDR make failed: {}", last_error()));
        }
        self.dev = dev;
        self.detect_native_format();
        self.running.store(true, Ordering::SeqCst);

        log::info!(
            "SoapySDR opened (index={}, driver={}, label={}, {})",
            self.info.index,
            self.info.driver,
            self.info.label,
            self.format
        );
        Ok(())
    }

    fn set_sample_rate(&mut self, rate: u32) -> Result<(), String> {
        let dev = self.device()?;
        check(
            unsafe { SoapySDRDevice_setSampleRate(dev, SOAPY_SDR_RX, 0, rate as f64) },
            "setSampleRate",
        )?;
        self.sample_rate = rate;
        log::info!("soapysdr sample rate is now {}", rate);
        Ok(())
    }

    fn set_frequency(&mut self, hz: u64) -> Result<(), String> {
        let dev = self.device()?;
        check(
            unsafe { SoapySDRDevice_setFrequency(dev, SOAPY_SDR_RX, 0, hz as f64, ptr::null()) },
            "setFrequency",
        )?;
        log::info!("soapysdr now tuned to {} Hz", hz);
        Ok(())
    }

    fn set_gain(&mut self, gain: Gain) -> Result<(), String> {
        let dev = self.device()?;
        match gain {
            Gain::Auto => {
                check(
                    unsafe { SoapySDRDevice_setGainMode(dev, SOAPY_SDR_RX, 0, true) },
                    "setGainMode",
                )?;
                log::info!("soapysdr now set to automatic gain");
            }
            Gain::Db(db) => {
                check(
                    unsafe { SoapySDRDevice_setGainMode(dev, SOAPY_SDR_RX, 0, false) },
                    "setGainMode",
                )?;
                let range = unsafe { SoapySDRDevice_getGainRange(dev, SOAPY_SDR_RX, 0) };
                let clamped = if range.maximum > range.minimum {
                    db.clamp(range.minimum, range.maximum)
                } else {
                    db
                };
                check(
                    unsafe { SoapySDRDevice_setGain(dev, SOAPY_SDR_RX, 0, clamped) },
                    "setGain",
                )?;
                log::info!("soapysdr gain now set to {:.1} dB", clamped);
            }
        }
        Ok(())
    }

    fn set_antenna(&mut self, antenna: &str) -> Result<(), String> {
        let dev = self.device()?;
        let available = self.list_antennas();
        // Accept either an antenna name or its index in the list.
        let name = match antenna.parse::<usize>() {
            Ok(i) if i < available.len() => available[i].clone(),
            _ => antenna.to_string(),
        };
        if available.is_empty() {
            return Ok(());
        }
        let cs = CString::new(name.as_str()).map_err(|e| format!("CString error: {}", e))?;
        check(
            unsafe { SoapySDRDevice_setAntenna(dev, SOAPY_SDR_RX, 0, cs.as_ptr()) },
            "setAntenna",
        )?;
        log::info!("soapysdr antenna now {}", name);
        Ok(())
    }

    fn set_bandwidth(&mut self, khz: Option<u32>) -> Result<(), String> {
        let dev = self.device()?;
        let hz = resolve_bandwidth(khz, self.sample_rate);
        check(
            unsafe { SoapySDRDevice_setBandwidth(dev, SOAPY_SDR_RX, 0, hz as f64) },
            "setBandwidth",
        )?;
        log::info!("soapysdr bandwidth now set to {}", hz);
        Ok(())
    }

    fn list_antennas(&self) -> Vec<String> {
        let Ok(dev) = self.device() else {
            return Vec::new();
        };
        let mut length = 0usize;
        unsafe {
            let list = SoapySDRDevice_listAntennas(dev, SOAPY_SDR_RX, 0, &mut length);
            take_strings(list, length)
        }
    }

    fn list_bandwidths(&self) -> Vec<u32> {
        let Ok(dev) = self.device() else {
            return Vec::new();
        };
        let mut length = 0usize;
        unsafe {
            let list = SoapySDRDevice_listBandwidths(dev, SOAPY_SDR_RX, 0, &mut length);
            if list.is_null() {
                return Vec::new();
            }
            let out = (0..length).map(|i| (*list.add(i) / 1000.0).round() as u32).collect();
            SoapySDR_free(list as *mut c_void);
            out
        }
    }

    fn list_frequency_ranges(&self) -> Vec<Range> {
        let Ok(dev) = self.device() else {
            return Vec::new();
        };
        let mut length = 0usize;
        unsafe {
            let list = SoapySDRDevice_getFrequencyRange(dev, SOAPY_SDR_RX, 0, &mut length);
            take_ranges_mhz(list, length)
        }
    }

    fn list_gains(&self) -> Vec<f64> {
        let Ok(dev) = self.device() else {
            return Vec::new();
        };
        let range = unsafe { SoapySDRDevice_getGainRange(dev, SOAPY_SDR_RX, 0) };
        let step = if range.step > 0.0 { range.step } else { 1.0 };
        let mut gains = Vec::new();
        let mut g = range.minimum;
        while g <= range.maximum + 1e-9 {
            gains.push(g);
            g += step;
        }
        gains
    }

    fn number_of_channels(&self) -> ChannelInfo {
        let Ok(dev) = self.device() else {
            return ChannelInfo::default();
        };
        unsafe {
            ChannelInfo {
                rx: SoapySDRDevice_getNumChannels(dev, SOAPY_SDR_RX),
                tx: SoapySDRDevice_getNumChannels(dev, SOAPY_SDR_TX),
            }
        }
    }

    fn list_sample_rate_ranges(&self) -> Vec<Range> {
        let Ok(dev) = self.device() else {
            return Vec::new();
        };
        let mut length = 0usize;
        unsafe {
            let list = SoapySDRDevice_getSampleRateRange(dev, SOAPY_SDR_RX, 0, &mut length);
            take_ranges_mhz(list, length)
        }
    }

    fn start_sampling(
        &mut self,
        arena: &Arc<Arena>,
        sink: &mut dyn FnMut(SampleBatch),
    ) -> Result<(), String> {
        let dev = self.device()?;
        let fmt_str = match self.format {
            StreamFormat::S8C => c"CS8",
            StreamFormat::S16C => c"CS16",
        };

        let channel: usize = 0;
        let stream = unsafe {
            SoapySDRDevice_setupStream(
                dev,
                SOAPY_SDR_RX,
                fmt_str.as_ptr(),
                &channel,
                1,
                ptr::null(),
            )
        };
        if stream.is_null() {
            return Err(format!("SoapySDR setupStream failed: {}", last_error()));
        }

        let mtu = unsafe { SoapySDRDevice_getStreamMTU(dev, stream) };
        let mtu = if mtu == 0 { 65536 } else { mtu };

        let r = unsafe { SoapySDRDevice_activateStream(dev, stream, 0, 0, 0) };
        if r != 0 {
            unsafe { SoapySDRDevice_closeStream(dev, stream) };
            return Err(format!("SoapySDR activateStream failed: {}", last_error()));
        }

        let frame_bytes = 2 * self.format.value_bytes();
        let mut buffers = PingPong::new(arena, mtu * frame_bytes);
        log::info!(
            "SoapySDR streaming (index={}, {} S/s, {})",
            self.info.index,
            self.sample_rate,
            self.format
        );

        let mut result = Ok(());
        while self.running.load(Ordering::SeqCst) {
            let buffer = match buffers.next_buffer() {
                Ok(b) => b,
                Err(e) => {
                    result = Err(e.to_string());
                    break;
                }
            };
            let mut flags: c_int = 0;
            let mut time_ns: i64 = 0;
            let read = buffer.write(|bytes: &mut [u8]| {
                let buf_ptr = bytes.as_mut_ptr() as *mut c_void;
                unsafe {
                    SoapySDRDevice_readStream(
                        dev,
                        stream,
                        &buf_ptr,
                        mtu,
                        &mut flags,
                        &mut time_ns,
                        100_000,
                    )
                }
            });
            let ret = match read {
                Ok(ret) => ret,
                Err(e) => {
                    result = Err(e.to_string());
                    break;
                }
            };

            if ret == SOAPY_SDR_TIMEOUT || ret == SOAPY_SDR_OVERFLOW {
                continue;
            }
            if ret < 0 {
                log::error!("SoapySDR read error: {}", ret);
                break;
            }

            sink(SampleBatch {
                buffer,
                samples: ret as usize,
                full_scale: self.full_scale,
                format: self.format,
            });
        }

        unsafe {
            SoapySDRDevice_deactivateStream(dev, stream, 0, 0);
            SoapySDRDevice_closeStream(dev, stream);
        }
        self.running.store(false, Ordering::SeqCst);
        log::info!("SoapySDR streaming stopped");
        result
    }

    fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }
}

// Copyright 2025-2026 CEMAXECUTER LLC

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rad_arena::Arena;

use crate::select::{gain_tenths, nearest, resolve_bandwidth};
use crate::{ChannelInfo, Gain, PingPong, Range, Receiver, SampleBatch, StreamFormat, StreamInfo};

type RtlSdrDev = c_void;

extern "C" {
    fn rtlsdr_get_device_count() -> u32;
    fn rtlsdr_get_device_name(index: u32) -> *const c_char;
    fn rtlsdr_open(dev: *mut *mut RtlSdrDev, index: u32) -> c_int;
    fn rtlsdr_close(dev: *mut RtlSdrDev) -> c_int;
    fn rtlsdr_set_sample_rate(dev: *mut RtlSdrDev, rate: u32) -> c_int;
    fn rtlsdr_get_sample_rate(dev: *mut RtlSdrDev) -> u32;
    fn rtlsdr_set_center_freq(dev: *mut RtlSdrDev, freq: u32) -> c_int;
    fn rtlsdr_set_tuner_gain_mode(dev: *mut RtlSdrDev, manual: c_int) -> c_int;
    fn rtlsdr_get_tuner_gains(dev: *mut RtlSdrDev, gains: *mut c_int) -> c_int;
    fn rtlsdr_set_tuner_gain(dev: *mut RtlSdrDev, gain: c_int) -> c_int;
    fn rtlsdr_set_tuner_bandwidth(dev: *mut RtlSdrDev, bw: u32) -> c_int;
    fn rtlsdr_reset_buffer(dev: *mut RtlSdrDev) -> c_int;
    fn rtlsdr_read_sync(
        dev: *mut RtlSdrDev,
        buf: *mut c_void,
        len: c_int,
        n_read: *mut c_int,
    ) -> c_int;
}

/// Bytes per synchronous read; libusb wants a multiple of 512.
const READ_BYTES: usize = 16 * 16384;

/// Tuner bandwidths, in kHz
const BANDWIDTHS_KHZ: [u32; 15] = [
    290, 375, 420, 470, 600, 860, 950, 1100, 1300, 1500, 1600, 1750, 1950, 2048, 2560,
];

#[derive(Debug, Clone)]
pub struct RtlSdrInfo {
    pub index: usize,
    pub name: String,
}

pub fn list_devices() -> Vec<RtlSdrInfo> {
    let count = unsafe { rtlsdr_get_device_count() };
    (0..count)
        .map(|i| {
            let p = unsafe { rtlsdr_get_device_name(i) };
            let name = if p.is_null() {
                String::new()
            } else {
                unsafe { CStr::from_ptr(p) }.to_string_lossy().to_string()
            };
            RtlSdrInfo {
                index: i as usize,
                name,
            }
        })
        .collect()
}

/// RTL2832U dongle read synchronously through librtlsdr.
pub struct RtlSdrReceiver {
    dev: *mut RtlSdrDev,
    sample_rate: u32,
    running: Arc<AtomicBool>,
}

// The device pointer has a single owner and is only used from one thread at a time.
unsafe impl Send for RtlSdrReceiver {}

impl RtlSdrReceiver {
    pub fn new() -> Self {
        Self {
            dev: ptr::null_mut(),
            sample_rate: 0,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn device(&self) -> Result<*mut RtlSdrDev, String> {
        if self.dev.is_null() {
            Err("rtlsdr device not open".to_string())
        } else {
            Ok(self.dev)
        }
    }

    /// Tuner gains in tenths of a dB, as the driver reports them.
    fn tuner_gains(&self) -> Vec<i64> {
        let Ok(dev) = self.device() else {
            return Vec::new();
        };
        let count = unsafe { rtlsdr_get_tuner_gains(dev, ptr::null_mut()) };
        if count <= 0 {
            log::error!("cannot get list of gains from tuner");
            return Vec::new();
        }
        let mut gains = vec![0 as c_int; count as usize];
        let count = unsafe { rtlsdr_get_tuner_gains(dev, gains.as_mut_ptr()) };
        gains.truncate(count.max(0) as usize);
        gains.into_iter().map(i64::from).collect()
    }
}

impl Default for RtlSdrReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RtlSdrReceiver {
    fn drop(&mut self) {
        if !self.dev.is_null() {
            unsafe { rtlsdr_close(self.dev) };
        }
    }
}

impl Receiver for RtlSdrReceiver {
    fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            format: StreamFormat::S8C,
            full_scale: 128.0,
            name: "rtlsdr".to_string(),
            mode: String::new(),
        }
    }

    fn open(&mut self, device_id: Option<usize>) -> Result<(), String> {
        let id = device_id.unwrap_or(0);
        let count = unsafe { rtlsdr_get_device_count() } as usize;
        if id >= count {
            return Err(format!("rtlsdr device {} not found ({} devices)", id, count));
        }
        let mut dev: *mut RtlSdrDev = ptr::null_mut();
        let r = unsafe { rtlsdr_open(&mut dev, id as u32) };
        if r < 0 || dev.is_null() {
            return Err(format!("rtlsdr_open({}) failed: {}", id, r));
        }
        self.dev = dev;
        self.running.store(true, Ordering::SeqCst);
        log::info!("rtlsdr opened (index={})", id);
        Ok(())
    }

    fn set_sample_rate(&mut self, rate: u32) -> Result<(), String> {
        let dev = self.device()?;
        let r = unsafe { rtlsdr_set_sample_rate(dev, rate) };
        if r < 0 {
            return Err(format!("failed to set sample rate of {}: {}", rate, r));
        }
        self.sample_rate = unsafe { rtlsdr_get_sample_rate(dev) };
        log::info!("rtlsdr sample rate is now {}", self.sample_rate);
        Ok(())
    }

    fn set_frequency(&mut self, hz: u64) -> Result<(), String> {
        let dev = self.device()?;
        let freq = u32::try_from(hz).map_err(|_| format!("frequency {} Hz out of range", hz))?;
        let r = unsafe { rtlsdr_set_center_freq(dev, freq) };
        if r < 0 {
            return Err(format!("failed to tune to {}: {}", hz, r));
        }
        log::info!("rtlsdr now tuned to {} Hz", hz);
        Ok(())
    }

    fn set_gain(&mut self, gain: Gain) -> Result<(), String> {
        let dev = self.device()?;
        match gain {
            Gain::Auto => {
                let r = unsafe { rtlsdr_set_tuner_gain_mode(dev, 0) };
                if r < 0 {
                    return Err(format!("failed to set automatic gain: {}", r));
                }
                log::info!("rtlsdr now set to automatic gain");
            }
            Gain::Db(db) => {
                let r = unsafe { rtlsdr_set_tuner_gain_mode(dev, 1) };
                if r < 0 {
                    return Err(format!("failed to set manual gain: {}", r));
                }
                let requested = gain_tenths(db);
                let chosen = nearest(requested, &self.tuner_gains())?;
                if chosen != requested {
                    log::info!(
                        "rtlsdr setting gain to nearest value [{:.1}] to {:.1}",
                        chosen as f64 / 10.0,
                        db
                    );
                }
                let r = unsafe { rtlsdr_set_tuner_gain(dev, chosen as c_int) };
                if r < 0 {
                    return Err(format!("failed to set gain to {:.1}: {}", chosen as f64 / 10.0, r));
                }
                log::info!("rtlsdr gain now set to {:.1} dB", chosen as f64 / 10.0);
            }
        }
        Ok(())
    }

    fn set_antenna(&mut self, _antenna: &str) -> Result<(), String> {
        // Single antenna input.
        Ok(())
    }

    fn set_bandwidth(&mut self, khz: Option<u32>) -> Result<(), String> {
        let dev = self.device()?;
        let requested = resolve_bandwidth(khz, self.sample_rate) as i64;
        let candidates: Vec<i64> = BANDWIDTHS_KHZ.iter().map(|&k| k as i64 * 1000).collect();
        let chosen = nearest(requested, &candidates)?;
        if chosen != requested {
            log::info!("rtlsdr setting bandwidth to nearest value [{}] to {}", chosen, requested);
        }
        let r = unsafe { rtlsdr_set_tuner_bandwidth(dev, chosen as u32) };
        if r < 0 {
            return Err(format!("failed to set bandwidth to {}: {}", chosen, r));
        }
        log::info!("rtlsdr bandwidth now set to {}", chosen);
        Ok(())
    }

    fn list_antennas(&self) -> Vec<String> {
        vec!["RX".to_string()]
    }

    fn list_bandwidths(&self) -> Vec<u32> {
        BANDWIDTHS_KHZ.to_vec()
    }

    fn list_frequency_ranges(&self) -> Vec<Range> {
        vec![Range {
            from: 24.0,
            to: 1799.0,
        }]
    }

    fn list_gains(&self) -> Vec<f64> {
        self.tuner_gains()
            .into_iter()
            .map(|g| g as f64 / 10.0)
            .collect()
    }

    fn number_of_channels(&self) -> ChannelInfo {
        ChannelInfo { rx: 1, tx: 0 }
    }

    fn list_sample_rate_ranges(&self) -> Vec<Range> {
        vec![Range { from: 0.0, to: 8.0 }]
    }

    fn start_sampling(
        &mut self,
        arena: &Arc<Arena>,
        sink: &mut dyn FnMut(SampleBatch),
    ) -> Result<(), String> {
        let dev = self.device()?;
        if unsafe { rtlsdr_reset_buffer(dev) } < 0 {
            log::warn!("rtlsdr failed to reset buffers");
        }

        let mut buffers = PingPong::new(arena, READ_BYTES);
        log::info!("rtlsdr streaming started ({} S/s)", self.sample_rate);

        while self.running.load(Ordering::SeqCst) {
            let buffer = buffers.next_buffer().map_err(|e| e.to_string())?;
            let mut n_read: c_int = 0;
            let r = buffer
                .write(|bytes: &mut [u8]| unsafe {
                    rtlsdr_read_sync(
                        dev,
                        bytes.as_mut_ptr() as *mut c_void,
                        bytes.len() as c_int,
                        &mut n_read,
                    )
                })
                .map_err(|e| e.to_string())?;
            if r < 0 {
                log::error!("rtlsdr_read_sync error: {}", r);
                break;
            }
            let n = n_read.max(0) as usize;
            if n == 0 {
                continue;
            }

            // The dongle delivers offset-binary bytes; flip to two's complement.
            buffer
                .write(|bytes: &mut [u8]| {
                    for b in &mut bytes[..n] {
                        *b ^= 0x80;
                    }
                })
                .map_err(|e| e.to_string())?;

            sink(SampleBatch {
                buffer,
                samples: n / 2,
                full_scale: 128.0,
                format: StreamFormat::S8C,
            });
        }

        self.running.store(false, Ordering::SeqCst);
        log::info!("rtlsdr streaming stopped");
        Ok(())
    }

    fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }
}

// Copyright 2025-2026 CEMAXECUTER LLC

pub mod file;
pub mod select;

#[cfg(feature = "rtlsdr")]
pub mod rtlsdr;
#[cfg(feature = "soapysdr")]
pub mod soapysdr;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rad_arena::{Arena, ArenaError, Buffer};

/// Native sample layout delivered by a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// Interleaved signed 8-bit I/Q
    S8C,
    /// Interleaved signed 16-bit I/Q
    S16C,
}

impl StreamFormat {
    /// Bytes per I or Q value
    pub fn value_bytes(self) -> usize {
        match self {
            StreamFormat::S8C => 1,
            StreamFormat::S16C => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StreamFormat::S8C => "8-bit, signed, complex",
            StreamFormat::S16C => "16-bit, signed, complex",
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses the IQ file format names used on the command line.
impl FromStr for StreamFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ci8" | "cs8" | "s8" => Ok(StreamFormat::S8C),
            "ci16" | "cs16" | "s16" => Ok(StreamFormat::S16C),
            other => Err(format!("unknown sample format: {} (use ci8 or ci16)", other)),
        }
    }
}

/// How a receiver reports its data.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub format: StreamFormat,
    /// Largest magnitude a raw sample value can take
    pub full_scale: f64,
    /// Driver name, matched against the driver filter
    pub name: String,
    /// Operating mode, matched against the mode filter
    pub mode: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelInfo {
    pub rx: usize,
    pub tx: usize,
}

/// Inclusive range, in MHz when returned by the listing methods.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub from: f64,
    pub to: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gain {
    Auto,
    Db(f64),
}

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gain::Auto => f.write_str("auto"),
            Gain::Db(db) => write!(f, "{} dB", db),
        }
    }
}

impl FromStr for Gain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Gain::Auto);
        }
        s.parse::<f64>()
            .map(Gain::Db)
            .map_err(|e| format!("invalid gain '{}': {}", s, e))
    }
}

/// One block of raw samples handed from the receiver thread to its sink.
///
/// The batch holds one reference on `buffer`; a sink that needs the data
/// past its own return must clone the buffer.
#[derive(Debug)]
pub struct SampleBatch {
    pub buffer: Buffer,
    /// Complex samples in the buffer (the region may be larger)
    pub samples: usize,
    pub full_scale: f64,
    pub format: StreamFormat,
}

/// Receiver capability set. One implementation per supported hardware
/// family, selected at startup by [`select::find_matching`].
pub trait Receiver: Send {
    fn stream_info(&self) -> StreamInfo;

    /// Open the given device instance; `None` picks the first one.
    fn open(&mut self, device_id: Option<usize>) -> Result<(), String>;

    fn set_sample_rate(&mut self, rate: u32) -> Result<(), String>;

    fn set_frequency(&mut self, hz: u64) -> Result<(), String>;

    fn set_gain(&mut self, gain: Gain) -> Result<(), String>;

    fn set_antenna(&mut self, antenna: &str) -> Result<(), String>;

    /// Tuner bandwidth in kHz; `None` uses the sample rate.
    fn set_bandwidth(&mut self, khz: Option<u32>) -> Result<(), String>;

    fn list_antennas(&self) -> Vec<String>;

    /// Supported bandwidths, in kHz
    fn list_bandwidths(&self) -> Vec<u32>;

    /// Tunable ranges, in MHz
    fn list_frequency_ranges(&self) -> Vec<Range>;

    /// Supported gains, in dB
    fn list_gains(&self) -> Vec<f64>;

    fn number_of_channels(&self) -> ChannelInfo;

    /// Sample-rate ranges, in MHz
    fn list_sample_rate_ranges(&self) -> Vec<Range>;

    /// Stream samples into `sink` until the running flag is cleared, the
    /// source is exhausted, or an error occurs. Blocks the calling thread.
    fn start_sampling(
        &mut self,
        arena: &Arc<Arena>,
        sink: &mut dyn FnMut(SampleBatch),
    ) -> Result<(), String>;

    /// Flag polled by the sampling loop; clearing it stops sampling.
    /// `open` raises it and only a finished stream lowers it again, so a
    /// stop requested before `start_sampling` is honoured.
    fn running_flag(&self) -> Arc<AtomicBool>;

    fn stop_sampling(&self) {
        self.running_flag().store(false, Ordering::SeqCst);
    }

    fn name(&self) -> String {
        self.stream_info().name
    }

    fn mode(&self) -> String {
        self.stream_info().mode
    }

    fn format(&self) -> StreamFormat {
        self.stream_info().format
    }

    fn format_name(&self) -> &'static str {
        self.format().name()
    }
}

/// Two alternating sample buffers at the hardware boundary.
///
/// A slot is refilled only when nothing downstream still holds its buffer;
/// otherwise a fresh buffer replaces it so in-flight data is never
/// overwritten.
pub struct PingPong {
    arena: Arc<Arena>,
    slots: [Option<Buffer>; 2],
    next: usize,
    bytes: usize,
}

impl PingPong {
    pub fn new(arena: &Arc<Arena>, bytes: usize) -> Self {
        Self {
            arena: Arc::clone(arena),
            slots: [None, None],
            next: 0,
            bytes,
        }
    }

    /// Buffer to read the next block into. The returned guard is an extra
    /// reference on the slot's buffer.
    pub fn next_buffer(&mut self) -> Result<Buffer, ArenaError> {
        let idx = self.next;
        self.next ^= 1;

        let reusable = self.slots[idx]
            .as_ref()
            .map(|b| b.refcount() == 1 && b.extent_bytes() == self.bytes)
            .unwrap_or(false);
        if !reusable {
            self.slots[idx] = Some(self.arena.allocate(self.bytes, 1)?);
        }
        match &self.slots[idx] {
            Some(buf) => Ok(buf.clone()),
            None => self.arena.allocate(self.bytes, 1),
        }
    }
}

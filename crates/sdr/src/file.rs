// Copyright 2025-2026 CEMAXECUTER LLC

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rad_arena::Arena;

use crate::select::resolve_bandwidth;
use crate::{ChannelInfo, Gain, PingPong, Range, Receiver, SampleBatch, StreamFormat, StreamInfo};

/// Replays a raw interleaved IQ capture as if it were a receiver.
pub struct FileReceiver {
    path: PathBuf,
    format: StreamFormat,
    sample_rate: u32,
    frequency: u64,
    bandwidth: u32,
    /// Complex samples per block
    block_size: usize,
    /// Sleep between blocks so data arrives at `sample_rate`
    pace: bool,
    /// Rewind at end of file instead of stopping
    repeat: bool,
    opened: bool,
    running: Arc<AtomicBool>,
}

impl FileReceiver {
    pub fn new(path: impl Into<PathBuf>, format: StreamFormat) -> Self {
        Self {
            path: path.into(),
            format,
            sample_rate: 0,
            frequency: 0,
            bandwidth: 0,
            block_size: 65536,
            pace: false,
            repeat: false,
            opened: false,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_block_size(&mut self, size: usize) {
        self.block_size = size.max(1);
    }

    pub fn set_pacing(&mut self, pace: bool) {
        self.pace = pace;
    }

    pub fn set_repeat(&mut self, repeat: bool) {
        self.repeat = repeat;
    }

    fn full_scale(&self) -> f64 {
        match self.format {
            StreamFormat::S8C => 128.0,
            StreamFormat::S16C => 32768.0,
        }
    }
}

/// Fill `buf` as far as the reader allows; returns the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl Receiver for FileReceiver {
    fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            format: self.format,
            full_scale: self.full_scale(),
            name: "file".to_string(),
            mode: String::new(),
        }
    }

    fn open(&mut self, device_id: Option<usize>) -> Result<(), String> {
        if let Some(id) = device_id.filter(|&id| id > 0) {
            return Err(format!("file receiver has a single instance (asked for {})", id));
        }
        File::open(&self.path).map_err(|e| format!("failed to open {}: {}", self.path.display(), e))?;
        self.opened = true;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_sample_rate(&mut self, rate: u32) -> Result<(), String> {
        if rate == 0 {
            return Err("sample rate must be positive".to_string());
        }
        self.sample_rate = rate;
        log::info!("file sample rate is now {}", rate);
        Ok(())
    }

    fn set_frequency(&mut self, hz: u64) -> Result<(), String> {
        self.frequency = hz;
        log::info!("file now tuned to {} Hz", hz);
        Ok(())
    }

    fn set_gain(&mut self, gain: Gain) -> Result<(), String> {
        log::debug!("file receiver ignores gain ({})", gain);
        Ok(())
    }

    fn set_antenna(&mut self, _antenna: &str) -> Result<(), String> {
        Ok(())
    }

    fn set_bandwidth(&mut self, khz: Option<u32>) -> Result<(), String> {
        self.bandwidth = resolve_bandwidth(khz, self.sample_rate);
        Ok(())
    }

    fn list_antennas(&self) -> Vec<String> {
        vec!["file".to_string()]
    }

    fn list_bandwidths(&self) -> Vec<u32> {
        Vec::new()
    }

    fn list_frequency_ranges(&self) -> Vec<Range> {
        Vec::new()
    }

    fn list_gains(&self) -> Vec<f64> {
        Vec::new()
    }

    fn number_of_channels(&self) -> ChannelInfo {
        ChannelInfo { rx: 1, tx: 0 }
    }

    fn list_sample_rate_ranges(&self) -> Vec<Range> {
        Vec::new()
    }

    fn start_sampling(
        &mut self,
        arena: &Arc<Arena>,
        sink: &mut dyn FnMut(SampleBatch),
    ) -> Result<(), String> {
        if !self.opened {
            return Err(format!("{} has not been opened", self.path.display()));
        }
        let file = File::open(&self.path)
            .map_err(|e| format!("failed to open {}: {}", self.path.display(), e))?;
        let mut reader = BufReader::with_capacity(1024 * 1024, file);

        let frame_bytes = 2 * self.format.value_bytes();
        let mut buffers = PingPong::new(arena, self.block_size * frame_bytes);
        let full_scale = self.full_scale();

        log::info!(
            "reading IQ from {} ({}, {} Hz, {} MHz)",
            self.path.display(),
            self.format,
            self.sample_rate,
            self.frequency / 1_000_000
        );

        let started = Instant::now();
        let mut delivered: u64 = 0;
        // Set after a rewind until the next block yields samples.
        let mut rewound = false;

        while self.running.load(Ordering::SeqCst) {
            let buffer = buffers.next_buffer().map_err(|e| e.to_string())?;
            let n = buffer
                .write(|bytes: &mut [u8]| read_full(&mut reader, bytes))
                .map_err(|e| e.to_string())?
                .map_err(|e| format!("read error: {}", e))?;

            let samples = n / frame_bytes;
            if samples == 0 {
                if self.repeat && !rewound {
                    rewound = true;
                    reader
                        .seek(SeekFrom::Start(0))
                        .map_err(|e| format!("rewind failed: {}", e))?;
                    continue;
                }
                if rewound {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(format!("{} holds no complete samples", self.path.display()));
                }
                log::info!("end of file: {}", self.path.display());
                break;
            }
            rewound = false;

            if self.format == StreamFormat::S16C {
                // Captures are little-endian on disk.
                buffer
                    .write(|values: &mut [i16]| {
                        for v in &mut values[..samples * 2] {
                            *v = i16::from_le(*v);
                        }
                    })
                    .map_err(|e| e.to_string())?;
            }

            sink(SampleBatch {
                buffer,
                samples,
                full_scale,
                format: self.format,
            });
            delivered += samples as u64;

            if self.pace && self.sample_rate > 0 {
                let due = Duration::from_secs_f64(delivered as f64 / self.sample_rate as f64);
                if let Some(wait) = due.checked_sub(started.elapsed()) {
                    std::thread::sleep(wait);
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }
}

// Copyright 2025-2026 CEMAXECUTER LLC

//! Two-cadence magnitude averaging.
//!
//! FFT completions arrive in whatever order the worker pool finishes them,
//! so everything here is a plain sum: the result does not depend on arrival
//! order. Every `frames_per_update` frames the running mean goes out as an
//! update; every `updates_per_sample` updates the mean of those updates
//! goes out as a sample.

use std::sync::Arc;

use num_complex::Complex64;
use rad_arena::{Arena, ArenaError, Buffer};
use rad_protocol::FrameKind;

/// How many inputs make up each output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub frames_per_update: usize,
    pub updates_per_sample: usize,
}

impl Cadence {
    /// Derive frame counts from wall-clock periods. One frame spans
    /// `fft_size / sample_rate` seconds.
    pub fn from_periods(update_secs: f64, sample_secs: f64, sample_rate: u32, fft_size: usize) -> Self {
        let frames = (update_secs * sample_rate as f64 / fft_size as f64).round();
        let frames_per_update = if frames.is_finite() && frames >= 1.0 {
            frames as usize
        } else {
            1
        };

        let ratio = if update_secs > 0.0 {
            sample_secs / update_secs
        } else {
            1.0
        };
        let whole = ratio.floor();
        if (ratio - whole).abs() > 1e-9 {
            log::warn!(
                "sample period {}s is not a multiple of update period {}s; using {} updates per sample",
                sample_secs,
                update_secs,
                whole.max(1.0)
            );
        }
        let updates_per_sample = if whole >= 1.0 { whole as usize } else { 1 };

        Self {
            frames_per_update,
            updates_per_sample,
        }
    }
}

/// A finished spectrum ready for the protocol link. The buffer holds
/// `bins` `f32` magnitudes and its only reference.
#[derive(Debug)]
pub struct Emitted {
    pub kind: FrameKind,
    pub spectrum: Buffer,
}

pub struct SpectralAggregator {
    arena: Arc<Arena>,
    bins: usize,
    cadence: Cadence,
    update_sum: Vec<f64>,
    update_frames: usize,
    sample_sum: Vec<f64>,
    sample_updates: usize,
    rejected: u64,
}

impl SpectralAggregator {
    pub fn new(arena: &Arc<Arena>, bins: usize, cadence: Cadence) -> Self {
        log::info!(
            "aggregating {} frames per update, {} updates per sample",
            cadence.frames_per_update,
            cadence.updates_per_sample
        );
        Self {
            arena: Arc::clone(arena),
            bins,
            cadence,
            update_sum: vec![0.0; bins],
            update_frames: 0,
            sample_sum: vec![0.0; bins],
            sample_updates: 0,
            rejected: 0,
        }
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    /// Frames that could not be interpreted
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Fold one completed spectrum in. The input is released before this
    /// returns; any finished update/sample spectra are returned in order.
    ///
    /// Complex input (16-byte elements) contributes `|X[k]|`; `f64` or `f32`
    /// input is taken as magnitude already.
    pub fn consume(&mut self, spectrum: Buffer) -> Vec<Emitted> {
        let granularity = spectrum.granularity();
        let sum = &mut self.update_sum;
        let bins = self.bins;
        let folded: Result<bool, ArenaError> = match granularity {
            16 => spectrum.read(|x: &[Complex64]| accumulate(sum, bins, x.iter().map(|c| c.norm()))),
            8 => spectrum.read(|x: &[f64]| accumulate(sum, bins, x.iter().copied())),
            4 => spectrum.read(|x: &[f32]| accumulate(sum, bins, x.iter().map(|&v| v as f64))),
            other => {
                log::error!("cannot aggregate buffer with element size {}", other);
                Ok(false)
            }
        };
        drop(spectrum);

        match folded {
            Ok(true) => {}
            Ok(false) => {
                self.rejected += 1;
                return Vec::new();
            }
            Err(e) => {
                log::error!("cannot read spectrum: {}", e);
                self.rejected += 1;
                return Vec::new();
            }
        }

        self.update_frames += 1;
        let mut out = Vec::new();
        if self.update_frames < self.cadence.frames_per_update {
            return out;
        }

        let frames = self.update_frames as f64;
        let mean: Vec<f64> = self.update_sum.iter().map(|v| v / frames).collect();
        self.update_sum.fill(0.0);
        self.update_frames = 0;

        for (s, m) in self.sample_sum.iter_mut().zip(&mean) {
            *s += m;
        }
        self.sample_updates += 1;
        self.emit(&mut out, FrameKind::Update, &mean);

        if self.sample_updates >= self.cadence.updates_per_sample {
            let updates = self.sample_updates as f64;
            let mean: Vec<f64> = self.sample_sum.iter().map(|v| v / updates).collect();
            self.sample_sum.fill(0.0);
            self.sample_updates = 0;
            self.emit(&mut out, FrameKind::Sample, &mean);
        }
        out
    }

    fn emit(&self, out: &mut Vec<Emitted>, kind: FrameKind, mean: &[f64]) {
        let spectrum = match self.arena.allocate_for::<f32>(mean.len()) {
            Ok(b) => b,
            Err(e) => {
                log::error!("dropping {} spectrum: {}", kind, e);
                return;
            }
        };
        let written = spectrum.write(|dst: &mut [f32]| {
            for (d, &m) in dst.iter_mut().zip(mean) {
                *d = m as f32;
            }
        });
        match written {
            Ok(()) => out.push(Emitted { kind, spectrum }),
            Err(e) => log::error!("dropping {} spectrum: {}", kind, e),
        }
    }

    /// Discard partial accumulations at shutdown. Returns the number of
    /// frames that never made it into an update.
    pub fn flush(&mut self) -> usize {
        let dropped = self.update_frames;
        if dropped > 0 || self.sample_updates > 0 {
            log::info!(
                "flushing aggregator: {} frames and {} updates discarded",
                dropped,
                self.sample_updates
            );
        }
        self.update_sum.fill(0.0);
        self.update_frames = 0;
        self.sample_sum.fill(0.0);
        self.sample_updates = 0;
        dropped
    }
}

fn accumulate(sum: &mut [f64], bins: usize, values: impl ExactSizeIterator<Item = f64>) -> bool {
    if values.len() != bins {
        log::error!("spectrum has {} bins, expected {}", values.len(), bins);
        return false;
    }
    for (s, v) in sum.iter_mut().zip(values) {
        *s += v;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn magnitudes(arena: &Arc<Arena>, values: &[f32]) -> Buffer {
        let buf = arena.allocate_for::<f32>(values.len()).unwrap();
        buf.write(|v: &mut [f32]| v.copy_from_slice(values)).unwrap();
        buf
    }

    #[test]
    fn test_cadence_from_periods() {
        let c = Cadence::from_periods(5.0, 300.0, 2_048_000, 1024);
        assert_eq!(c.frames_per_update, 10_000);
        assert_eq!(c.updates_per_sample, 60);

        let c = Cadence::from_periods(2.0, 5.0, 1024, 1024);
        assert_eq!(c.frames_per_update, 2);
        assert_eq!(c.updates_per_sample, 2, "ratio 2.5 rounds down");

        let c = Cadence::from_periods(0.0001, 0.00001, 1000, 1024);
        assert_eq!(c.frames_per_update, 1);
        assert_eq!(c.updates_per_sample, 1);
    }

    #[test]
    fn test_update_then_sample() {
        let arena = Arena::new();
        let cadence = Cadence {
            frames_per_update: 2,
            updates_per_sample: 2,
        };
        let mut agg = SpectralAggregator::new(&arena, 3, cadence);

        assert!(agg.consume(magnitudes(&arena, &[1.0, 2.0, 3.0])).is_empty());
        let out = agg.consume(magnitudes(&arena, &[3.0, 2.0, 1.0]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FrameKind::Update);
        assert_eq!(out[0].spectrum.to_vec::<f32>().unwrap(), vec![2.0, 2.0, 2.0]);
        assert_eq!(out[0].spectrum.refcount(), 1);
        drop(out);

        agg.consume(magnitudes(&arena, &[4.0, 4.0, 4.0]));
        let out = agg.consume(magnitudes(&arena, &[4.0, 4.0, 4.0]));
        let kinds: Vec<FrameKind> = out.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![FrameKind::Update, FrameKind::Sample]);
        assert_eq!(out[1].spectrum.to_vec::<f32>().unwrap(), vec![3.0, 3.0, 3.0]);
        drop(out);

        assert_eq!(arena.live_buffers(), 0, "inputs are released on consume");
    }

    #[test]
    fn test_order_independent() {
        let arena = Arena::new();
        let cadence = Cadence {
            frames_per_update: 3,
            updates_per_sample: 1,
        };
        let frames = [[1.0f32, 0.5], [7.0, 2.5], [0.25, 9.0]];

        let mut forward = SpectralAggregator::new(&arena, 2, cadence);
        let mut backward = SpectralAggregator::new(&arena, 2, cadence);
        let mut a = Vec::new();
        let mut b = Vec::new();
        for f in &frames {
            a = forward.consume(magnitudes(&arena, f));
        }
        for f in frames.iter().rev() {
            b = backward.consume(magnitudes(&arena, f));
        }
        let a: Vec<f32> = a[0].spectrum.to_vec().unwrap();
        let b: Vec<f32> = b[0].spectrum.to_vec().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_complex_input_uses_magnitude() {
        let arena = Arena::new();
        let cadence = Cadence {
            frames_per_update: 1,
            updates_per_sample: 10,
        };
        let mut agg = SpectralAggregator::new(&arena, 2, cadence);
        let buf = arena.allocate_complex(2).unwrap();
        buf.write(|c: &mut [Complex64]| {
            c[0] = Complex64::new(3.0, 4.0);
            c[1] = Complex64::new(0.0, -2.0);
        })
        .unwrap();
        let out = agg.consume(buf);
        assert_eq!(out[0].spectrum.to_vec::<f32>().unwrap(), vec![5.0, 2.0]);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let arena = Arena::new();
        let cadence = Cadence {
            frames_per_update: 1,
            updates_per_sample: 1,
        };
        let mut agg = SpectralAggregator::new(&arena, 4, cadence);
        assert!(agg.consume(magnitudes(&arena, &[1.0, 2.0])).is_empty());
        assert_eq!(agg.rejected(), 1);
        assert_eq!(arena.live_buffers(), 0);
    }

    #[test]
    fn test_flush_discards_partial() {
        let arena = Arena::new();
        let cadence = Cadence {
            frames_per_update: 5,
            updates_per_sample: 1,
        };
        let mut agg = SpectralAggregator::new(&arena, 1, cadence);
        agg.consume(magnitudes(&arena, &[10.0]));
        agg.consume(magnitudes(&arena, &[10.0]));
        assert_eq!(agg.flush(), 2);
        for _ in 0..4 {
            assert!(agg.consume(magnitudes(&arena, &[1.0])).is_empty());
        }
        let out = agg.consume(magnitudes(&arena, &[1.0]));
        assert_eq!(out[0].spectrum.to_vec::<f32>().unwrap(), vec![1.0]);
    }
}

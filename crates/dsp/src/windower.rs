// Copyright 2025-2026 CEMAXECUTER LLC

use std::mem;
use std::sync::Arc;

use rad_arena::{Arena, Buffer};
use rad_sdr::{SampleBatch, StreamFormat};

use crate::fft::{FftPlan, FftTask};

/// Destination for built FFT tasks (normally a worker pool).
pub trait Dispatch {
    fn dispatch(&mut self, task: FftTask);
}

impl<F: FnMut(FftTask)> Dispatch for F {
    fn dispatch(&mut self, task: FftTask) {
        self(task)
    }
}

/// Re-slices the continuous sample stream into non-overlapping FFT
/// windows. Values that do not fill a window are carried to the next batch.
pub struct SampleWindower<D: Dispatch> {
    arena: Arc<Arena>,
    plan: Arc<FftPlan>,
    window: Option<Buffer>,
    dispatcher: D,
    /// Converted doubles left over from earlier batches (< one window)
    carry: Vec<f64>,
    work: Vec<f64>,
    dispatched: u64,
    dropped: u64,
}

impl<D: Dispatch> SampleWindower<D> {
    pub fn new(arena: &Arc<Arena>, plan: Arc<FftPlan>, window: Option<Buffer>, dispatcher: D) -> Self {
        let span = 2 * plan.size();
        Self {
            arena: Arc::clone(arena),
            plan,
            window,
            dispatcher,
            carry: Vec::with_capacity(span),
            work: Vec::new(),
            dispatched: 0,
            dropped: 0,
        }
    }

    /// Convert one receiver batch and window it. Returns the number of tasks
    /// dispatched.
    pub fn ingest(&mut self, batch: &SampleBatch) -> usize {
        let mut work = mem::take(&mut self.work);
        work.clear();

        let scale = 1.0 / batch.full_scale;
        let values = batch.samples * 2;
        let converted = match batch.format {
            StreamFormat::S8C => batch.buffer.read(|raw: &[i8]| {
                let n = values.min(raw.len());
                work.extend(raw[..n].iter().map(|&v| v as f64 * scale));
                n
            }),
            StreamFormat::S16C => batch.buffer.read(|raw: &[i16]| {
                let n = values.min(raw.len());
                work.extend(raw[..n].iter().map(|&v| v as f64 * scale));
                n
            }),
        };

        let built = match converted {
            Ok(n) => {
                if n < values {
                    log::warn!("batch claims {} values but buffer holds {}", values, n);
                }
                self.ingest_values(&work)
            }
            Err(e) => {
                log::error!("cannot read sample batch: {}", e);
                0
            }
        };
        self.work = work;
        built
    }

    /// Window already-converted interleaved I/Q doubles.
    pub fn ingest_values(&mut self, data: &[f64]) -> usize {
        let span = 2 * self.plan.size();
        if self.carry.len() + data.len() < span {
            self.carry.extend_from_slice(data);
            return 0;
        }

        let mut cursor = 0;
        let mut built = 0;
        while self.carry.len() + (data.len() - cursor) >= span {
            let task = if self.carry.is_empty() {
                let task = FftTask::new(&self.arena, &data[cursor..cursor + span]);
                cursor += span;
                task
            } else {
                let need = span - self.carry.len();
                let task = FftTask::new_split(&self.arena, &self.carry, &data[cursor..cursor + need]);
                cursor += need;
                self.carry.clear();
                task
            };

            match task {
                Ok(mut task) => {
                    task.set_plan(Arc::clone(&self.plan));
                    task.set_window(self.window.clone());
                    self.dispatcher.dispatch(task);
                    self.dispatched += 1;
                    built += 1;
                }
                Err(e) => {
                    log::error!("dropping FFT window: {}", e);
                    self.dropped += 1;
                }
            }
        }

        self.carry.extend_from_slice(&data[cursor..]);
        log::debug!("dispatched {} FFT tasks, carrying {} values", built, self.carry.len());
        built
    }

    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }

    /// Tasks handed to the dispatcher so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Windows lost to allocation failure
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft::rotate_by_pi;
    use num_complex::Complex64;

    fn windower(
        arena: &Arc<Arena>,
        fft_size: usize,
    ) -> SampleWindower<impl FnMut(FftTask)> {
        let plan = Arc::new(FftPlan::new(fft_size));
        SampleWindower::new(arena, plan, None, |task: FftTask| drop(task))
    }

    fn batch16(arena: &Arc<Arena>, samples: usize, fill: i16) -> SampleBatch {
        let buffer = arena.allocate_for::<i16>(samples * 2).unwrap();
        buffer.write(|v: &mut [i16]| v.fill(fill)).unwrap();
        SampleBatch {
            buffer,
            samples,
            full_scale: 32768.0,
            format: StreamFormat::S16C,
        }
    }

    #[test]
    fn test_small_first_batch_only_carries() {
        let arena = Arena::new();
        let mut w = windower(&arena, 16);
        assert_eq!(w.ingest_values(&[0.25; 10]), 0);
        assert_eq!(w.carry_len(), 10);
        assert_eq!(w.dispatched(), 0);
    }

    #[test]
    fn test_exact_fit_leaves_no_carry() {
        let arena = Arena::new();
        let mut w = windower(&arena, 8);
        assert_eq!(w.ingest_values(&[0.0; 32]), 2);
        assert_eq!(w.carry_len(), 0);
    }

    #[test]
    fn test_conservation_over_uneven_batches() {
        let arena = Arena::new();
        let fft_size = 32;
        let mut w = windower(&arena, fft_size);
        let mut total = 0usize;
        for len in [3usize, 70, 1, 64, 128, 5, 200, 63, 2, 90] {
            let values = vec![0.1; len * 2];
            w.ingest_values(&values);
            total += values.len();
            assert!(w.carry_len() < 2 * fft_size);
        }
        assert_eq!(
            w.dispatched() as usize * 2 * fft_size + w.carry_len(),
            total
        );
        assert_eq!(arena.live_buffers(), 0);
    }

    #[test]
    fn test_windows_preserve_sample_order() {
        let arena = Arena::new();
        let plan = Arc::new(FftPlan::new(4));
        let mut tasks = Vec::new();
        let mut w = SampleWindower::new(&arena, plan, None, |task: FftTask| tasks.push(task));
        let data: Vec<f64> = (0..20).map(f64::from).collect();
        w.ingest_values(&data[..5]);
        w.ingest_values(&data[5..]);
        assert_eq!(w.dispatched(), 2);
        assert_eq!(w.carry_len(), 4);
        drop(w);

        let mut recovered = Vec::new();
        for task in &tasks {
            let mut samples: Vec<Complex64> = task.input().to_vec().unwrap();
            rotate_by_pi(&mut samples);
            recovered.extend(samples.iter().flat_map(|c| [c.re, c.im]));
        }
        assert_eq!(recovered, data[..16].to_vec());
        drop(tasks);
        assert_eq!(arena.live_buffers(), 0);
    }

    #[test]
    fn test_ingest_scales_by_full_scale() {
        let arena = Arena::new();
        let plan = Arc::new(FftPlan::new(2));
        let mut inputs = Vec::new();
        let mut w = SampleWindower::new(&arena, plan, None, |task: FftTask| inputs.push(task));
        let batch = batch16(&arena, 2, 16384);
        assert_eq!(w.ingest(&batch), 1);
        drop(w);

        // Pair 1 is negated by the phase rotation; the transform of
        // [0.5+0.5j, -0.5-0.5j] puts everything in bin 1.
        let spectrum: Vec<Complex64> =
            inputs.pop().unwrap().run().unwrap().to_vec().unwrap();
        assert!(spectrum[0].norm() < 1e-12);
        assert!((spectrum[1].re - 1.0).abs() < 1e-12);
        assert!((spectrum[1].im - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_ingest_ci8_batch() {
        let arena = Arena::new();
        let plan = Arc::new(FftPlan::new(4));
        let mut tasks = Vec::new();
        let mut w = SampleWindower::new(&arena, plan, None, |task: FftTask| tasks.push(task));

        let raw: [i8; 10] = [64, -32, 127, -128, 0, 16, -64, 1, 99, 99];
        let buffer = arena.allocate_for::<i8>(raw.len()).unwrap();
        buffer.write(|v: &mut [i8]| v.copy_from_slice(&raw)).unwrap();
        let batch = SampleBatch {
            buffer,
            samples: 4,
            full_scale: 128.0,
            format: StreamFormat::S8C,
        };
        assert_eq!(w.ingest(&batch), 1);
        assert_eq!(w.carry_len(), 0);
        drop(w);

        let mut samples: Vec<Complex64> = tasks[0].input().to_vec().unwrap();
        rotate_by_pi(&mut samples);
        let recovered: Vec<f64> = samples.iter().flat_map(|c| [c.re, c.im]).collect();
        let expected: Vec<f64> = raw[..8].iter().map(|&v| v as f64 / 128.0).collect();
        assert_eq!(recovered, expected);
        assert_eq!(recovered[..2], [0.5, -0.25]);
        assert_eq!(recovered[3], -1.0);
    }

    #[test]
    fn test_three_batches_make_three_windows() {
        let arena = Arena::new();
        let mut w = windower(&arena, 1024);
        let mut tasks = 0;
        for samples in [1000, 1048, 1024] {
            let batch = batch16(&arena, samples, 100);
            tasks += w.ingest(&batch);
        }
        assert_eq!(tasks, 3);
        assert_eq!(w.carry_len(), 0);
    }

    #[test]
    fn test_allocation_failure_drops_window() {
        let arena = Arena::with_limit(100);
        let mut w = windower(&arena, 16);
        assert_eq!(w.ingest_values(&[0.0; 32]), 0);
        assert_eq!(w.dropped(), 1);
        assert_eq!(w.carry_len(), 0);
        assert_eq!(arena.live_buffers(), 0);
    }
}

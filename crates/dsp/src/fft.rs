use std::sync::Arc;

use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

use rad_arena::{Arena, ArenaError, Buffer};

#[derive(Debug, thiserror::Error)]
pub enum FftError {
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("no FFT plan set")]
    NoPlan,
    #[error("size mismatch: expected {expected} points, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("odd number of values ({0}) cannot form I/Q pairs")]
    OddLength(usize),
}

/// Forward transform plan, created once per run and shared by every task.
pub struct FftPlan {
    fft: Arc<dyn Fft<f64>>,
    size: usize,
}

impl FftPlan {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        Self { fft, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Unnormalised forward transform of `input` into `output`. `input` is
    /// used as workspace and left in an unspecified state.
    pub fn process(&self, input: &mut [Complex64], output: &mut [Complex64]) {
        let mut scratch = vec![Complex64::new(0.0, 0.0); self.fft.get_outofplace_scratch_len()];
        self.fft
            .process_outofplace_with_scratch(input, output, &mut scratch);
    }
}

/// Negate every odd-indexed complex sample. Equivalent to a shift of half
/// the transform size, so the transformed spectrum has DC in the centre bin.
pub fn rotate_by_pi(samples: &mut [Complex64]) {
    for s in samples.iter_mut().skip(1).step_by(2) {
        *s = -*s;
    }
}

/// One FFT window worth of work.
///
/// Owns a private arena copy of its input; the shared window buffer is
/// retained for the task's lifetime.
pub struct FftTask {
    arena: Arc<Arena>,
    input: Buffer,
    points: usize,
    plan: Option<Arc<FftPlan>>,
    window: Option<Buffer>,
}

impl FftTask {
    /// Build from one run of interleaved I/Q doubles.
    pub fn new(arena: &Arc<Arena>, data: &[f64]) -> Result<Self, FftError> {
        Self::new_split(arena, data, &[])
    }

    /// Build from a carried-over head plus the start of a new batch.
    pub fn new_split(arena: &Arc<Arena>, first: &[f64], second: &[f64]) -> Result<Self, FftError> {
        let total = first.len() + second.len();
        if total % 2 != 0 {
            return Err(FftError::OddLength(total));
        }
        let points = total / 2;
        let input = arena.allocate_complex(points)?;
        input.write(|d: &mut [f64]| {
            d[..first.len()].copy_from_slice(first);
            d[first.len()..total].copy_from_slice(second);
        })?;
        input.write(rotate_by_pi)?;
        Ok(Self {
            arena: Arc::clone(arena),
            input,
            points,
            plan: None,
            window: None,
        })
    }

    pub fn set_plan(&mut self, plan: Arc<FftPlan>) {
        self.plan = Some(plan);
    }

    /// Shared window coefficients (`points` doubles); `None` skips the taper.
    pub fn set_window(&mut self, window: Option<Buffer>) {
        self.window = window;
    }

    pub fn points(&self) -> usize {
        self.points
    }

    /// The rotated input copy.
    pub fn input(&self) -> &Buffer {
        &self.input
    }

    /// Run the task. Returns a fresh complex spectrum buffer; the private
    /// input is released on every path.
    pub fn run(self) -> Result<Buffer, FftError> {
        let plan = self.plan.ok_or(FftError::NoPlan)?;
        if plan.size() != self.points {
            return Err(FftError::SizeMismatch {
                expected: plan.size(),
                actual: self.points,
            });
        }

        if let Some(window) = &self.window {
            let coeffs: Vec<f64> = window.to_vec()?;
            if coeffs.len() != self.points {
                return Err(FftError::SizeMismatch {
                    expected: self.points,
                    actual: coeffs.len(),
                });
            }
            self.input.write(|samples: &mut [Complex64]| {
                for (s, &w) in samples.iter_mut().zip(&coeffs) {
                    *s *= w;
                }
            })?;
        }

        let output = self.arena.allocate_complex(self.points)?;
        self.input.write(|input: &mut [Complex64]| {
            output.write(|out: &mut [Complex64]| plan.process(input, out))
        })??;
        Ok(output)
    }
}

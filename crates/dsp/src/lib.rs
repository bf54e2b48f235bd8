// Copyright 2025-2026 CEMAXECUTER LLC

pub mod aggregator;
pub mod fft;
pub mod window;
pub mod windower;

pub use aggregator::{Cadence, Emitted, SpectralAggregator};
pub use fft::{FftError, FftPlan, FftTask};
pub use window::WindowType;
pub use windower::{Dispatch, SampleWindower};

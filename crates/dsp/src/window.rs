use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rad_arena::{Arena, ArenaError, Buffer};

/// Taper applied to every FFT window before the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowType {
    Rectangle,
    #[default]
    Hamming,
    Hanning,
    Blackman,
    Welch,
    Parzen,
}

const ALL: [WindowType; 6] = [
    WindowType::Rectangle,
    WindowType::Hamming,
    WindowType::Hanning,
    WindowType::Blackman,
    WindowType::Welch,
    WindowType::Parzen,
];

impl WindowType {
    pub fn name(self) -> &'static str {
        match self {
            WindowType::Rectangle => "rectangle",
            WindowType::Hamming => "hamming",
            WindowType::Hanning => "hanning",
            WindowType::Blackman => "blackman",
            WindowType::Welch => "welch",
            WindowType::Parzen => "parzen",
        }
    }

    /// Like `parse`, but an unrecognised value falls back to Hamming.
    pub fn parse_or_default(value: &str) -> WindowType {
        value.parse().unwrap_or_else(|e| {
            log::warn!("{}; using hamming", e);
            WindowType::Hamming
        })
    }

    /// Coefficient for bin `i` of an `n`-point window.
    pub fn coefficient(self, i: usize, n: usize) -> f64 {
        let i = i as f64;
        let n = n as f64;
        match self {
            WindowType::Rectangle => 1.0,
            WindowType::Hamming => 0.54 - 0.46 * (2.0 * PI * i / n).cos(),
            WindowType::Hanning => 0.54 - 0.5 * (2.0 * PI * i / n).cos(),
            WindowType::Blackman => {
                0.42 - 0.5 * (2.0 * PI * i / n).cos() + 0.08 * (4.0 * PI * i / n).cos()
            }
            WindowType::Welch => {
                let step = (2.0 * i - n) / (n + 1.0);
                1.0 - step * step
            }
            WindowType::Parzen => 1.0 - ((2.0 * i - n) / (n + 1.0)).abs(),
        }
    }

    pub fn coefficients(self, n: usize) -> Vec<f64> {
        (0..n).map(|i| self.coefficient(i, n)).collect()
    }

    /// Allocate the shared window buffer for a run: `n` doubles.
    pub fn to_buffer(self, arena: &Arc<Arena>, n: usize) -> Result<Buffer, ArenaError> {
        let buffer = arena.allocate_for::<f64>(n)?;
        buffer.write(|w: &mut [f64]| {
            for (i, v) in w.iter_mut().enumerate() {
                *v = self.coefficient(i, n);
            }
        })?;
        Ok(buffer)
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accepts a name (case-insensitive) or the index 0-5.
impl FromStr for WindowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(idx) = s.parse::<usize>() {
            return ALL
                .get(idx)
                .copied()
                .ok_or_else(|| format!("unknown window type index {}", idx));
        }
        ALL.iter()
            .copied()
            .find(|w| w.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown window type '{}'", s))
    }
}

// Copyright 2025-2026 CEMAXECUTER LLC

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, NativeEndian, WriteBytesExt};
use rad_arena::{Arena, ArenaError, Buffer};

/// Calibration profile file name inside the save directory.
pub const CALIBRATION_FILE: &str = "calib.dat";

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("need more data before calibration can be saved")]
    NoPasses,
    #[error("calibration is not running")]
    NotCalibrating,
    #[error("calibration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("calibration file {} holds no values", .0.display())]
    Empty(PathBuf),
    #[error("calibration has {expected} bins but frame has {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Background-noise calibration state.
///
/// While active, update spectra are summed in double precision. Ending the
/// run writes the per-bin mean as raw native-endian `f32` values. A loaded
/// profile (the bias) is subtracted from outgoing update spectra.
pub struct Calibration {
    arena: Arc<Arena>,
    path: PathBuf,
    active: bool,
    accumulator: Option<Buffer>,
    passes: u32,
    bias: Option<Buffer>,
}

impl Calibration {
    pub fn new(arena: &Arc<Arena>, path: impl Into<PathBuf>) -> Self {
        Self {
            arena: Arc::clone(arena),
            path: path.into(),
            active: false,
            accumulator: None,
            passes: 0,
            bias: None,
        }
    }

    /// Calibration stored as [`CALIBRATION_FILE`] in `dir`.
    pub fn in_dir(arena: &Arc<Arena>, dir: &Path) -> Self {
        Self::new(arena, dir.join(CALIBRATION_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    /// Number of bins in the loaded bias, if any.
    pub fn bias_len(&self) -> Option<usize> {
        self.bias.as_ref().map(|b| b.len_of::<f32>())
    }

    /// Start a fresh run, discarding any partial accumulation.
    pub fn begin(&mut self) {
        log::info!("beginning calibration");
        self.accumulator = None;
        self.passes = 0;
        self.active = true;
    }

    /// Add one update spectrum (`f32` magnitudes) to the running sum.
    pub fn fold(&mut self, frame: &Buffer) -> Result<(), CalibrationError> {
        if !self.active {
            return Err(CalibrationError::NotCalibrating);
        }
        let bins = frame.len_of::<f32>();
        if self.accumulator.is_none() {
            log::debug!("creating calibration storage ({} bins)", bins);
            self.accumulator = Some(self.arena.allocate_for::<f64>(bins)?);
        }
        let Some(acc) = &self.accumulator else {
            return Err(CalibrationError::NotCalibrating);
        };
        let expected = acc.len_of::<f64>();
        if expected != bins {
            return Err(CalibrationError::LengthMismatch {
                expected,
                actual: bins,
            });
        }

        frame.read(|src: &[f32]| {
            acc.write(|dst: &mut [f64]| {
                for (d, &s) in dst.iter_mut().zip(src) {
                    *d += s as f64;
                }
            })
        })??;
        self.passes += 1;
        log::debug!("appended calibration pass {}", self.passes);
        Ok(())
    }

    /// Finish the run: write sum / passes to the calibration file. Returns
    /// the number of bins written.
    ///
    /// With zero passes nothing is written and the run stays active. Once
    /// there is data the accumulator is released and the run ends even if
    /// the file cannot be written.
    pub fn end(&mut self) -> Result<usize, CalibrationError> {
        log::info!("stopping calibration");
        if !self.active {
            return Err(CalibrationError::NotCalibrating);
        }
        if self.passes == 0 {
            return Err(CalibrationError::NoPasses);
        }
        let Some(acc) = self.accumulator.take() else {
            return Err(CalibrationError::NoPasses);
        };
        let passes = self.passes as f64;
        self.active = false;
        self.passes = 0;

        let means = acc.read(|sum: &[f64]| {
            sum.iter()
                .map(|&v| (v / passes) as f32)
                .collect::<Vec<f32>>()
        })?;
        drop(acc);

        write_calibration_file(&self.path, &means).map_err(|source| CalibrationError::Io {
            path: self.path.clone(),
            source,
        })?;
        log::info!("saved {} calibration bins to {}", means.len(), self.path.display());
        Ok(means.len())
    }

    /// Load the calibration file into the bias buffer. Any failure leaves
    /// bias subtraction disabled. An active run is not affected.
    pub fn load(&mut self) -> Result<usize, CalibrationError> {
        self.bias = None;
        let values = read_calibration_file(&self.path).map_err(|source| CalibrationError::Io {
            path: self.path.clone(),
            source,
        })?;
        if values.is_empty() {
            return Err(CalibrationError::Empty(self.path.clone()));
        }

        let bias = self.arena.allocate_for::<f32>(values.len())?;
        bias.write(|dst: &mut [f32]| dst.copy_from_slice(&values))?;
        self.bias = Some(bias);
        log::info!("loaded {} calibration bins from {}", values.len(), self.path.display());
        Ok(values.len())
    }

    pub fn clear_bias(&mut self) {
        self.bias = None;
    }

    /// Subtract the bias from `frame` in place. Returns whether anything was
    /// subtracted; a bin-count mismatch leaves the frame untouched.
    pub fn apply_bias(&self, frame: &Buffer) -> Result<bool, CalibrationError> {
        let Some(bias) = &self.bias else {
            return Ok(false);
        };
        let expected = bias.len_of::<f32>();
        let actual = frame.len_of::<f32>();
        if expected != actual {
            return Err(CalibrationError::LengthMismatch { expected, actual });
        }
        bias.read(|b: &[f32]| {
            frame.write(|dst: &mut [f32]| {
                for (d, &v) in dst.iter_mut().zip(b) {
                    *d -= v;
                }
            })
        })??;
        Ok(true)
    }
}

/// Write `values` as raw native-endian `f32`, no header.
pub fn write_calibration_file(path: &Path, values: &[f32]) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    for &v in values {
        w.write_f32::<NativeEndian>(v)?;
    }
    w.flush()
}

/// Read a raw `f32` file. A trailing partial value is ignored with a warning.
pub fn read_calibration_file(path: &Path) -> io::Result<Vec<f32>> {
    let mut bytes = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
    let whole = bytes.len() / 4 * 4;
    if whole != bytes.len() {
        log::warn!(
            "calibration file {} has {} trailing bytes; ignoring them",
            path.display(),
            bytes.len() - whole
        );
    }
    let mut values = vec![0f32; whole / 4];
    NativeEndian::read_f32_into(&bytes[..whole], &mut values);
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(arena: &Arc<Arena>, values: &[f32]) -> Buffer {
        let buf = arena.allocate_for::<f32>(values.len()).unwrap();
        buf.write(|v: &mut [f32]| v.copy_from_slice(values)).unwrap();
        buf
    }

    #[test]
    fn test_end_without_passes_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::new();
        let mut cal = Calibration::in_dir(&arena, dir.path());

        assert!(matches!(cal.end(), Err(CalibrationError::NotCalibrating)));
        cal.begin();
        assert!(matches!(cal.end(), Err(CalibrationError::NoPasses)));
        assert!(cal.is_active(), "still calibrating after a failed end");
        assert!(!cal.path().exists());
    }

    #[test]
    fn test_constant_passes_average_to_value() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::new();
        let mut cal = Calibration::in_dir(&arena, dir.path());
        cal.begin();
        for _ in 0..4 {
            let f = frame(&arena, &[0.75, 2.5, 10.0]);
            cal.fold(&f).unwrap();
        }
        assert_eq!(cal.passes(), 4);
        assert_eq!(cal.end().unwrap(), 3);
        assert!(!cal.is_active());
        assert_eq!(arena.live_buffers(), 0, "accumulator released");

        let saved = read_calibration_file(cal.path()).unwrap();
        assert_eq!(saved, vec![0.75, 2.5, 10.0]);
        assert_eq!(std::fs::metadata(cal.path()).unwrap().len(), 12);
    }

    #[test]
    fn test_begin_resets_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::new();
        let mut cal = Calibration::in_dir(&arena, dir.path());
        cal.begin();
        cal.fold(&frame(&arena, &[100.0, 100.0])).unwrap();
        cal.begin();
        assert_eq!(cal.passes(), 0);
        cal.fold(&frame(&arena, &[1.0, 3.0])).unwrap();
        cal.end().unwrap();
        assert_eq!(read_calibration_file(cal.path()).unwrap(), vec![1.0, 3.0]);
    }

    #[test]
    fn test_fold_requires_active_and_matching_length() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::new();
        let mut cal = Calibration::in_dir(&arena, dir.path());
        assert!(matches!(
            cal.fold(&frame(&arena, &[1.0])),
            Err(CalibrationError::NotCalibrating)
        ));
        cal.begin();
        cal.fold(&frame(&arena, &[1.0, 2.0])).unwrap();
        assert!(matches!(
            cal.fold(&frame(&arena, &[1.0])),
            Err(CalibrationError::LengthMismatch { expected: 2, actual: 1 })
        ));
        assert_eq!(cal.passes(), 1);
    }

    #[test]
    fn test_unwritable_file_still_ends_run() {
        let arena = Arena::new();
        let mut cal = Calibration::new(&arena, "/nonexistent-dir/calib.dat");
        cal.begin();
        cal.fold(&frame(&arena, &[1.0])).unwrap();
        assert!(matches!(cal.end(), Err(CalibrationError::Io { .. })));
        assert!(!cal.is_active());
        assert_eq!(arena.live_buffers(), 0);
    }

    #[test]
    fn test_load_and_apply_bias() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::new();
        let mut cal = Calibration::in_dir(&arena, dir.path());
        write_calibration_file(cal.path(), &[1.0, 2.0, 3.0]).unwrap();

        assert_eq!(cal.load().unwrap(), 3);
        let f = frame(&arena, &[10.0, 10.0, 10.0]);
        assert!(cal.apply_bias(&f).unwrap());
        assert_eq!(f.to_vec::<f32>().unwrap(), vec![9.0, 8.0, 7.0]);

        let short = frame(&arena, &[10.0, 10.0]);
        assert!(matches!(
            cal.apply_bias(&short),
            Err(CalibrationError::LengthMismatch { expected: 3, actual: 2 })
        ));
        assert_eq!(short.to_vec::<f32>().unwrap(), vec![10.0, 10.0]);
    }

    #[test]
    fn test_load_missing_or_empty_disables_bias() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::new();
        let mut cal = Calibration::in_dir(&arena, dir.path());
        assert!(matches!(cal.load(), Err(CalibrationError::Io { .. })));
        assert_eq!(cal.bias_len(), None);

        std::fs::write(cal.path(), b"").unwrap();
        assert!(matches!(cal.load(), Err(CalibrationError::Empty(_))));

        let f = frame(&arena, &[5.0]);
        assert!(!cal.apply_bias(&f).unwrap());
    }

    #[test]
    fn test_short_file_keeps_whole_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CALIBRATION_FILE);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1.5f32.to_ne_bytes());
        bytes.extend_from_slice(&[0xde, 0xad]);
        std::fs::write(&path, bytes).unwrap();
        assert_eq!(read_calibration_file(&path).unwrap(), vec![1.5]);
    }

    #[test]
    fn test_load_does_not_cancel_active_run() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::new();
        let mut cal = Calibration::in_dir(&arena, dir.path());
        write_calibration_file(cal.path(), &[0.5]).unwrap();
        cal.begin();
        cal.fold(&frame(&arena, &[2.0])).unwrap();
        cal.load().unwrap();
        assert!(cal.is_active());
        assert_eq!(cal.passes(), 1);
    }
}

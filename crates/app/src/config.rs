// Copyright 2025-2026 CEMAXECUTER LLC

//! Command line and config file handling.
//!
//! Every tunable can come from the command line, a TOML file or the
//! built-in default, in that order of precedence.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use rad_dsp::WindowType;
use rad_sdr::select::{SourceFilter, TuningSettings};
use rad_sdr::{Gain, StreamFormat};
use serde::Deserialize;

pub const DEFAULT_FREQUENCY: u64 = 1_420_406_000;
pub const DEFAULT_SAMPLE_RATE: u32 = 2_048_000;
pub const DEFAULT_GAIN_DB: f64 = 49.0;
pub const DEFAULT_FFT_SIZE: usize = 1024;
pub const DEFAULT_UPDATE_SECS: f64 = 5.0;
pub const DEFAULT_SAMPLE_SECS: f64 = 300.0;
pub const DEFAULT_PORT: u16 = 5417;

#[derive(Parser, Debug)]
#[command(name = "rad")]
#[command(about = "Radio astronomy spectrum daemon")]
pub struct Cli {
    /// Antenna to receive on
    #[arg(long)]
    pub antenna: Option<String>,

    /// Filter bandwidth in kHz (-1 uses the sample rate)
    #[arg(short = 'b', long, allow_hyphen_values = true)]
    pub bandwidth: Option<i64>,

    /// Directory for the calibration file
    #[arg(short = 'd', long)]
    pub save_dir: Option<PathBuf>,

    /// Only use receivers whose driver name contains this
    #[arg(long)]
    pub filter_driver: Option<String>,

    /// Only use receivers whose mode contains this
    #[arg(long)]
    pub filter_mode: Option<String>,

    /// Device index (-1 for the first available)
    #[arg(long, allow_hyphen_values = true)]
    pub filter_id: Option<i64>,

    /// Center frequency in Hz
    #[arg(short = 'f', long)]
    pub frequency: Option<u64>,

    /// FFT size
    #[arg(short = 'n', long)]
    pub fft_num_bins: Option<usize>,

    /// Window: rectangle, hamming, hanning, blackman, welch, parzen (or 0-5)
    #[arg(short = 'w', long)]
    pub fft_window_type: Option<String>,

    /// Gain in dB, or "auto"
    #[arg(short = 'g', long)]
    pub gain: Option<String>,

    /// WebSocket listen port
    #[arg(short = 'p', long)]
    pub network_port: Option<u16>,

    /// Sample rate in samples per second
    #[arg(short = 's', long)]
    pub sample_rate: Option<u32>,

    /// Seconds between sample messages
    #[arg(short = 't', long)]
    pub time_between_samples: Option<f64>,

    /// Seconds between update messages
    #[arg(short = 'u', long)]
    pub time_between_updates: Option<f64>,

    /// Replay an IQ file instead of using hardware
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Sample format of --file: ci8 or ci16
    #[arg(long, default_value = "ci16")]
    pub format: String,

    /// Deliver --file samples at the configured sample rate
    #[arg(long)]
    pub pace: bool,

    /// Loop --file forever
    #[arg(long)]
    pub repeat: bool,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Print every device property and exit
    #[arg(long)]
    pub list_all: bool,

    #[arg(long)]
    pub list_antennas: bool,

    #[arg(long)]
    pub list_channels: bool,

    #[arg(long)]
    pub list_gains: bool,

    #[arg(long)]
    pub list_frequencies: bool,

    #[arg(long)]
    pub list_sample_rates: bool,

    #[arg(long)]
    pub list_bandwidths: bool,

    #[arg(long)]
    pub list_native_format: bool,
}

impl Cli {
    pub fn wants_listing(&self) -> bool {
        self.list_all
            || self.list_antennas
            || self.list_channels
            || self.list_gains
            || self.list_frequencies
            || self.list_sample_rates
            || self.list_bandwidths
            || self.list_native_format
    }
}

/// Either a number or a string in the config file (`gain = "auto"`,
/// `fft-window-type = 2`).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NumberOrText {
    Number(f64),
    Text(String),
}

impl NumberOrText {
    fn into_text(self) -> String {
        match self {
            NumberOrText::Number(n) => n.to_string(),
            NumberOrText::Text(s) => s,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RadioSection {
    pub filter_driver: Option<String>,
    pub filter_mode: Option<String>,
    pub filter_id: Option<i64>,
    pub antenna: Option<String>,
    pub bandwidth: Option<i64>,
    pub frequency: Option<u64>,
    pub gain: Option<NumberOrText>,
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DspSection {
    pub fft_window_type: Option<NumberOrText>,
    pub fft_size: Option<usize>,
    pub fft_update_time: Option<f64>,
    pub fft_sample_time: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NetworkSection {
    pub network_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FilesSection {
    pub save_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub radio: RadioSection,
    pub dsp: DspSection,
    pub network: NetworkSection,
    pub files: FilesSection,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::parse(&text).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }
}

/// Replay source chosen with `--file`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaySettings {
    pub path: PathBuf,
    pub format: StreamFormat,
    pub pace: bool,
    pub repeat: bool,
}

/// Fully resolved run configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub filter: SourceFilter,
    pub tuning: TuningSettings,
    pub fft_size: usize,
    pub window: WindowType,
    pub update_secs: f64,
    pub sample_secs: f64,
    pub port: u16,
    pub save_dir: PathBuf,
    pub replay: Option<ReplaySettings>,
}

impl Settings {
    /// Merge the command line over the config file named by `--config`.
    pub fn resolve(cli: &Cli) -> Result<Self, String> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    pub fn merge(cli: &Cli, file: FileConfig) -> Result<Self, String> {
        let radio = file.radio;
        let dsp = file.dsp;

        let filter_id = cli.filter_id.or(radio.filter_id).unwrap_or(-1);
        let filter = SourceFilter {
            driver: cli.filter_driver.clone().or(radio.filter_driver).unwrap_or_default(),
            mode: cli.filter_mode.clone().or(radio.filter_mode).unwrap_or_default(),
            id: usize::try_from(filter_id).ok(),
        };

        let gain = match cli.gain.clone().or(radio.gain.map(NumberOrText::into_text)) {
            Some(text) => text.parse::<Gain>()?,
            None => Gain::Db(DEFAULT_GAIN_DB),
        };

        let bandwidth = match cli.bandwidth.or(radio.bandwidth).unwrap_or(-1) {
            -1 => None,
            khz if khz > 0 => Some(
                u32::try_from(khz).map_err(|_| format!("bandwidth {} kHz is too large", khz))?,
            ),
            khz => return Err(format!("invalid bandwidth {} kHz (use -1 for the sample rate)", khz)),
        };

        let sample_rate = cli.sample_rate.or(radio.sample_rate).unwrap_or(DEFAULT_SAMPLE_RATE);
        if sample_rate == 0 {
            return Err("sample rate must be positive".to_string());
        }

        let tuning = TuningSettings {
            sample_rate,
            frequency: cli.frequency.or(radio.frequency).unwrap_or(DEFAULT_FREQUENCY),
            gain,
            antenna: cli.antenna.clone().or(radio.antenna).unwrap_or_else(|| "0".to_string()),
            bandwidth,
        };

        let fft_size = cli.fft_num_bins.or(dsp.fft_size).unwrap_or(DEFAULT_FFT_SIZE);
        if fft_size < 2 {
            return Err(format!("FFT size must be at least 2 (got {})", fft_size));
        }

        let window = match cli
            .fft_window_type
            .clone()
            .or(dsp.fft_window_type.map(NumberOrText::into_text))
        {
            Some(text) => WindowType::parse_or_default(&text),
            None => WindowType::default(),
        };

        let update_secs = cli
            .time_between_updates
            .or(dsp.fft_update_time)
            .unwrap_or(DEFAULT_UPDATE_SECS);
        if !(update_secs > 0.0) {
            return Err(format!("update period must be positive (got {})", update_secs));
        }
        let mut sample_secs = cli
            .time_between_samples
            .or(dsp.fft_sample_time)
            .unwrap_or(DEFAULT_SAMPLE_SECS);
        if !(sample_secs >= update_secs) {
            log::warn!(
                "sample period {}s is shorter than update period {}s; using {}s",
                sample_secs,
                update_secs,
                update_secs
            );
            sample_secs = update_secs;
        }

        let replay = match &cli.file {
            Some(path) => Some(ReplaySettings {
                path: path.clone(),
                format: cli.format.parse()?,
                pace: cli.pace,
                repeat: cli.repeat,
            }),
            None => None,
        };

        Ok(Self {
            filter,
            tuning,
            fft_size,
            window,
            update_secs,
            sample_secs,
            port: cli
                .network_port
                .or(file.network.network_port)
                .unwrap_or(DEFAULT_PORT),
            save_dir: cli
                .save_dir
                .clone()
                .or(file.files.save_dir)
                .unwrap_or_else(default_save_dir),
            replay,
        })
    }
}

/// Platform data directory for `rad`, or the working directory when the
/// platform has none.
pub fn default_save_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "rad")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["rad"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let s = Settings::merge(&cli(&[]), FileConfig::default()).unwrap();
        assert_eq!(s.tuning.frequency, 1_420_406_000);
        assert_eq!(s.tuning.sample_rate, 2_048_000);
        assert_eq!(s.tuning.gain, Gain::Db(49.0));
        assert_eq!(s.tuning.antenna, "0");
        assert_eq!(s.tuning.bandwidth, None);
        assert_eq!(s.fft_size, 1024);
        assert_eq!(s.window, WindowType::Hamming);
        assert_eq!(s.update_secs, 5.0);
        assert_eq!(s.sample_secs, 300.0);
        assert_eq!(s.port, 5417);
        assert_eq!(s.filter.driver, "");
        assert_eq!(s.filter.id, None);
        assert!(s.replay.is_none());
    }

    #[test]
    fn test_short_options() {
        let s = Settings::merge(
            &cli(&[
                "-f", "100000000", "-s", "1024000", "-g", "auto", "-b", "-1", "-n", "256", "-w",
                "blackman", "-p", "9000", "-u", "1", "-t", "10",
            ]),
            FileConfig::default(),
        )
        .unwrap();
        assert_eq!(s.tuning.frequency, 100_000_000);
        assert_eq!(s.tuning.sample_rate, 1_024_000);
        assert_eq!(s.tuning.gain, Gain::Auto);
        assert_eq!(s.tuning.bandwidth, None);
        assert_eq!(s.fft_size, 256);
        assert_eq!(s.window, WindowType::Blackman);
        assert_eq!(s.port, 9000);
        assert_eq!((s.update_secs, s.sample_secs), (1.0, 10.0));
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = FileConfig::parse(
            r#"
            [radio]
            filter-driver = "rtlsdr"
            frequency = 1000000
            gain = "auto"
            bandwidth = 500

            [dsp]
            fft-window-type = 4
            fft-size = 2048

            [network]
            network-port = 6000

            [files]
            save-dir = "/var/lib/rad"
            "#,
        )
        .unwrap();
        let s = Settings::merge(&cli(&["-n", "512", "--filter-id", "2"]), file).unwrap();
        assert_eq!(s.filter.driver, "rtlsdr");
        assert_eq!(s.filter.id, Some(2));
        assert_eq!(s.tuning.frequency, 1_000_000);
        assert_eq!(s.tuning.gain, Gain::Auto);
        assert_eq!(s.tuning.bandwidth, Some(500));
        assert_eq!(s.window, WindowType::Welch);
        assert_eq!(s.fft_size, 512);
        assert_eq!(s.port, 6000);
        assert_eq!(s.save_dir, PathBuf::from("/var/lib/rad"));
    }

    #[test]
    fn test_numeric_gain_in_file() {
        let file = FileConfig::parse("[radio]\ngain = 20.5\n").unwrap();
        let s = Settings::merge(&cli(&[]), file).unwrap();
        assert_eq!(s.tuning.gain, Gain::Db(20.5));
    }

    #[test]
    fn test_validation() {
        assert!(Settings::merge(&cli(&["-n", "1"]), FileConfig::default()).is_err());
        assert!(Settings::merge(&cli(&["-u", "0"]), FileConfig::default()).is_err());
        assert!(Settings::merge(&cli(&["-b", "-5"]), FileConfig::default()).is_err());
        assert!(Settings::merge(&cli(&["-g", "loud"]), FileConfig::default()).is_err());

        let s = Settings::merge(&cli(&["-u", "10", "-t", "2"]), FileConfig::default()).unwrap();
        assert_eq!(s.sample_secs, 10.0, "sample period clamped to one update");
    }

    #[test]
    fn test_unknown_window_falls_back() {
        let s = Settings::merge(&cli(&["-w", "kaiser"]), FileConfig::default()).unwrap();
        assert_eq!(s.window, WindowType::Hamming);
    }

    #[test]
    fn test_replay_settings() {
        let s = Settings::merge(
            &cli(&["--file", "capture.iq", "--format", "ci8", "--pace"]),
            FileConfig::default(),
        )
        .unwrap();
        let replay = s.replay.unwrap();
        assert_eq!(replay.format, StreamFormat::S8C);
        assert!(replay.pace);
        assert!(!replay.repeat);

        assert!(Settings::merge(&cli(&["--file", "x", "--format", "cf32"]), FileConfig::default()).is_err());
    }

    #[test]
    fn test_listing_flags() {
        assert!(!cli(&[]).wants_listing());
        assert!(cli(&["--list-gains"]).wants_listing());
    }

    #[test]
    fn test_config_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rad.toml");
        std::fs::write(&path, "[network]\nnetwork-port = 7000\n").unwrap();
        let mut c = cli(&[]);
        c.config = Some(path);
        assert_eq!(Settings::resolve(&c).unwrap().port, 7000);

        c.config = Some(dir.path().join("missing.toml"));
        assert!(Settings::resolve(&c).is_err());
    }
}

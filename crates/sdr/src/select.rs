// Copyright 2025-2026 CEMAXECUTER LLC

//! Receiver selection and initial tuning.

use crate::{Gain, Receiver, StreamInfo};

/// Which receiver to use: substring filters on driver name and mode plus an
/// optional device index.
#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
    pub driver: String,
    pub mode: String,
    pub id: Option<usize>,
}

impl SourceFilter {
    /// An empty filter, or a receiver that reports no name/mode, matches.
    pub fn matches(&self, info: &StreamInfo) -> bool {
        let driver_ok =
            self.driver.is_empty() || info.name.is_empty() || info.name.contains(&self.driver);
        let mode_ok = self.mode.is_empty() || info.mode.is_empty() || info.mode.contains(&self.mode);
        driver_ok && mode_ok
    }
}

/// Try each candidate in order; the first that matches the filter and opens
/// successfully wins. The rest are dropped.
pub fn find_matching(
    candidates: Vec<Box<dyn Receiver>>,
    filter: &SourceFilter,
) -> Result<Box<dyn Receiver>, String> {
    for mut rx in candidates {
        let info = rx.stream_info();
        if !filter.matches(&info) {
            log::debug!("skipping receiver {} (mode '{}')", info.name, info.mode);
            continue;
        }
        match rx.open(filter.id) {
            Ok(()) => {
                log::info!("using receiver {} ({})", info.name, info.format);
                return Ok(rx);
            }
            Err(e) => log::warn!("cannot open {}: {}", info.name, e),
        }
    }
    Err(format!(
        "cannot match device using {{driver: '{}', mode: '{}'}}",
        filter.driver, filter.mode
    ))
}

/// Settings applied to a freshly opened receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningSettings {
    pub sample_rate: u32,
    pub frequency: u64,
    pub gain: Gain,
    pub antenna: String,
    /// kHz; `None` tracks the sample rate
    pub bandwidth: Option<u32>,
}

/// Apply sample rate, frequency, gain, antenna, bandwidth in that order,
/// stopping at the first failure.
pub fn initialise(rx: &mut dyn Receiver, settings: &TuningSettings) -> Result<(), String> {
    rx.set_sample_rate(settings.sample_rate)?;
    rx.set_frequency(settings.frequency)?;
    rx.set_gain(settings.gain)?;
    rx.set_antenna(&settings.antenna)?;
    rx.set_bandwidth(settings.bandwidth)?;
    Ok(())
}

/// Candidate closest to `requested` (first wins on ties).
pub fn nearest(requested: i64, candidates: &[i64]) -> Result<i64, String> {
    let mut best = *candidates
        .first()
        .ok_or_else(|| "no candidate values to choose from".to_string())?;
    for &c in candidates {
        if (requested - c).abs() < (requested - best).abs() {
            best = c;
        }
    }
    Ok(best)
}

/// Gains are compared in integer tenths of a dB.
pub fn gain_tenths(db: f64) -> i64 {
    (db * 10.0).round() as i64
}

/// Requested bandwidth in Hz: `None` means the sample rate, and nothing
/// wider than the sample rate is ever requested.
pub fn resolve_bandwidth(khz: Option<u32>, sample_rate: u32) -> u32 {
    match khz {
        None => sample_rate,
        Some(k) => k.saturating_mul(1000).min(sample_rate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelInfo, Range, SampleBatch, StreamFormat};
    use rad_arena::Arena;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    struct MockReceiver {
        name: &'static str,
        mode: &'static str,
        opens: bool,
        calls: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
        running: Arc<AtomicBool>,
    }

    impl MockReceiver {
        fn new(name: &'static str, mode: &'static str, opens: bool) -> Self {
            Self {
                name,
                mode,
                opens,
                calls: Arc::new(Mutex::new(Vec::new())),
                fail_on: None,
                running: Arc::new(AtomicBool::new(false)),
            }
        }

        fn record(&self, call: &'static str) -> Result<(), String> {
            self.calls.lock().unwrap().push(call.to_string());
            if self.fail_on == Some(call) {
                Err(format!("{} failed", call))
            } else {
                Ok(())
            }
        }
    }

    impl Receiver for MockReceiver {
        fn stream_info(&self) -> StreamInfo {
            StreamInfo {
                format: StreamFormat::S8C,
                full_scale: 128.0,
                name: self.name.to_string(),
                mode: self.mode.to_string(),
            }
        }
        fn open(&mut self, _id: Option<usize>) -> Result<(), String> {
            if self.opens {
                Ok(())
            } else {
                Err("no device".to_string())
            }
        }
        fn set_sample_rate(&mut self, _rate: u32) -> Result<(), String> {
            self.record("rate")
        }
        fn set_frequency(&mut self, _hz: u64) -> Result<(), String> {
            self.record("frequency")
        }
        fn set_gain(&mut self, _gain: Gain) -> Result<(), String> {
            self.record("gain")
        }
        fn set_antenna(&mut self, _antenna: &str) -> Result<(), String> {
            self.record("antenna")
        }
        fn set_bandwidth(&mut self, _khz: Option<u32>) -> Result<(), String> {
            self.record("bandwidth")
        }
        fn list_antennas(&self) -> Vec<String> {
            vec!["RX".to_string()]
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
            _arena: &Arc<Arena>,
            _sink: &mut dyn FnMut(SampleBatch),
        ) -> Result<(), String> {
            Ok(())
        }
        fn running_flag(&self) -> Arc<AtomicBool> {
            self.running.clone()
        }
    }

    fn settings() -> TuningSettings {
        TuningSettings {
            sample_rate: 2_048_000,
            frequency: 1_420_406_000,
            gain: Gain::Db(49.0),
            antenna: "0".to_string(),
            bandwidth: None,
        }
    }

    #[test]
    fn test_filter_substring_match() {
        let f = SourceFilter {
            driver: "rtl".to_string(),
            ..Default::default()
        };
        let info = MockReceiver::new("rtlsdr", "", true).stream_info();
        assert!(f.matches(&info));
        let other = MockReceiver::new("file", "", true).stream_info();
        assert!(!f.matches(&other));
        assert!(SourceFilter::default().matches(&other));
    }

    #[test]
    fn test_first_openable_match_wins() {
        let candidates: Vec<Box<dyn Receiver>> = vec![
            Box::new(MockReceiver::new("soapy", "lime", true)),
            Box::new(MockReceiver::new("soapy", "rtl", false)),
            Box::new(MockReceiver::new("soapy", "rtl2", true)),
        ];
        let filter = SourceFilter {
            driver: "soapy".to_string(),
            mode: "rtl".to_string(),
            id: None,
        };
        let rx = find_matching(candidates, &filter).unwrap();
        assert_eq!(rx.mode(), "rtl2");
    }

    #[test]
    fn test_no_match_is_error() {
        let candidates: Vec<Box<dyn Receiver>> = vec![Box::new(MockReceiver::new("file", "", true))];
        let filter = SourceFilter {
            driver: "hackrf".to_string(),
            ..Default::default()
        };
        let Err(err) = find_matching(candidates, &filter) else {
            panic!("expected no receiver to match");
        };
        assert!(err.contains("hackrf"));
    }

    #[test]
    fn test_initialise_order_and_abort() {
        let mut rx = MockReceiver::new("mock", "", true);
        let calls = rx.calls.clone();
        initialise(&mut rx, &settings()).unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["rate", "frequency", "gain", "antenna", "bandwidth"]
        );

        let mut rx = MockReceiver::new("mock", "", true);
        rx.fail_on = Some("gain");
        let calls = rx.calls.clone();
        assert!(initialise(&mut rx, &settings()).is_err());
        assert_eq!(*calls.lock().unwrap(), vec!["rate", "frequency", "gain"]);
    }

    #[test]
    fn test_nearest_value() {
        let gains = [0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328, 338, 364, 372, 386, 402, 421, 434, 439, 445, 480, 496];
        assert_eq!(nearest(gain_tenths(49.0), &gains), Ok(496));
        assert_eq!(nearest(gain_tenths(20.0), &gains), Ok(197));
        assert_eq!(nearest(5, &[0, 10]), Ok(0), "ties go to the first candidate");
        assert!(nearest(1, &[]).is_err());
    }

    #[test]
    fn test_resolve_bandwidth() {
        assert_eq!(resolve_bandwidth(None, 2_048_000), 2_048_000);
        assert_eq!(resolve_bandwidth(Some(1500), 2_048_000), 1_500_000);
        assert_eq!(resolve_bandwidth(Some(5000), 2_048_000), 2_048_000);
    }
}

mod config;
mod pipeline;

use clap::Parser;
use rad_sdr::file::FileReceiver;
use rad_sdr::select::{find_matching, initialise};
use rad_sdr::Receiver;

use crate::config::{Cli, Settings};

/// Receivers to try, in order. A replay file replaces all hardware.
fn candidates(settings: &Settings) -> Vec<Box<dyn Receiver>> {
    let mut out: Vec<Box<dyn Receiver>> = Vec::new();
    if let Some(replay) = &settings.replay {
        let mut rx = FileReceiver::new(&replay.path, replay.format);
        rx.set_pacing(replay.pace);
        rx.set_repeat(replay.repeat);
        out.push(Box::new(rx));
        return out;
    }

    #[cfg(feature = "soapysdr")]
    for rx in rad_sdr::soapysdr::candidates() {
        out.push(Box::new(rx));
    }
    #[cfg(feature = "rtlsdr")]
    out.push(Box::new(rad_sdr::rtlsdr::RtlSdrReceiver::new()));

    out
}

fn print_ranges(label: &str, ranges: &[rad_sdr::Range]) {
    println!("{}:", label);
    for r in ranges {
        println!("  {:.3} - {:.3} MHz", r.from, r.to);
    }
}

fn print_listing(cli: &Cli, rx: &dyn Receiver) {
    let all = cli.list_all;
    let info = rx.stream_info();
    println!("receiver: {} ({})", info.name, info.mode);

    if all || cli.list_native_format {
        println!("native format: {}", info.format.name());
    }
    if all || cli.list_channels {
        let ch = rx.number_of_channels();
        println!("channels: {} rx, {} tx", ch.rx, ch.tx);
    }
    if all || cli.list_antennas {
        println!("antennas: {}", rx.list_antennas().join(", "));
    }
    if all || cli.list_gains {
        let gains: Vec<String> = rx.list_gains().iter().map(|g| format!("{:.1}", g)).collect();
        println!("gains (dB): {}", gains.join(", "));
    }
    if all || cli.list_bandwidths {
        let bws: Vec<String> = rx.list_bandwidths().iter().map(u32::to_string).collect();
        println!("bandwidths (kHz): {}", bws.join(", "));
    }
    if all || cli.list_frequencies {
        print_ranges("frequency ranges", &rx.list_frequency_ranges());
    }
    if all || cli.list_sample_rates {
        print_ranges("sample rate ranges", &rx.list_sample_rate_ranges());
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let settings = Settings::resolve(cli)?;
    let mut rx = find_matching(candidates(&settings), &settings.filter)?;

    if cli.wants_listing() {
        print_listing(cli, &*rx);
        return Ok(());
    }

    initialise(&mut *rx, &settings.tuning)?;
    log::info!(
        "tuned to {} Hz at {} samples/s, gain {}",
        settings.tuning.frequency,
        settings.tuning.sample_rate,
        settings.tuning.gain
    );

    let summary = pipeline::run(&mut *rx, &settings)?;
    if summary.dropped_windows > 0 || summary.failed_transforms > 0 {
        log::warn!(
            "{} windows dropped, {} transforms failed",
            summary.dropped_windows,
            summary.failed_transforms
        );
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(&cli) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

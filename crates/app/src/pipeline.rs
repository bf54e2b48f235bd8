// Copyright 2025-2026 CEMAXECUTER LLC

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver as SpectrumReceiver};
use rad_arena::{Arena, Buffer};
use rad_dsp::{Cadence, FftPlan, FftTask, SampleWindower, SpectralAggregator};
use rad_output::{Calibration, NetworkServer, ProtocolLink};
use rad_protocol::FrameKind;
use rad_sdr::{Receiver, SampleBatch};
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::config::Settings;

/// Counters reported when a run ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: u64,
    pub windows: u64,
    pub dropped_windows: u64,
    pub failed_transforms: u64,
    pub updates: u64,
    pub samples: u64,
    /// Frames still waiting for an update when the stream stopped
    pub discarded_frames: usize,
}

#[derive(Debug, Default)]
struct AggregateSummary {
    updates: u64,
    samples: u64,
    discarded_frames: usize,
}

/// Aggregation thread body: fold completed spectra until every worker has
/// hung up, then flush. Finished spectra are handed to the network thread.
fn aggregate(
    mut aggregator: SpectralAggregator,
    spectra: SpectrumReceiver<Buffer>,
    frames: UnboundedSender<(FrameKind, Buffer)>,
) -> AggregateSummary {
    let mut summary = AggregateSummary::default();
    for spectrum in spectra.iter() {
        for emitted in aggregator.consume(spectrum) {
            match emitted.kind {
                FrameKind::Update => summary.updates += 1,
                FrameKind::Sample => summary.samples += 1,
            }
            if frames.send((emitted.kind, emitted.spectrum)).is_err() {
                log::debug!("network thread gone, dropping {} spectrum", emitted.kind);
            }
        }
    }
    summary.discarded_frames = aggregator.flush();
    if aggregator.rejected() > 0 {
        log::warn!("{} spectra could not be aggregated", aggregator.rejected());
    }
    summary
}

/// Run the pipeline on an opened and tuned receiver until it stops, either
/// at end of stream or because its running flag was cleared (Ctrl-C).
///
/// Shutdown is ordered by channel closure: the receiver returns, the
/// windower and its task sender drop, the pool drains, the aggregator
/// flushes and drops the frame sender, and the network thread closes every
/// peer.
pub fn run(rx: &mut dyn Receiver, settings: &Settings) -> Result<RunSummary, String> {
    let arena = Arena::new();
    let info = rx.stream_info();
    log::info!(
        "{} ({}): {} point FFT, {} window, {} Hz",
        info.name,
        info.format.name(),
        settings.fft_size,
        settings.window,
        settings.tuning.sample_rate
    );

    if let Err(e) = fs::create_dir_all(&settings.save_dir) {
        log::warn!("cannot create save dir {}: {}", settings.save_dir.display(), e);
    }
    let link = Arc::new(ProtocolLink::new(Calibration::in_dir(&arena, &settings.save_dir)));
    if let Err(e) = link.load_calibration() {
        log::info!("no calibration applied: {}", e);
    }

    let plan = Arc::new(FftPlan::new(settings.fft_size));
    let window = settings
        .window
        .to_buffer(&arena, settings.fft_size)
        .map_err(|e| format!("failed to allocate window: {}", e))?;

    let cadence = Cadence::from_periods(
        settings.update_secs,
        settings.sample_secs,
        settings.tuning.sample_rate,
        settings.fft_size,
    );
    let aggregator = SpectralAggregator::new(&arena, settings.fft_size, cadence);

    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (server, addr) =
        NetworkServer::new(settings.port, Arc::clone(&link)).spawn(frame_rx, rx.running_flag())?;
    log::debug!("network thread serving {}", addr);

    let (spectrum_tx, spectrum_rx) = channel::unbounded::<Buffer>();
    let aggregator_thread = thread::Builder::new()
        .name("aggregator".into())
        .spawn(move || aggregate(aggregator, spectrum_rx, frame_tx))
        .map_err(|e| format!("failed to spawn aggregator thread: {}", e))?;

    let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("fft-{}", i))
            .build()
            .map_err(|e| format!("failed to create FFT worker pool: {}", e))?,
    );
    log::info!("running FFTs on {} worker threads", workers);

    let failed = Arc::new(AtomicU64::new(0));
    let dispatch = {
        let pool = Arc::clone(&pool);
        let failed = Arc::clone(&failed);
        move |task: FftTask| {
            let tx = spectrum_tx.clone();
            let failed = Arc::clone(&failed);
            pool.spawn(move || match task.run() {
                Ok(spectrum) => {
                    let _ = tx.send(spectrum);
                }
                Err(e) => {
                    log::error!("FFT task failed: {}", e);
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    };

    let mut windower = SampleWindower::new(&arena, plan, Some(window), dispatch);
    let mut batches = 0u64;
    let sampled = rx.start_sampling(&arena, &mut |batch: SampleBatch| {
        batches += 1;
        windower.ingest(&batch);
    });
    rx.stop_sampling();

    let windows = windower.dispatched();
    let dropped_windows = windower.dropped();
    drop(windower);

    let aggregated = aggregator_thread.join();
    drop(pool);
    if server.join().is_err() {
        log::error!("network thread panicked");
    }
    let aggregated = aggregated.map_err(|_| "aggregator thread panicked".to_string())?;
    sampled?;

    let summary = RunSummary {
        batches,
        windows,
        dropped_windows,
        failed_transforms: failed.load(Ordering::Relaxed),
        updates: aggregated.updates,
        samples: aggregated.samples,
        discarded_frames: aggregated.discarded_frames,
    };
    log::info!(
        "stream ended: {} batches, {} windows, {} updates, {} samples, {} frames discarded",
        summary.batches,
        summary.windows,
        summary.updates,
        summary.samples,
        summary.discarded_frames
    );
    if arena.live_buffers() > 0 {
        log::debug!("{} arena buffers still held at shutdown", arena.live_buffers());
    }
    Ok(summary)
}

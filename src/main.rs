use std::{
    error::Error,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use crossbeam_channel::bounded;
use spike_slurper::{
    args::{convert_filter, Args},
    capture::{acquire, sample_queue, CaptureWriter, SimulatedRadio},
    config::{secs, StationConfig, TransportKind},
    detect::{DetectorSettings, SegmentDetector},
    exfil::{MountedStore, Transport, UploadSettings, Uploader},
    sftp::SftpStore,
    shutdown::{StopSource, Worker},
    spool::DirSpool,
};
use tracing::{error, info, warn};

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let config = StationConfig::load(&args.config)?;
    info!("App Name: {}", config.app_name);
    info!("Site Name: {}", config.site_name);
    match config.remote.transport {
        TransportKind::Sftp => info!("Host Server: {}:{}", config.remote.host, config.remote.port),
        TransportKind::Mount => info!("Collector Mount: {}", config.remote.root.display()),
    }

    let captures = Arc::new(DirSpool::create(&config.capture_dir)?);
    let segments = Arc::new(DirSpool::create(&config.segment_dir)?);

    // The only failure we don't ride out
    let radio = SimulatedRadio::new(
        config.radio.sample_rate,
        config.record_time,
        args.noise,
        args.impulse_probability,
    )
    .map_err(|e| {
        error!("{}", e);
        e
    })?;
    info!(
        sample_rate = config.radio.sample_rate,
        center_freq = config.radio.center_freq,
        gain = config.radio.gain,
        "Radio ready"
    );

    // Shutdown flag that is set true when ctrl-c signal caught
    static INTERRUPTED: AtomicBool = AtomicBool::new(false);
    let (signal_tx, signal_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, exiting immediately");
            process::exit(1);
        }
        let _ = signal_tx.try_send(());
    })?;

    let stop = StopSource::new();
    let (producer, queue) = sample_queue(config.radio.queue_capacity);

    let writer = CaptureWriter::new(
        &config.site_name,
        captures.clone(),
        secs(config.radio.fetch_timeout),
    );
    let detector = SegmentDetector::new(
        DetectorSettings::from_config(&config),
        captures,
        segments.clone(),
    );
    let transport: Arc<dyn Transport> = match config.remote.transport {
        TransportKind::Sftp => Arc::new(SftpStore::from_config(&config.remote)),
        TransportKind::Mount => Arc::new(MountedStore::new(
            &config.remote.root,
            &config.remote.username,
        )),
    };
    let uploader = Uploader::new(UploadSettings::from_config(&config), segments, transport);

    // Downstream first so nothing is waiting on a stage that isn't there yet
    let token = stop.token();
    let detector = Worker::spawn("detector", move || detector.run(token))?;
    let token = stop.token();
    let uploader = Worker::spawn("uploader", move || uploader.run(token))?;
    // No token: the writer runs until acquisition drops the producer
    let writer = Worker::spawn("writer", move || {
        writer.run(queue);
    })?;
    let token = stop.token();
    let acquisition = Worker::spawn("acquisition", move || {
        acquire(Box::new(radio), producer, token);
    })?;
    info!("Starting recording... Press Ctrl+C to stop");

    // Wait for ctrl-c
    let _ = signal_rx.recv();
    info!("Stopping recording...");
    stop.stop();

    let timeout = secs(config.shutdown_timeout);
    let mut clean = true;
    // Acquisition first, so the writer can drain what's left in the queue
    for worker in [acquisition, writer, detector, uploader] {
        let name = worker.name().to_owned();
        if !worker.join_timeout(timeout) {
            clean = false;
            warn!("{} did not shut down cleanly", name);
        }
    }
    if clean {
        info!("Shutdown complete");
    }
    Ok(())
}

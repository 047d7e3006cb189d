//! Field-station pipeline for an impulsive-event receiver.
//!
//! acquire -> capture files -> detect -> segment files -> upload
//!
//! Stages only meet through the bounded acquisition queue and the two
//! [`spool::Spool`]s, so each can fail, restart or fall behind on its own.

pub mod args;
pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod exfil;
pub mod naming;
pub mod sample;
pub mod sftp;
pub mod shutdown;
pub mod spool;

pub use capture::{sample_queue, CaptureWriter, Radio, SimulatedRadio};
pub use config::StationConfig;
pub use detect::{find_peaks, Peak, PeakRecord, SegmentDetector};
pub use exfil::{MountedStore, Transport, Uploader};
pub use naming::CaptureTime;
pub use sample::SampleBuffer;
pub use sftp::SftpStore;
pub use spool::{DirSpool, MemorySpool, Spool};

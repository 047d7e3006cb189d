//! This module is responsible for exfilling segment files to the collector

// Each cycle: connect (with a bounded number of attempts), upload the oldest
// batch of segment files one by one, deleting each after it lands, and close
// the session no matter how the batch went. The first failed upload ends the
// batch; whatever is left waits for the next cycle.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use filetime::FileTime;
use tracing::{debug, error, info, warn};

use crate::{
    config::{secs, StationConfig},
    error::{ConnectError, UploadError},
    naming::PARTIAL_EXT,
    shutdown::StopToken,
    spool::Spool,
};

/// Something that can open sessions with the collector
pub trait Transport: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Session>, ConnectError>;
}

/// An open session with the collector
pub trait Session {
    /// Store `contents` at `remote_path` (relative to the collector root)
    fn put(
        &mut self,
        remote_path: &str,
        contents: &[u8],
        mtime: Option<SystemTime>,
    ) -> Result<(), UploadError>;
    fn close(&mut self) -> Result<(), UploadError>;
}

/// The collector's share mounted on the station (NFS, sshfs, ...)
#[derive(Debug, Clone)]
pub struct MountedStore {
    root: PathBuf,
    user: String,
}

impl MountedStore {
    pub fn new<P: AsRef<Path>>(root: P, user: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            user: user.to_owned(),
        }
    }
}

impl Transport for MountedStore {
    fn connect(&self) -> Result<Box<dyn Session>, ConnectError> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(Box::new(MountedSession {
                root: self.root.clone(),
            })),
            Ok(_) => Err(ConnectError::Protocol(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(ConnectError::Authentication {
                    user: self.user.clone(),
                })
            }
            Err(e) => Err(ConnectError::Transport(e)),
        }
    }
}

struct MountedSession {
    root: PathBuf,
}

impl Session for MountedSession {
    fn put(
        &mut self,
        remote_path: &str,
        contents: &[u8],
        mtime: Option<SystemTime>,
    ) -> Result<(), UploadError> {
        let dest = self.root.join(remote_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        // Land under a temporary name so the collector never sees half a file
        let partial = partial_path(&dest);
        let mut file = fs::File::create(&partial)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        if let Some(mtime) = mtime {
            filetime::set_file_mtime(&partial, FileTime::from_system_time(mtime))?;
        }
        fs::rename(&partial, &dest)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), UploadError> {
        Ok(())
    }
}

/// Where `dest` is written before being renamed into place
pub(crate) fn partial_path(dest: &Path) -> PathBuf {
    let mut partial = dest.as_os_str().to_owned();
    partial.push(".");
    partial.push(PARTIAL_EXT);
    PathBuf::from(partial)
}

/// Uploader knobs taken from the station config
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub site: String,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    pub batch_size: usize,
    pub cycle_delay: Duration,
    pub error_backoff: Duration,
}

impl UploadSettings {
    pub fn from_config(config: &StationConfig) -> Self {
        Self {
            site: config.site_name.clone(),
            connect_attempts: config.remote.connect_attempts,
            retry_delay: secs(config.remote.retry_delay),
            batch_size: config.remote.batch_size,
            cycle_delay: secs(config.remote.cycle_delay),
            error_backoff: secs(config.error_backoff),
        }
    }
}

/// What one upload cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// Every connect attempt failed, or we were stopped while retrying
    NotConnected,
    Uploaded {
        /// Files picked for this batch, oldest first
        selected: Vec<String>,
        uploaded: usize,
        /// The batch ended early on this file
        failed: Option<String>,
    },
}

pub struct Uploader {
    settings: UploadSettings,
    segments: Arc<dyn Spool>,
    transport: Arc<dyn Transport>,
}

impl Uploader {
    pub fn new(
        settings: UploadSettings,
        segments: Arc<dyn Spool>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            settings,
            segments,
            transport,
        }
    }

    /// Try to open a session, giving up early on bad credentials
    pub fn connect(&self, stop: &StopToken) -> Option<Box<dyn Session>> {
        for attempt in 1..=self.settings.connect_attempts {
            match self.transport.connect() {
                Ok(session) => return Some(session),
                Err(e) if !e.is_retryable() => {
                    error!("{}", e);
                    return None;
                }
                Err(e) => warn!("Connection attempt {} failed: {}", attempt, e),
            }
            if attempt < self.settings.connect_attempts && stop.sleep(self.settings.retry_delay) {
                return None;
            }
        }
        error!(
            attempts = self.settings.connect_attempts,
            "Failed to connect to the collector"
        );
        None
    }

    /// Upload one file and delete it locally once it has landed
    pub fn upload(&self, session: &mut dyn Session, name: &str) -> Result<(), UploadError> {
        info!("Uploading {}", name);
        let contents = self.segments.read(name)?;
        let mtime = self.segments.modified(name)?;
        let remote_path = format!("{}/{}", self.settings.site, name);
        session.put(&remote_path, &contents, mtime)?;
        self.segments.remove(name)?;
        Ok(())
    }

    /// Connect, upload the oldest batch, disconnect
    pub fn cycle(&self, stop: &StopToken) -> std::io::Result<Cycle> {
        let mut session = match self.connect(stop) {
            Some(session) => session,
            None => return Ok(Cycle::NotConnected),
        };
        let batch = self.upload_batch(session.as_mut());
        if let Err(e) = session.close() {
            warn!("Error closing collector session: {}", e);
        }
        batch
    }

    fn upload_batch(&self, session: &mut dyn Session) -> std::io::Result<Cycle> {
        let mut selected = self.segments.list_sorted()?;
        selected.truncate(self.settings.batch_size);
        let mut uploaded = 0;
        let mut failed = None;
        for name in &selected {
            match self.upload(session, name) {
                Ok(()) => uploaded += 1,
                Err(e) => {
                    error!("Error uploading {}: {}", name, e);
                    failed = Some(name.clone());
                    break;
                }
            }
        }
        if uploaded > 0 {
            debug!(uploaded, "Upload batch finished");
        }
        Ok(Cycle::Uploaded {
            selected,
            uploaded,
            failed,
        })
    }

    pub fn run(&self, stop: StopToken) {
        info!(site = %self.settings.site, "Uploader started");
        while !stop.is_stopped() {
            let pause = match self.cycle(&stop) {
                Ok(_) => self.settings.cycle_delay,
                Err(e) => {
                    error!("Unexpected error in uploader: {}", e);
                    self.settings.error_backoff
                }
            };
            stop.sleep(pause);
        }
        info!("Uploader stopped");
    }
}

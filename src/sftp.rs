//! SFTP transport to the collector

use std::{
    collections::HashSet,
    io::{self, Write},
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use ssh2::{ErrorCode, FileStat, Sftp};
use tracing::{debug, info};

use crate::{
    config::{secs, RemoteConfig},
    error::{ConnectError, UploadError},
    exfil::{partial_path, Session, Transport},
};

// libssh2 session error codes
const SESSION_TIMEOUT: i32 = -9;
const SESSION_AUTHENTICATION_FAILED: i32 = -18;
const SESSION_SOCKET_TIMEOUT: i32 = -30;
const SESSION_EAGAIN: i32 = -37;
// SFTP status codes
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;

const DIR_MODE: i32 = 0o755;

/// Password-authenticated SFTP to `host:port`
pub struct SftpStore {
    host: String,
    port: u16,
    username: String,
    password: String,
    root: PathBuf,
    timeout: Duration,
}

impl SftpStore {
    pub fn new<P: AsRef<Path>>(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        root: P,
        timeout: Duration,
    ) -> Self {
        Self {
            host: host.to_owned(),
            port,
            username: username.to_owned(),
            password: password.to_owned(),
            root: root.as_ref().to_path_buf(),
            timeout,
        }
    }

    pub fn from_config(remote: &RemoteConfig) -> Self {
        Self::new(
            &remote.host,
            remote.port,
            &remote.username,
            &remote.password,
            &remote.root,
            secs(remote.timeout),
        )
    }

    fn open_stream(&self) -> Result<TcpStream, ConnectError> {
        let mut last = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last = Some(e),
            }
        }
        match last {
            Some(e) if is_timeout(&e) => Err(ConnectError::TimedOut {
                host: self.host.clone(),
            }),
            Some(e) => Err(ConnectError::Transport(e)),
            None => Err(ConnectError::Protocol(format!(
                "{} has no addresses",
                self.host
            ))),
        }
    }
}

impl Transport for SftpStore {
    fn connect(&self) -> Result<Box<dyn Session>, ConnectError> {
        let stream = self.open_stream()?;
        let fail = |e: ssh2::Error| connect_error(e, &self.host, &self.username);
        let mut session = ssh2::Session::new().map_err(fail)?;
        // Zero would mean block forever
        session.set_timeout(self.timeout.as_millis().clamp(1, u32::MAX as u128) as u32);
        session.set_tcp_stream(stream);
        session.handshake().map_err(fail)?;
        session
            .userauth_password(&self.username, &self.password)
            .map_err(fail)?;
        if !session.authenticated() {
            return Err(ConnectError::Authentication {
                user: self.username.clone(),
            });
        }
        let sftp = session.sftp().map_err(fail)?;
        info!("Connected to {}:{}", self.host, self.port);
        Ok(Box::new(SftpSession {
            session,
            sftp,
            root: self.root.clone(),
            created: HashSet::new(),
        }))
    }
}

struct SftpSession {
    session: ssh2::Session,
    sftp: Sftp,
    root: PathBuf,
    /// Remote directories known to exist
    created: HashSet<PathBuf>,
}

impl SftpSession {
    fn ensure_dir(&mut self, dir: &Path) -> Result<(), UploadError> {
        if self.created.contains(dir) {
            return Ok(());
        }
        match self.sftp.stat(dir) {
            Ok(_) => (),
            Err(e) if matches!(e.code(), ErrorCode::SFTP(FX_NO_SUCH_FILE)) => {
                if let Some(parent) = dir.parent() {
                    if !parent.as_os_str().is_empty() {
                        self.ensure_dir(parent)?;
                    }
                }
                self.sftp.mkdir(dir, DIR_MODE).map_err(upload_error)?;
                debug!("Created remote directory {}", dir.display());
            }
            Err(e) => return Err(upload_error(e)),
        }
        self.created.insert(dir.to_path_buf());
        Ok(())
    }
}

impl Session for SftpSession {
    fn put(
        &mut self,
        remote_path: &str,
        contents: &[u8],
        mtime: Option<SystemTime>,
    ) -> Result<(), UploadError> {
        let dest = self.root.join(remote_path);
        if let Some(parent) = dest.parent() {
            self.ensure_dir(parent)?;
        }
        let partial = partial_path(&dest);
        let mut file = self.sftp.create(&partial).map_err(upload_error)?;
        file.write_all(contents)?;
        if let Some(mtime) = mtime {
            let seconds = mtime
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            file.setstat(FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: None,
                atime: Some(seconds),
                mtime: Some(seconds),
            })
            .map_err(upload_error)?;
        }
        drop(file);
        if let Err(e) = self.sftp.rename(&partial, &dest, None) {
            // Version 3 servers won't rename over an existing file
            if self.sftp.stat(&dest).is_err() {
                return Err(upload_error(e));
            }
            self.sftp.unlink(&dest).map_err(upload_error)?;
            self.sftp.rename(&partial, &dest, None).map_err(upload_error)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), UploadError> {
        self.session
            .disconnect(None, "upload cycle finished", None)
            .map_err(upload_error)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

fn is_session_timeout(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::Session(SESSION_TIMEOUT)
            | ErrorCode::Session(SESSION_SOCKET_TIMEOUT)
            | ErrorCode::Session(SESSION_EAGAIN)
    )
}

fn connect_error(e: ssh2::Error, host: &str, user: &str) -> ConnectError {
    match e.code() {
        ErrorCode::Session(SESSION_AUTHENTICATION_FAILED) => ConnectError::Authentication {
            user: user.to_owned(),
        },
        code if is_session_timeout(code) => ConnectError::TimedOut {
            host: host.to_owned(),
        },
        _ => ConnectError::Protocol(e.to_string()),
    }
}

fn upload_error(e: ssh2::Error) -> UploadError {
    match e.code() {
        ErrorCode::SFTP(FX_PERMISSION_DENIED) => UploadError::PermissionDenied(e.to_string()),
        ErrorCode::SFTP(FX_NO_SUCH_FILE) => UploadError::NotFound(e.to_string()),
        code if is_session_timeout(code) => {
            UploadError::Io(io::Error::new(io::ErrorKind::TimedOut, e.to_string()))
        }
        _ => UploadError::Protocol(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::TcpListener, time::Instant};

    fn store(port: u16, timeout: Duration) -> SftpStore {
        SftpStore::new("127.0.0.1", port, "station", "hunter2", "/srv/collector", timeout)
    }

    #[test]
    fn test_connect_error_mapping() {
        let auth = ssh2::Error::new(
            ErrorCode::Session(SESSION_AUTHENTICATION_FAILED),
            "Authentication failed (username/password)",
        );
        assert!(matches!(
            connect_error(auth, "collector", "station"),
            ConnectError::Authentication { user } if user == "station"
        ));

        let timeout = ssh2::Error::new(ErrorCode::Session(SESSION_TIMEOUT), "Timed out");
        let mapped = connect_error(timeout, "collector", "station");
        assert!(matches!(&mapped, ConnectError::TimedOut { host } if host == "collector"));
        assert!(mapped.is_retryable());

        let banner = ssh2::Error::new(ErrorCode::Session(-8), "Unable to exchange keys");
        assert!(matches!(
            connect_error(banner, "collector", "station"),
            ConnectError::Protocol(_)
        ));
    }

    #[test]
    fn test_upload_error_mapping() {
        let denied = ssh2::Error::new(ErrorCode::SFTP(FX_PERMISSION_DENIED), "denied");
        assert!(matches!(upload_error(denied), UploadError::PermissionDenied(_)));
        let missing = ssh2::Error::new(ErrorCode::SFTP(FX_NO_SUCH_FILE), "no such file");
        assert!(matches!(upload_error(missing), UploadError::NotFound(_)));
        let slow = ssh2::Error::new(ErrorCode::Session(SESSION_SOCKET_TIMEOUT), "slow");
        match upload_error(slow) {
            UploadError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected {:?}", other),
        }
        let failure = ssh2::Error::new(ErrorCode::SFTP(4), "failure");
        assert!(matches!(upload_error(failure), UploadError::Protocol(_)));
    }

    #[test]
    fn test_refused_port_is_transport_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = store(port, Duration::from_secs(1)).connect().err().unwrap();
        assert!(matches!(err, ConnectError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_silent_server_times_out() {
        // Accepts the TCP connection but never sends an SSH banner
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let start = Instant::now();
        let err = store(port, Duration::from_millis(200))
            .connect()
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
        drop(listener);
    }

    #[test]
    fn test_unresolvable_host() {
        let store = SftpStore::new(
            "collector.invalid",
            22,
            "station",
            "hunter2",
            "/srv",
            Duration::from_millis(200),
        );
        let err = store.connect().err().unwrap();
        assert!(err.is_retryable());
    }
}

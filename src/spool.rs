//! The durable queues between stages.
//!
//! Each spool has exactly one writer and one consumer. Names sort
//! chronologically, so [`Spool::list_sorted`] is also oldest-first.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use crate::naming::PARTIAL_EXT;

pub trait Spool: Send + Sync {
    /// Make `name` visible with exactly `bytes`, never partially
    fn publish(&self, name: &str, bytes: &[u8]) -> io::Result<()>;
    /// Append to `name`, creating it if needed
    fn append(&self, name: &str, bytes: &[u8]) -> io::Result<()>;
    fn list_sorted(&self) -> io::Result<Vec<String>>;
    fn read(&self, name: &str) -> io::Result<Vec<u8>>;
    /// Last modification time, if the backing store tracks one
    fn modified(&self, name: &str) -> io::Result<Option<SystemTime>>;
    fn remove(&self, name: &str) -> io::Result<()>;
}

/// A spool backed by a single directory
#[derive(Debug, Clone)]
pub struct DirSpool {
    dir: PathBuf,
}

impl DirSpool {
    /// Open `dir`, creating it if it does not exist
    pub fn create<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Spool for DirSpool {
    fn publish(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let partial = self.path(&format!("{}.{}", name, PARTIAL_EXT));
        let write = || -> io::Result<()> {
            let mut file = File::create(&partial)?;
            file.write_all(bytes)?;
            file.sync_all()
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
        // Rename within one directory is atomic
        fs::rename(&partial, self.path(name))
    }

    fn append(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(name))?;
        file.write_all(bytes)
    }

    fn list_sorted(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            // Names we could never have written are not ours
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(name))
    }

    fn modified(&self, name: &str) -> io::Result<Option<SystemTime>> {
        Ok(Some(fs::metadata(self.path(name))?.modified()?))
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.path(name))
    }
}

/// In-process spool, lets the stages run without touching disk
#[derive(Debug, Default)]
pub struct MemorySpool {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemorySpool {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.files().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files().contains_key(name)
    }
}

fn not_found(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} not in spool", name))
}

impl Spool for MemorySpool {
    fn publish(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        self.files().insert(name.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn append(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        self.files()
            .entry(name.to_owned())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    fn list_sorted(&self) -> io::Result<Vec<String>> {
        Ok(self.files().keys().cloned().collect())
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        self.files().get(name).cloned().ok_or_else(|| not_found(name))
    }

    fn modified(&self, name: &str) -> io::Result<Option<SystemTime>> {
        if self.contains(name) {
            Ok(None)
        } else {
            Err(not_found(name))
        }
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        self.files()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(spool: &dyn Spool) {
        spool.publish("KOR11700000001.0000000.cf32", b"late").unwrap();
        spool.publish("KOR11700000000.5000000.cf32", b"early").unwrap();
        spool.append("KOR11700000000", b"0000001=100.00\n").unwrap();
        spool.append("KOR11700000000", b"0000002=-200.00\n").unwrap();
        assert_eq!(
            spool.list_sorted().unwrap(),
            vec![
                "KOR11700000000",
                "KOR11700000000.5000000.cf32",
                "KOR11700000001.0000000.cf32",
            ]
        );
        assert_eq!(
            spool.read("KOR11700000000").unwrap(),
            b"0000001=100.00\n0000002=-200.00\n"
        );
        assert_eq!(spool.read("KOR11700000000.5000000.cf32").unwrap(), b"early");
        spool.remove("KOR11700000000.5000000.cf32").unwrap();
        assert_eq!(spool.list_sorted().unwrap().len(), 2);
        assert_eq!(
            spool.read("missing").unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        assert!(spool.remove("missing").is_err());
    }

    #[test]
    fn test_memory_spool() {
        let spool = MemorySpool::new();
        exercise(&spool);
        assert_eq!(spool.modified("KOR11700000000").unwrap(), None);
        assert_eq!(spool.len(), 2);
    }

    #[test]
    fn test_dir_spool() {
        let dir = tempfile::tempdir().unwrap();
        let spool = DirSpool::create(dir.path().join("capture")).unwrap();
        exercise(&spool);
        assert!(spool.modified("KOR11700000000").unwrap().is_some());
    }

    #[test]
    fn test_dir_spool_publish_leaves_no_partial() {
        let dir = tempfile::tempdir().unwrap();
        let spool = DirSpool::create(dir.path()).unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        spool.publish("KOR11700000000.0000000.cf32", &[1, 2, 3]).unwrap();
        assert_eq!(
            spool.list_sorted().unwrap(),
            vec!["KOR11700000000.0000000.cf32"]
        );
    }
}

//! Known-peers persistence
//!
//! Peers we managed to dial are remembered across restarts in a small text
//! file, one `host:port` per line. The file is read fully and rewritten
//! fully (through a temp file and an atomic rename) on every mutation.

use crate::network::PeerAddress;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default file name inside the data directory
pub const KNOWN_PEERS_FILE: &str = "known_peers";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Persisted set of peer addresses
#[derive(Debug)]
pub struct KnownPeers {
    path: PathBuf,
    /// Serializes every read-modify-write cycle
    lock: Mutex<()>,
}

impl KnownPeers {
    /// Open the store, creating an empty file if none exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
            }
        }
        if !path.exists() {
            fs::write(&path, "").map_err(|e| io_error(&path, e))?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Use the file at `path` without touching the filesystem. Each
    /// operation reports its own errors.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Open `known_peers` inside a data directory
    pub fn in_dir(data_dir: &Path) -> Result<Self, StorageError> {
        Self::open(data_dir.join(KNOWN_PEERS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All stored addresses
    pub fn list(&self) -> Result<Vec<PeerAddress>, StorageError> {
        let _guard = self.lock.lock();
        Ok(self.read()?.into_iter().collect())
    }

    /// Add an address; returns false if it was already present
    pub fn add(&self, addr: &PeerAddress) -> Result<bool, StorageError> {
        let _guard = self.lock.lock();
        let mut peers = self.read()?;
        if !peers.insert(addr.clone()) {
            return Ok(false);
        }
        self.write(&peers)?;
        log::debug!("Remembered peer {}", addr);
        Ok(true)
    }

    /// Remove an address; returns false if it was not present
    pub fn remove(&self, addr: &PeerAddress) -> Result<bool, StorageError> {
        let _guard = self.lock.lock();
        let mut peers = self.read()?;
        if !peers.remove(addr) {
            return Ok(false);
        }
        self.write(&peers)?;
        log::debug!("Forgot peer {}", addr);
        Ok(true)
    }

    fn read(&self) -> Result<BTreeSet<PeerAddress>, StorageError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_error(&self.path, e)),
        };

        let mut peers = BTreeSet::new();
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line.parse::<PeerAddress>() {
                Ok(addr) => {
                    peers.insert(addr);
                }
                Err(e) => log::warn!("Skipping bad known-peers entry: {}", e),
            }
        }
        Ok(peers)
    }

    fn write(&self, peers: &BTreeSet<PeerAddress>) -> Result<(), StorageError> {
        let temp_path = self.path.with_extension("tmp");
        let file = fs::File::create(&temp_path).map_err(|e| io_error(&temp_path, e))?;
        let mut writer = BufWriter::new(file);
        for addr in peers {
            writeln!(writer, "{}", addr).map_err(|e| io_error(&temp_path, e))?;
        }
        writer.flush().map_err(|e| io_error(&temp_path, e))?;
        drop(writer);

        // Atomic rename
        fs::rename(&temp_path, &self.path).map_err(|e| io_error(&self.path, e))
    }
}

fn io_error(path: &Path, source: io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownPeers::in_dir(dir.path()).unwrap();
        assert!(store.path().exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_add_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownPeers::in_dir(dir.path()).unwrap();
        let a = PeerAddress::new("10.0.0.1", 64720);
        let b = PeerAddress::new("10.0.0.2", 64720);

        assert!(store.add(&a).unwrap());
        assert!(!store.add(&a).unwrap());
        assert!(store.add(&b).unwrap());
        assert_eq!(store.list().unwrap(), vec![a.clone(), b.clone()]);

        assert!(store.remove(&a).unwrap());
        assert!(!store.remove(&a).unwrap());
        assert_eq!(store.list().unwrap(), vec![b]);
    }

    #[test]
    fn test_unusable_path_fails_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, "").unwrap();
        let path = blocker.join(KNOWN_PEERS_FILE);

        assert!(KnownPeers::open(&path).is_err());
        let store = KnownPeers::at(&path);
        assert!(store.list().is_err());
        assert!(store.add(&PeerAddress::new("10.0.0.1", 64720)).is_err());
        assert!(store.remove(&PeerAddress::new("10.0.0.1", 64720)).is_err());
    }

    #[test]
    fn test_malformed_lines_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KNOWN_PEERS_FILE);
        fs::write(&path, "10.0.0.1:64720\ngarbage\n\n10.0.0.1:64720\n10.0.0.9:notaport\n").unwrap();

        let store = KnownPeers::open(&path).unwrap();
        assert_eq!(store.list().unwrap(), vec![PeerAddress::new("10.0.0.1", 64720)]);

        store.add(&PeerAddress::new("10.0.0.2", 1)).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "10.0.0.1:64720\n10.0.0.2:1\n");
    }

    #[test]
    fn test_concurrent_mutations_keep_file_clean() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KnownPeers::in_dir(dir.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for round in 0..50u16 {
                        let addr = PeerAddress::new(format!("10.0.{}.{}", worker % 3, round % 7), 64720);
                        if (round + worker) % 3 == 0 {
                            store.remove(&addr).unwrap();
                        } else {
                            store.add(&addr).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let contents = fs::read_to_string(store.path()).unwrap();
        let mut seen = HashSet::new();
        for line in contents.lines() {
            assert!(line.parse::<PeerAddress>().is_ok(), "malformed line {:?}", line);
            assert!(seen.insert(line.to_string()), "duplicate line {:?}", line);
        }
    }
}

//! Durable storage for the node's persistent Raft state.
//!
//! The whole durable tuple (current term, voted-for, log) is saved as one
//! blob so a crash can never observe a partial update.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::raft::state::LogEntry;

/// The persistent part of a node's Raft state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurableState {
    pub current_term: u64,
    pub voted_for: Option<u32>,
    pub log: Vec<LogEntry>,
}

/// Storage contract for the durable state blob.
///
/// `save` must be atomic: after a crash, `load` observes either the previous
/// blob or the new one, never a mix. `load` returns `None` for a node that
/// has never persisted anything.
pub trait Persister: Send + Sync {
    fn save(&mut self, state: &DurableState) -> io::Result<()>;
    fn load(&self) -> io::Result<Option<DurableState>>;
}

/// File-backed persister. The blob is JSON, written to a temp file, fsynced,
/// then renamed over the previous snapshot.
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    /// Creates parent directories as needed; the file itself is only written
    /// on the first `save`.
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }
}

impl Persister for FilePersister {
    fn save(&mut self, state: &DurableState) -> io::Result<()> {
        let json = serde_json::to_vec(state)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    fn load(&self) -> io::Result<Option<DurableState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut contents = String::new();
        File::open(&self.path)?.read_to_string(&mut contents)?;

        let state: DurableState = serde_json::from_str(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(Some(state))
    }
}

/// In-process persister for tests. Clones share the same backing store, so a
/// test can hand one clone to a node and inspect (or reload) the other to
/// simulate a crash-restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersister {
    state: Arc<Mutex<Option<DurableState>>>,
}

impl Persister for MemoryPersister {
    fn save(&mut self, state: &DurableState) -> io::Result<()> {
        *self.state.lock().unwrap() = Some(state.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<DurableState>> {
        Ok(self.state.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> DurableState {
        DurableState {
            current_term: 3,
            voted_for: Some(2),
            log: vec![
                LogEntry {
                    id: 1,
                    term: 1,
                    data: b"a".to_vec(),
                },
                LogEntry {
                    id: 2,
                    term: 3,
                    data: b"b".to_vec(),
                },
            ],
        }
    }

    #[test]
    fn test_file_persister_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut persister = FilePersister::new(dir.path().join("raft.json")).unwrap();

        let state = sample_state();
        persister.save(&state).unwrap();

        let loaded = persister.load().unwrap();
        assert_eq!(loaded, Some(state));
    }

    #[test]
    fn test_file_persister_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let persister = FilePersister::new(dir.path().join("raft.json")).unwrap();

        assert_eq!(persister.load().unwrap(), None);
    }

    #[test]
    fn test_file_persister_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut persister = FilePersister::new(dir.path().join("raft.json")).unwrap();

        persister.save(&sample_state()).unwrap();

        let mut newer = sample_state();
        newer.current_term = 7;
        newer.voted_for = None;
        persister.save(&newer).unwrap();

        assert_eq!(persister.load().unwrap(), Some(newer));
    }

    #[test]
    fn test_file_persister_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b").join("raft.json");
        let mut persister = FilePersister::new(&nested).unwrap();

        persister.save(&sample_state()).unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn test_memory_persister_shares_backing_store() {
        let persister = MemoryPersister::default();
        let mut handle = persister.clone();

        handle.save(&sample_state()).unwrap();
        assert_eq!(persister.load().unwrap(), Some(sample_state()));
    }
}

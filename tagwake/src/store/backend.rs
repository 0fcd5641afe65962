//! Byte-oriented key-value persistence primitives.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

/// A durable key-value primitive.
///
/// Implementations must make `set` atomic with respect to `get`: a reader
/// sees either the previous value or the new one, never a partial write.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> io::Result<()>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> io::Result<()>;
}

/// Volatile backend, for tests and for hosts that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> io::Result<()> {
        self.entries.lock().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> io::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One file per key inside a directory.
///
/// Writes go to a temporary file in the same directory which is synced and
/// then renamed over the target, so a crash mid-write leaves the previous
/// value intact.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl StoreBackend for FileBackend {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> io::Result<()> {
        let dir = self.dir.clone();
        let path = self.path_for(key);
        let value = value.to_vec();

        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &value))
            .await
            .map_err(io::Error::other)?
    }

    async fn delete(&self, key: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn write_atomic(dir: &Path, path: &Path, value: &[u8]) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(value)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

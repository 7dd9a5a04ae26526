//! History cursor persistence: where the next history fetch resumes after a restart.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorFile {
    pub next_history_index: u32,
}

/// File-backed cursor. Read and write failures are logged and treated as "no cursor";
/// the worst case is re-reading the lookback window.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<u32> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "cannot read history cursor");
                return None;
            }
        };
        match bincode::deserialize::<CursorFile>(&bytes) {
            Ok(c) => Some(c.next_history_index),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring corrupt history cursor");
                None
            }
        }
    }

    /// Write via a temp file and rename so a crash never leaves a torn cursor.
    pub fn save(&self, next_history_index: u32) {
        if let Err(e) = self.try_save(next_history_index) {
            tracing::warn!(path = %self.path.display(), error = %e, "cannot persist history cursor");
        }
    }

    fn try_save(&self, next_history_index: u32) -> std::io::Result<()> {
        let bytes = bincode::serialize(&CursorFile { next_history_index })
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("pumplink-cursor-{}-{}", std::process::id(), name))
            .join("cursor.bin")
    }

    #[test]
    fn survives_reload() {
        let path = scratch("reload");
        let store = CursorStore::new(&path);
        assert_eq!(store.load(), None);
        store.save(4242);
        assert_eq!(CursorStore::new(&path).load(), Some(4242));
        store.save(4300);
        assert_eq!(store.load(), Some(4300));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn corrupt_file_reads_as_none() {
        let path = scratch("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, [1u8]).unwrap();
        assert_eq!(CursorStore::new(&path).load(), None);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}

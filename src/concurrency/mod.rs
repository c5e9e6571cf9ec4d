//! Process-level exclusivity.
//!
//! An OS advisory exclusive lock on the `<path>.lock` sidecar is taken at
//! open and held for the lifetime of the handle. A second handle to the same
//! file fails with `DatabaseLocked` instead of blocking.

pub mod epoch;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use crate::error::{Result, TurError};

/// Holds the sidecar advisory lock; released on drop.
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(db_path: &Path) -> Result<LockFile> {
        let path = lock_path(db_path);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(TurError::DatabaseLocked);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(LockFile { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");

        let first = LockFile::acquire(&db_path).unwrap();
        assert!(matches!(
            LockFile::acquire(&db_path),
            Err(TurError::DatabaseLocked)
        ));
        drop(first);
        // Released on drop; a new handle succeeds.
        let _second = LockFile::acquire(&db_path).unwrap();
    }

    #[test]
    fn lock_is_a_sidecar_file() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let lock = LockFile::acquire(&db_path).unwrap();
        assert_eq!(
            lock.path().file_name().unwrap().to_str().unwrap(),
            "test.db.lock"
        );
        assert!(lock.path().exists());
    }
}

// Copyright (c) 2025 Sean McNamara <smcnam@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Process-wide exclusion on the working tree via an advisory, exclusive,
//! non-blocking file lock. The OS releases the underlying `flock` on
//! process exit regardless of how the process dies; the lock file's mere
//! presence on disk is never treated as a lock signal by itself.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::error::EngineError;

pub struct Lock {
    path: PathBuf,
    file: File,
}

impl Lock {
    /// Attempt to acquire the lock at `path`, non-blocking. On success the
    /// file contains this process's PID. On contention, returns
    /// `EngineError::LockHeld` carrying the PID recorded by the holder (best
    /// effort — the file may be stale if the holder died without cleanup,
    /// though the `flock` itself would then already be free).
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        if let Err(_err) = file.try_lock_exclusive() {
            let held_by = std::fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
                .unwrap_or(0);
            return Err(EngineError::LockHeld(held_by).into());
        }

        let mut file = file;
        file.set_len(0)
            .with_context(|| format!("failed to truncate lock file {}", path.display()))?;
        write!(file, "{}", std::process::id())
            .with_context(|| format!("failed to write pid to {}", path.display()))?;
        file.flush().ok();

        Ok(Lock {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Release on graceful shutdown: drops the OS-level advisory lock and
    /// removes the lock file. The `flock` release on process exit (even
    /// abnormal) happens regardless of whether this is ever called.
    pub fn release(self) -> Result<()> {
        FileExt::unlock(&self.file)
            .with_context(|| format!("failed to unlock {}", self.path.display()))?;
        std::fs::remove_file(&self.path).ok();
        Ok(())
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_writes_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".dark-factory.lock");
        let lock = Lock::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
        lock.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".dark-factory.lock");
        let _first = Lock::acquire(&path).unwrap();

        let err = Lock::acquire(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::LockHeld(_))
        ));
    }

    #[test]
    fn drop_without_release_still_frees_the_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".dark-factory.lock");
        {
            let _lock = Lock::acquire(&path).unwrap();
        }
        let second = Lock::acquire(&path);
        assert!(second.is_ok());
    }
}

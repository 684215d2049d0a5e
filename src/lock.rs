// Copyright 2023 The Treemerge Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs::{File, OpenOptions};
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Failed to lock {}: {err}", path.display())]
pub struct FileLockError {
    pub path: PathBuf,
    #[source]
    pub err: io::Error,
}

/// An exclusive lock held for as long as the value lives. The lock file
/// is removed when the lock is dropped, on every exit path.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    _file: File,
}

/// Whether a failed acquisition means another holder currently owns the
/// lock. An existing lock file is the normal contended case; Windows can
/// also report a permission error while the previous holder's file is
/// being deleted.
fn lock_is_held(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::AlreadyExists => true,
        io::ErrorKind::PermissionDenied => cfg!(windows),
        _ => false,
    }
}

impl FileLock {
    /// Takes the lock at `path`, waiting with exponential backoff while
    /// another holder has it. Gives up after a few seconds of contention
    /// and immediately on any other I/O error.
    pub fn lock(path: PathBuf) -> Result<FileLock, FileLockError> {
        let mut policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(250),
            max_elapsed_time: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        loop {
            match Self::try_acquire(&path) {
                Ok(file) => return Ok(FileLock { path, _file: file }),
                Err(err) if lock_is_held(&err) => match policy.next_backoff() {
                    Some(delay) => std::thread::sleep(delay),
                    None => return Err(FileLockError { path, err }),
                },
                Err(err) => return Err(FileLockError { path, err }),
            }
        }
    }

    fn try_acquire(path: &Path) -> io::Result<File> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        // Record the owner so a stale lock can be traced to a process.
        file.write_all(format!("{}\n", std::process::id()).as_bytes())?;
        Ok(file)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(?err, path = ?self.path, "failed to delete lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use super::*;

    #[test]
    fn lock_file_lifetime_tracks_guard() {
        let temp_dir = tempfile::tempdir().unwrap();
        let lock_path = temp_dir.path().join("repo.lock");
        let lock = FileLock::lock(lock_path.clone()).unwrap();
        assert!(lock_path.exists());
        // The lock file names the owning process.
        let owner = fs::read_to_string(&lock_path).unwrap();
        assert_eq!(owner.trim().parse::<u32>().unwrap(), std::process::id());
        drop(lock);
        assert!(!lock_path.exists());
    }

    #[test]
    fn lock_fails_fast_outside_existing_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let lock_path = temp_dir.path().join("missing").join("repo.lock");
        let err = FileLock::lock(lock_path.clone()).unwrap_err();
        // Not a contended lock, so no retrying: the error comes straight
        // back with the path attached.
        assert_eq!(err.path, lock_path);
        assert_eq!(err.err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn lock_serializes_read_modify_write() {
        let temp_dir = tempfile::tempdir().unwrap();
        let lock_path = temp_dir.path().join("data.lock");
        let data_path = temp_dir.path().join("data");
        fs::write(&data_path, "").unwrap();

        // Each thread does a read-modify-write of the whole file under
        // the lock. Without mutual exclusion some lines would be lost.
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let lock_path = lock_path.clone();
                let data_path = data_path.clone();
                thread::spawn(move || {
                    let _lock = FileLock::lock(lock_path).unwrap();
                    let mut contents = fs::read_to_string(&data_path).unwrap();
                    thread::sleep(Duration::from_millis(1));
                    contents.push_str(&format!("writer {i}\n"));
                    fs::write(&data_path, contents).unwrap();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(fs::read_to_string(&data_path).unwrap().lines().count(), 8);
        assert!(!lock_path.exists());
    }
}

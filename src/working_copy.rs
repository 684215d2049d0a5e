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

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::fs::{Metadata, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::symlink;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;

use crate::backend::{blob_id, BackendError, FileMode, MillisSinceEpoch, ObjectId};
use crate::dircache::DirCacheEntry;
use crate::repo_path::RepoPath;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum WorkingCopyError {
    #[error("{message}: {err}")]
    IoError {
        message: String,
        #[source]
        err: std::io::Error,
    },
    #[error("Working copy path {} is not valid UTF-8", path.to_string_lossy())]
    InvalidUtf8Path { path: OsString },
    #[error("Internal backend error: {0}")]
    InternalBackendError(#[from] BackendError),
}

impl WorkingCopyError {
    fn for_stat_error(err: std::io::Error, path: &Path) -> Self {
        WorkingCopyError::IoError {
            message: format!("Failed to stat file {}", path.display()),
            err,
        }
    }
}

fn mtime_from_metadata(metadata: &Metadata) -> MillisSinceEpoch {
    let time = metadata
        .modified()
        .expect("File mtime not supported on this platform?");
    let since_epoch = time
        .duration_since(UNIX_EPOCH)
        .expect("mtime before unix epoch");
    MillisSinceEpoch(
        i64::try_from(since_epoch.as_millis())
            .expect("mtime billions of years into the future or past"),
    )
}

/// What a working-copy file looked like when the snapshot was taken:
/// its mode, the content address of its bytes, and the stat data the
/// index records.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct WorkFileState {
    pub mode: FileMode,
    pub id: ObjectId,
    pub mtime: MillisSinceEpoch,
    pub size: u64,
}

impl WorkFileState {
    pub fn mode_differs(&self, other: FileMode) -> bool {
        self.mode != other
    }
}

/// A scan of a working-copy directory, with file contents hashed so they
/// compare against tree entries. Directories are implied by the paths of
/// the files inside them.
#[derive(Debug)]
pub struct WorktreeSnapshot {
    root: PathBuf,
    states: BTreeMap<RepoPath, WorkFileState>,
}

impl WorktreeSnapshot {
    pub fn snapshot(root: PathBuf) -> Result<WorktreeSnapshot, WorkingCopyError> {
        let mut states = BTreeMap::new();
        let mut work = vec![(RepoPath::root(), root.clone())];
        while let Some((dir, disk_dir)) = work.pop() {
            let dir_entries = disk_dir.read_dir().map_err(|err| WorkingCopyError::IoError {
                message: format!("Failed to list directory {}", disk_dir.display()),
                err,
            })?;
            for maybe_entry in dir_entries {
                let entry = maybe_entry.map_err(|err| WorkingCopyError::IoError {
                    message: format!("Failed to list directory {}", disk_dir.display()),
                    err,
                })?;
                let file_name = entry.file_name();
                let name = file_name
                    .to_str()
                    .ok_or_else(|| WorkingCopyError::InvalidUtf8Path {
                        path: file_name.clone(),
                    })?;
                let sub_path = dir.join(name);
                let disk_path = entry.path();
                let metadata = disk_path
                    .symlink_metadata()
                    .map_err(|err| WorkingCopyError::for_stat_error(err, &disk_path))?;
                if metadata.is_dir() {
                    work.push((sub_path, disk_path));
                } else if metadata.file_type().is_symlink() {
                    let target =
                        disk_path
                            .read_link()
                            .map_err(|err| WorkingCopyError::IoError {
                                message: format!(
                                    "Failed to read symlink {}",
                                    disk_path.display()
                                ),
                                err,
                            })?;
                    states.insert(
                        sub_path,
                        WorkFileState {
                            mode: FileMode::SYMLINK,
                            id: blob_id(target.to_string_lossy().as_bytes()),
                            mtime: mtime_from_metadata(&metadata),
                            size: metadata.len(),
                        },
                    );
                } else {
                    let contents =
                        fs::read(&disk_path).map_err(|err| WorkingCopyError::IoError {
                            message: format!("Failed to read file {}", disk_path.display()),
                            err,
                        })?;
                    #[cfg(unix)]
                    let executable = metadata.permissions().mode() & 0o111 != 0;
                    #[cfg(windows)]
                    let executable = false;
                    states.insert(
                        sub_path,
                        WorkFileState {
                            mode: if executable {
                                FileMode::EXECUTABLE_FILE
                            } else {
                                FileMode::REGULAR_FILE
                            },
                            id: blob_id(&contents),
                            mtime: mtime_from_metadata(&metadata),
                            size: contents.len() as u64,
                        },
                    );
                }
            }
        }
        Ok(WorktreeSnapshot { root, states })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn states(&self) -> &BTreeMap<RepoPath, WorkFileState> {
        &self.states
    }
}

/// Creates intermediate directories from `root` down to the parent of
/// `path`. An existing non-directory in the chain is removed first; the
/// merge has decided that name is a directory now.
pub fn create_parent_dirs(root: &Path, path: &RepoPath) -> Result<(), WorkingCopyError> {
    let components: Vec<_> = path.components().collect();
    let (_, dir_components) = components
        .split_last()
        .expect("repo path shouldn't be root");
    let mut dir_path = root.to_owned();
    for c in dir_components {
        dir_path.push(c);
        match fs::create_dir(&dir_path) {
            Ok(()) => {}
            Err(_)
                if dir_path
                    .symlink_metadata()
                    .map(|m| m.is_dir())
                    .unwrap_or(false) => {}
            Err(err) => {
                if dir_path.symlink_metadata().is_ok() {
                    fs::remove_file(&dir_path).map_err(|err| WorkingCopyError::IoError {
                        message: format!(
                            "Failed to remove blocking file {}",
                            dir_path.display()
                        ),
                        err,
                    })?;
                    fs::create_dir(&dir_path).map_err(|err| WorkingCopyError::IoError {
                        message: format!(
                            "Failed to create directory {}",
                            dir_path.display()
                        ),
                        err,
                    })?;
                } else {
                    return Err(WorkingCopyError::IoError {
                        message: format!(
                            "Failed to create parent directories for {}",
                            path.to_fs_path(root).display(),
                        ),
                        err,
                    });
                }
            }
        }
    }
    Ok(())
}

fn remove_existing(disk_path: &Path) -> Result<(), WorkingCopyError> {
    match disk_path.symlink_metadata() {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(WorkingCopyError::for_stat_error(err, disk_path)),
        Ok(metadata) if metadata.is_dir() => {
            fs::remove_dir_all(disk_path).map_err(|err| WorkingCopyError::IoError {
                message: format!("Failed to remove directory {}", disk_path.display()),
                err,
            })
        }
        Ok(_) => fs::remove_file(disk_path).map_err(|err| WorkingCopyError::IoError {
            message: format!("Failed to remove file {}", disk_path.display()),
            err,
        }),
    }
}

#[cfg_attr(windows, allow(unused_variables))]
fn set_executable(disk_path: &Path, executable: bool) -> Result<(), WorkingCopyError> {
    #[cfg(unix)]
    {
        let mode = if executable { 0o755 } else { 0o644 };
        fs::set_permissions(disk_path, fs::Permissions::from_mode(mode))
            .map_err(|err| WorkingCopyError::for_stat_error(err, disk_path))?;
    }
    Ok(())
}

/// Materializes an index entry into the working copy, replacing whatever
/// is at that path.
pub fn write_entry(
    store: &Store,
    root: &Path,
    entry: &DirCacheEntry,
) -> Result<(), WorkingCopyError> {
    let disk_path = entry.path.to_fs_path(root);
    create_parent_dirs(root, &entry.path)?;
    remove_existing(&disk_path)?;
    if entry.mode.is_symlink() {
        let target = store.read_blob(&entry.id)?;
        let target = String::from_utf8_lossy(&target).into_owned();
        #[cfg(unix)]
        {
            symlink(&target, &disk_path).map_err(|err| WorkingCopyError::IoError {
                message: format!(
                    "Failed to create symlink from {} to {target}",
                    disk_path.display()
                ),
                err,
            })?;
        }
        #[cfg(windows)]
        {
            fs::write(&disk_path, target.as_bytes()).map_err(|err| {
                WorkingCopyError::IoError {
                    message: format!("Failed to write file {}", disk_path.display()),
                    err,
                }
            })?;
        }
    } else if entry.mode.is_gitlink() {
        // A nested repository is represented by its directory only.
        fs::create_dir(&disk_path).map_err(|err| WorkingCopyError::IoError {
            message: format!("Failed to create directory {}", disk_path.display()),
            err,
        })?;
    } else {
        let contents = store.read_blob(&entry.id)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true) // Don't follow a concurrently created symlink.
            .open(&disk_path)
            .map_err(|err| WorkingCopyError::IoError {
                message: format!("Failed to open file {} for writing", disk_path.display()),
                err,
            })?;
        file.write_all(&contents)
            .map_err(|err| WorkingCopyError::IoError {
                message: format!("Failed to write file {}", disk_path.display()),
                err,
            })?;
        set_executable(&disk_path, entry.mode.is_executable())?;
    }
    Ok(())
}

/// Writes merged content at a path, replacing whatever is there, and
/// returns the written file's mtime for the index entry.
pub fn write_merged_bytes(
    root: &Path,
    path: &RepoPath,
    contents: &[u8],
) -> Result<MillisSinceEpoch, WorkingCopyError> {
    let disk_path = path.to_fs_path(root);
    create_parent_dirs(root, path)?;
    remove_existing(&disk_path)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&disk_path)
        .map_err(|err| WorkingCopyError::IoError {
            message: format!("Failed to open file {} for writing", disk_path.display()),
            err,
        })?;
    file.write_all(contents)
        .map_err(|err| WorkingCopyError::IoError {
            message: format!("Failed to write file {}", disk_path.display()),
            err,
        })?;
    let metadata = file
        .metadata()
        .map_err(|err| WorkingCopyError::for_stat_error(err, &disk_path))?;
    Ok(mtime_from_metadata(&metadata))
}

/// Removes the file or (empty) directory at a path. A missing path
/// counts as deleted.
pub fn delete_path(root: &Path, path: &RepoPath) -> std::io::Result<()> {
    let disk_path = path.to_fs_path(root);
    match disk_path.symlink_metadata() {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
        Ok(metadata) if metadata.is_dir() => fs::remove_dir(&disk_path),
        Ok(_) => fs::remove_file(&disk_path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::blob_id;
    use crate::dircache::Stage;
    use crate::testutils::new_store;

    fn file_entry(store: &Store, path: &str, contents: &str) -> DirCacheEntry {
        let id = store.write_blob(contents.as_bytes()).unwrap();
        DirCacheEntry {
            path: RepoPath::from_internal_string(path),
            stage: Stage::Merged,
            mode: FileMode::REGULAR_FILE,
            id,
            mtime: MillisSinceEpoch(0),
            size: contents.len() as u64,
        }
    }

    #[test]
    fn test_snapshot_hashes_contents() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().to_owned();
        fs::create_dir(root.join("dir")).unwrap();
        fs::write(root.join("dir/file"), b"contents").unwrap();
        fs::write(root.join("top"), b"other").unwrap();

        let snapshot = WorktreeSnapshot::snapshot(root).unwrap();
        let state = &snapshot.states()[&RepoPath::from_internal_string("dir/file")];
        assert_eq!(state.mode, FileMode::REGULAR_FILE);
        assert_eq!(state.id, blob_id(b"contents"));
        assert_eq!(state.size, 8);
        assert!(snapshot
            .states()
            .contains_key(&RepoPath::from_internal_string("top")));
        // Directories are implied, not listed.
        assert!(!snapshot
            .states()
            .contains_key(&RepoPath::from_internal_string("dir")));
    }

    #[test]
    fn test_write_entry_creates_parents() {
        let store = new_store();
        let temp_dir = tempfile::tempdir().unwrap();
        let entry = file_entry(&store, "a/b/c", "deep");
        write_entry(&store, temp_dir.path(), &entry).unwrap();
        assert_eq!(
            fs::read(temp_dir.path().join("a/b/c")).unwrap(),
            b"deep"
        );
    }

    #[test]
    fn test_write_entry_replaces_directory() {
        let store = new_store();
        let temp_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp_dir.path().join("a/b")).unwrap();
        let entry = file_entry(&store, "a", "now a file");
        write_entry(&store, temp_dir.path(), &entry).unwrap();
        assert_eq!(
            fs::read(temp_dir.path().join("a")).unwrap(),
            b"now a file"
        );
    }

    #[test]
    fn test_create_parent_dirs_removes_blocking_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("a"), b"in the way").unwrap();
        create_parent_dirs(temp_dir.path(), &RepoPath::from_internal_string("a/b")).unwrap();
        assert!(temp_dir.path().join("a").is_dir());
    }

    #[test]
    fn test_delete_path_tolerates_missing() {
        let temp_dir = tempfile::tempdir().unwrap();
        delete_path(temp_dir.path(), &RepoPath::from_internal_string("gone")).unwrap();
    }

    #[test]
    fn test_delete_path_refuses_non_empty_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::create_dir(temp_dir.path().join("d")).unwrap();
        fs::write(temp_dir.path().join("d/f"), b"x").unwrap();
        assert!(delete_path(temp_dir.path(), &RepoPath::from_internal_string("d")).is_err());
        delete_path(temp_dir.path(), &RepoPath::from_internal_string("d/f")).unwrap();
        delete_path(temp_dir.path(), &RepoPath::from_internal_string("d")).unwrap();
        assert!(!temp_dir.path().join("d").exists());
    }
}

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
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::backend::{
    BackendResult, FileMode, MillisSinceEpoch, ObjectId, Tree, TreeEntry, OBJECT_ID_LENGTH,
};
use crate::lock::{FileLock, FileLockError};
use crate::repo_path::RepoPath;
use crate::store::Store;

const DIRCACHE_MAGIC: &[u8; 4] = b"TMDC";
const DIRCACHE_VERSION: u32 = 1;

/// The slot an index entry occupies: 0 for a fully merged path, 1/2/3
/// for the base/ours/theirs sides of an unresolved conflict.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub enum Stage {
    Merged = 0,
    Base = 1,
    Ours = 2,
    Theirs = 3,
}

impl Stage {
    pub fn from_u8(value: u8) -> Option<Stage> {
        match value {
            0 => Some(Stage::Merged),
            1 => Some(Stage::Base),
            2 => Some(Stage::Ours),
            3 => Some(Stage::Theirs),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DirCacheEntry {
    pub path: RepoPath,
    pub stage: Stage,
    pub mode: FileMode,
    pub id: ObjectId,
    pub mtime: MillisSinceEpoch,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum DirCacheError {
    #[error("{message}: {err}")]
    Io {
        message: String,
        #[source]
        err: std::io::Error,
    },
    #[error("Dircache file {} is corrupt: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },
    #[error(transparent)]
    Lock(#[from] FileLockError),
    #[error("Cannot commit a dircache with no backing file")]
    Unbacked,
}

fn io_error(message: impl Into<String>) -> impl FnOnce(std::io::Error) -> DirCacheError {
    let message = message.into();
    move |err| DirCacheError::Io { message, err }
}

/// The persistent index: paths mapped to staged entries, ordered by
/// (path, stage) with paths compared component-wise, which is the order
/// a pre-order tree walk produces.
#[derive(Debug)]
pub struct DirCache {
    path: Option<PathBuf>,
    lock: Option<FileLock>,
    entries: Vec<DirCacheEntry>,
}

impl DirCache {
    /// A dircache with no backing file. `commit()` is not available;
    /// `finish()` is.
    pub fn in_memory() -> DirCache {
        DirCache {
            path: None,
            lock: None,
            entries: vec![],
        }
    }

    /// Reads the dircache without taking the lock. A missing file reads
    /// as empty.
    pub fn read(path: PathBuf) -> Result<DirCache, DirCacheError> {
        let entries = Self::read_entries(&path)?;
        Ok(DirCache {
            path: Some(path),
            lock: None,
            entries,
        })
    }

    /// Reads the dircache under an exclusive lock. The lock is released
    /// when the dircache is dropped or unlocked, on every exit path.
    pub fn lock_and_read(path: PathBuf) -> Result<DirCache, DirCacheError> {
        let lock = FileLock::lock(path.with_extension("lock"))?;
        let entries = Self::read_entries(&path)?;
        Ok(DirCache {
            path: Some(path),
            lock: Some(lock),
            entries,
        })
    }

    fn read_entries(path: &PathBuf) -> Result<Vec<DirCacheEntry>, DirCacheError> {
        let mut file = match File::open(path) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            result => result
                .map_err(io_error(format!("Failed to open dircache {}", path.display())))?,
        };
        let corrupt = |message: &str| DirCacheError::Corrupt {
            path: path.clone(),
            message: message.to_string(),
        };
        let read_failed = io_error(format!("Failed to read dircache {}", path.display()));

        let mut magic = [0; 4];
        file.read_exact(&mut magic).map_err(read_failed)?;
        if &magic != DIRCACHE_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let read_failed = io_error(format!("Failed to read dircache {}", path.display()));
        if file.read_u32::<LittleEndian>().map_err(read_failed)? != DIRCACHE_VERSION {
            return Err(corrupt("unsupported version"));
        }
        let mut buf = vec![];
        file.read_to_end(&mut buf)
            .map_err(io_error(format!("Failed to read dircache {}", path.display())))?;
        let mut reader = buf.as_slice();
        let count = reader
            .read_u64::<LittleEndian>()
            .map_err(|_| corrupt("truncated entry count"))?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let path_len = reader
                .read_u32::<LittleEndian>()
                .map_err(|_| corrupt("truncated path length"))? as usize;
            if reader.len() < path_len {
                return Err(corrupt("truncated path"));
            }
            let (path_bytes, rest) = reader.split_at(path_len);
            reader = rest;
            let entry_path = std::str::from_utf8(path_bytes)
                .map_err(|_| corrupt("path is not valid UTF-8"))?;
            let stage = Stage::from_u8(reader.read_u8().map_err(|_| corrupt("truncated stage"))?)
                .ok_or_else(|| corrupt("invalid stage"))?;
            let mode = FileMode::from_raw(
                reader
                    .read_u32::<LittleEndian>()
                    .map_err(|_| corrupt("truncated mode"))?,
            );
            let mut id_bytes = [0; OBJECT_ID_LENGTH];
            reader
                .read_exact(&mut id_bytes)
                .map_err(|_| corrupt("truncated object id"))?;
            let mtime = MillisSinceEpoch(
                reader
                    .read_i64::<LittleEndian>()
                    .map_err(|_| corrupt("truncated mtime"))?,
            );
            let size = reader
                .read_u64::<LittleEndian>()
                .map_err(|_| corrupt("truncated size"))?;
            entries.push(DirCacheEntry {
                path: RepoPath::from_internal_string(entry_path),
                stage,
                mode,
                id: ObjectId::new(id_bytes),
                mtime,
                size,
            });
        }
        Ok(entries)
    }

    fn save(&self) -> Result<(), DirCacheError> {
        let path = self.path.as_ref().ok_or(DirCacheError::Unbacked)?;
        let dir = path.parent().expect("dircache path has no parent");
        let mut buf = vec![];
        buf.write_all(DIRCACHE_MAGIC).unwrap();
        buf.write_u32::<LittleEndian>(DIRCACHE_VERSION).unwrap();
        buf.write_u64::<LittleEndian>(self.entries.len() as u64)
            .unwrap();
        for entry in &self.entries {
            let path_bytes = entry.path.as_internal_str().as_bytes();
            buf.write_u32::<LittleEndian>(path_bytes.len() as u32)
                .unwrap();
            buf.write_all(path_bytes).unwrap();
            buf.write_u8(entry.stage as u8).unwrap();
            buf.write_u32::<LittleEndian>(entry.mode.raw()).unwrap();
            buf.write_all(entry.id.as_bytes()).unwrap();
            buf.write_i64::<LittleEndian>(entry.mtime.0).unwrap();
            buf.write_u64::<LittleEndian>(entry.size).unwrap();
        }
        let mut temp_file = NamedTempFile::new_in(dir)
            .map_err(io_error("Failed to create temporary dircache file"))?;
        temp_file
            .as_file_mut()
            .write_all(&buf)
            .map_err(io_error("Failed to write dircache"))?;
        temp_file
            .persist(path)
            .map_err(|err| DirCacheError::Io {
                message: format!("Failed to persist dircache {}", path.display()),
                err: err.error,
            })?;
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn backing_path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    pub fn unlock(&mut self) {
        self.lock = None;
    }

    pub fn entries(&self) -> &[DirCacheEntry] {
        &self.entries
    }

    /// The stage-0 entry at a path, or the lowest-stage entry when the
    /// path is conflicted.
    pub fn entry(&self, path: &RepoPath) -> Option<&DirCacheEntry> {
        self.entries
            .iter()
            .find(|entry| &entry.path == path)
    }

    pub fn builder(&self) -> DirCacheBuilder {
        DirCacheBuilder { entries: vec![] }
    }

    /// Replaces the contents with the builder's and persists them.
    pub fn commit(&mut self, builder: DirCacheBuilder) -> Result<(), DirCacheError> {
        self.entries = builder.entries;
        self.save()?;
        self.unlock();
        Ok(())
    }

    /// Replaces the contents with the builder's, in memory only.
    pub fn finish(&mut self, builder: DirCacheBuilder) {
        self.entries = builder.entries;
    }

    /// Writes the tree described by the stage-0 entries, bottom-up, and
    /// returns the root tree id. Empty subtrees are pruned; the root is
    /// written even when empty.
    pub fn write_tree(&self, store: &Store) -> BackendResult<ObjectId> {
        let mut trees: BTreeMap<RepoPath, Tree> =
            BTreeMap::from([(RepoPath::root(), Tree::default())]);
        for entry in &self.entries {
            if entry.stage != Stage::Merged {
                continue;
            }
            let (dir, basename) = entry.path.split().expect("dircache entry at root path");
            let mut ancestor = Some(dir.clone());
            while let Some(current) = ancestor {
                let vacant = !trees.contains_key(&current);
                if vacant {
                    trees.insert(current.clone(), Tree::default());
                }
                ancestor = current.parent();
            }
            trees.get_mut(&dir).unwrap().set(
                basename.to_owned(),
                TreeEntry {
                    mode: entry.mode,
                    id: entry.id.clone(),
                },
            );
        }

        // Write trees in reverse order, starting with trees without
        // children.
        while let Some((dir, tree)) = trees.pop_last() {
            if let Some((parent, basename)) = dir.split() {
                let parent_tree = trees.get_mut(&parent).unwrap();
                if tree.is_empty() {
                    parent_tree.remove(basename);
                } else {
                    let id = store.write_tree(&tree)?;
                    parent_tree.set(
                        basename.to_owned(),
                        TreeEntry {
                            mode: FileMode::TREE,
                            id,
                        },
                    );
                }
            } else {
                assert!(trees.is_empty());
                return store.write_tree(&tree);
            }
        }
        unreachable!("trees must contain the root tree");
    }
}

/// Appends entries in tree-walk order. Entries must arrive in strictly
/// increasing (path, stage) order; the walk guarantees that.
#[derive(Debug, Default)]
pub struct DirCacheBuilder {
    entries: Vec<DirCacheEntry>,
}

impl DirCacheBuilder {
    pub fn add(&mut self, entry: DirCacheEntry) {
        if let Some(last) = self.entries.last() {
            assert!(
                (&last.path, last.stage) < (&entry.path, entry.stage),
                "dircache entries must be added in increasing (path, stage) order: {:?} then {:?}",
                (&last.path, last.stage),
                (&entry.path, entry.stage),
            );
        }
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[DirCacheEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::blob_id;
    use crate::testutils::new_store;

    fn entry(path: &str, stage: Stage, contents: &str) -> DirCacheEntry {
        DirCacheEntry {
            path: RepoPath::from_internal_string(path),
            stage,
            mode: FileMode::REGULAR_FILE,
            id: blob_id(contents.as_bytes()),
            mtime: MillisSinceEpoch(0),
            size: contents.len() as u64,
        }
    }

    #[test]
    fn test_builder_order_enforced() {
        let dc = DirCache::in_memory();
        let mut builder = dc.builder();
        builder.add(entry("a/b", Stage::Merged, "1"));
        builder.add(entry("a.x", Stage::Merged, "2"));
        builder.add(entry("b", Stage::Base, "3"));
        builder.add(entry("b", Stage::Ours, "4"));
        assert_eq!(builder.entries().len(), 4);
    }

    #[test]
    #[should_panic(expected = "increasing (path, stage) order")]
    fn test_builder_rejects_out_of_order() {
        let dc = DirCache::in_memory();
        let mut builder = dc.builder();
        builder.add(entry("b", Stage::Merged, "1"));
        builder.add(entry("a", Stage::Merged, "2"));
    }

    #[test]
    #[should_panic(expected = "increasing (path, stage) order")]
    fn test_builder_rejects_duplicate_stage() {
        let dc = DirCache::in_memory();
        let mut builder = dc.builder();
        builder.add(entry("a", Stage::Ours, "1"));
        builder.add(entry("a", Stage::Ours, "2"));
    }

    #[test]
    fn test_save_and_read_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("dircache");
        let mut dc = DirCache::lock_and_read(path.clone()).unwrap();
        let mut builder = dc.builder();
        builder.add(entry("a", Stage::Merged, "1"));
        builder.add(entry("d/f", Stage::Base, "2"));
        builder.add(entry("d/f", Stage::Theirs, "3"));
        dc.commit(builder).unwrap();
        assert!(!dc.is_locked());

        let reread = DirCache::read(path).unwrap();
        assert_eq!(reread.entries(), dc.entries());
        assert_eq!(
            reread.entry(&RepoPath::from_internal_string("a")),
            Some(&entry("a", Stage::Merged, "1"))
        );
        assert_eq!(
            reread.entry(&RepoPath::from_internal_string("d/f")),
            Some(&entry("d/f", Stage::Base, "2"))
        );
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dc = DirCache::read(temp_dir.path().join("dircache")).unwrap();
        assert!(dc.entries().is_empty());
    }

    #[test]
    fn test_read_rejects_corrupt_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("dircache");
        std::fs::write(&path, b"not a dircache").unwrap();
        assert!(matches!(
            DirCache::read(path),
            Err(DirCacheError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_commit_requires_backing_file() {
        let mut dc = DirCache::in_memory();
        let builder = dc.builder();
        assert!(matches!(dc.commit(builder), Err(DirCacheError::Unbacked)));
    }

    #[test]
    fn test_write_tree_skips_conflict_stages() {
        let store = new_store();
        let mut dc = DirCache::in_memory();
        let mut builder = dc.builder();
        builder.add(entry("a", Stage::Merged, "1"));
        builder.add(entry("b", Stage::Base, "2"));
        builder.add(entry("b", Stage::Ours, "3"));
        dc.finish(builder);

        let tree_id = dc.write_tree(&store).unwrap();
        let tree = store.get_tree(&tree_id).unwrap();
        assert!(tree.entry("a").is_some());
        assert!(tree.entry("b").is_none());
    }

    #[test]
    fn test_write_tree_nested_directories() {
        let store = new_store();
        let mut dc = DirCache::in_memory();
        let mut builder = dc.builder();
        builder.add(entry("d/e/f", Stage::Merged, "1"));
        builder.add(entry("g", Stage::Merged, "2"));
        dc.finish(builder);

        let root_id = dc.write_tree(&store).unwrap();
        let root = store.get_tree(&root_id).unwrap();
        let d_entry = root.entry("d").unwrap();
        assert!(d_entry.mode.is_tree());
        let d_tree = store.get_tree(&d_entry.id).unwrap();
        let e_entry = d_tree.entry("e").unwrap();
        let e_tree = store.get_tree(&e_entry.id).unwrap();
        assert_eq!(e_tree.entry("f").unwrap().id, blob_id(b"1"));
        assert_eq!(root.entry("g").unwrap().id, blob_id(b"2"));
    }

    #[test]
    fn test_write_tree_empty_index_writes_empty_root() {
        let store = new_store();
        let dc = DirCache::in_memory();
        let tree_id = dc.write_tree(&store).unwrap();
        assert_eq!(&tree_id, store.empty_tree_id());
    }
}

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
use std::fmt::{Debug, Error, Formatter};

use blake2::{Blake2b512, Digest};
use thiserror::Error;

pub const OBJECT_ID_LENGTH: usize = 32;

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct ObjectId([u8; OBJECT_ID_LENGTH]);

impl Debug for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_tuple("ObjectId").field(&self.hex()).finish()
    }
}

impl ObjectId {
    pub fn new(value: [u8; OBJECT_ID_LENGTH]) -> Self {
        Self(value)
    }

    /// The reserved id denoting absence.
    pub fn zero() -> Self {
        Self([0; OBJECT_ID_LENGTH])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; OBJECT_ID_LENGTH]
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut value = [0; OBJECT_ID_LENGTH];
        value.copy_from_slice(bytes);
        Self(value)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_hex(hex: &str) -> Self {
        Self::from_bytes(&hex::decode(hex).unwrap())
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// The content address of a blob, independent of any backend instance.
/// Both the object store and working-copy snapshots hash with this, so
/// ids are comparable across the walk's slots.
pub fn blob_id(contents: &[u8]) -> ObjectId {
    let mut hasher = Blake2b512::new();
    hasher.update(b"blob\0");
    hasher.update(contents);
    ObjectId::from_bytes(&hasher.finalize()[..OBJECT_ID_LENGTH])
}

/// A file mode packed the way trees store it: a kind in the upper bits,
/// permissions in the lower. Mode 0 means the slot is absent.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct FileMode(u32);

impl FileMode {
    pub const MISSING: FileMode = FileMode(0);
    pub const TREE: FileMode = FileMode(0o040000);
    pub const REGULAR_FILE: FileMode = FileMode(0o100644);
    pub const EXECUTABLE_FILE: FileMode = FileMode(0o100755);
    pub const SYMLINK: FileMode = FileMode(0o120000);
    pub const GITLINK: FileMode = FileMode(0o160000);

    pub fn from_raw(raw: u32) -> Self {
        FileMode(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn is_missing(&self) -> bool {
        self.0 == 0
    }

    pub fn is_tree(&self) -> bool {
        self.0 & 0o170000 == 0o040000
    }

    /// Present and not a tree: a blob-carrying slot.
    pub fn is_non_tree(&self) -> bool {
        !self.is_missing() && !self.is_tree()
    }

    pub fn is_gitlink(&self) -> bool {
        self.0 & 0o170000 == 0o160000
    }

    pub fn is_executable(&self) -> bool {
        *self == FileMode::EXECUTABLE_FILE
    }

    pub fn is_symlink(&self) -> bool {
        self.0 & 0o170000 == 0o120000
    }
}

impl Debug for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.write_fmt(format_args!("FileMode({:o})", self.0))
    }
}

#[derive(Debug, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct MillisSinceEpoch(pub i64);

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct TreeEntry {
    pub mode: FileMode,
    pub id: ObjectId,
}

#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Tree {
    entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &TreeEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn set(&mut self, name: String, entry: TreeEntry) {
        debug_assert!(!name.is_empty() && !name.contains('/'));
        self.entries.insert(name, entry);
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.remove(name);
    }

    pub fn entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Object {0} not found")]
    NotFound(String),
    #[error("Error: {0}")]
    Other(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

pub trait Backend: Send + Sync + Debug {
    fn read_blob(&self, id: &ObjectId) -> BackendResult<Vec<u8>>;

    fn write_blob(&self, contents: &[u8]) -> BackendResult<ObjectId>;

    fn read_tree(&self, id: &ObjectId) -> BackendResult<Tree>;

    fn write_tree(&self, contents: &Tree) -> BackendResult<ObjectId>;

    fn empty_tree_id(&self) -> &ObjectId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_id() {
        assert!(ObjectId::zero().is_zero());
        assert!(!blob_id(b"").is_zero());
    }

    #[test]
    fn test_blob_id_is_content_addressed() {
        assert_eq!(blob_id(b"abc"), blob_id(b"abc"));
        assert_ne!(blob_id(b"abc"), blob_id(b"abd"));
    }

    #[test]
    fn test_mode_kinds() {
        assert!(FileMode::MISSING.is_missing());
        assert!(!FileMode::MISSING.is_non_tree());
        assert!(FileMode::TREE.is_tree());
        assert!(!FileMode::TREE.is_non_tree());
        for mode in [
            FileMode::REGULAR_FILE,
            FileMode::EXECUTABLE_FILE,
            FileMode::SYMLINK,
            FileMode::GITLINK,
        ] {
            assert!(mode.is_non_tree(), "{mode:?}");
            assert!(!mode.is_tree(), "{mode:?}");
        }
        assert!(FileMode::GITLINK.is_gitlink());
        assert!(FileMode::EXECUTABLE_FILE.is_executable());
        assert!(FileMode::SYMLINK.is_symlink());
    }

    #[test]
    fn test_tree_entries_sorted() {
        let mut tree = Tree::default();
        let entry = TreeEntry {
            mode: FileMode::REGULAR_FILE,
            id: blob_id(b"x"),
        };
        tree.set("b".to_owned(), entry.clone());
        tree.set("a".to_owned(), entry.clone());
        tree.set("c".to_owned(), entry);
        let names: Vec<_> = tree.entries().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}

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

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fmt::{Debug, Error, Formatter};
use std::sync::{Arc, RwLock};

use blake2::{Blake2b512, Digest};

use crate::backend::{
    blob_id, Backend, BackendError, BackendResult, FileMode, ObjectId, Tree, TreeEntry,
    OBJECT_ID_LENGTH,
};
use crate::store::Store;

/// A content-addressed store kept entirely in memory, enough backend for
/// merging and for tests.
pub struct MemoryBackend {
    empty_tree_id: ObjectId,
    blobs: RwLock<HashMap<ObjectId, Vec<u8>>>,
    trees: RwLock<HashMap<ObjectId, Tree>>,
}

impl Debug for MemoryBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("MemoryBackend").finish()
    }
}

fn tree_id(tree: &Tree) -> ObjectId {
    let mut hasher = Blake2b512::new();
    hasher.update(b"tree\0");
    for (name, entry) in tree.entries() {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(entry.mode.raw().to_le_bytes());
        hasher.update(entry.id.as_bytes());
    }
    ObjectId::from_bytes(&hasher.finalize()[..OBJECT_ID_LENGTH])
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        let empty_tree = Tree::default();
        let empty_tree_id = tree_id(&empty_tree);
        let backend = MemoryBackend {
            empty_tree_id: empty_tree_id.clone(),
            blobs: Default::default(),
            trees: Default::default(),
        };
        backend
            .trees
            .write()
            .unwrap()
            .insert(empty_tree_id, empty_tree);
        backend
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend::new()
    }
}

impl Backend for MemoryBackend {
    fn read_blob(&self, id: &ObjectId) -> BackendResult<Vec<u8>> {
        self.blobs
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(id.hex()))
    }

    fn write_blob(&self, contents: &[u8]) -> BackendResult<ObjectId> {
        let id = blob_id(contents);
        self.blobs
            .write()
            .unwrap()
            .insert(id.clone(), contents.to_vec());
        Ok(id)
    }

    fn read_tree(&self, id: &ObjectId) -> BackendResult<Tree> {
        self.trees
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(id.hex()))
    }

    fn write_tree(&self, contents: &Tree) -> BackendResult<ObjectId> {
        let id = tree_id(contents);
        self.trees
            .write()
            .unwrap()
            .insert(id.clone(), contents.clone());
        Ok(id)
    }

    fn empty_tree_id(&self) -> &ObjectId {
        &self.empty_tree_id
    }
}

pub fn new_store() -> Arc<Store> {
    Store::new(Box::new(MemoryBackend::new()))
}

pub fn write_file(store: &Store, contents: &str) -> ObjectId {
    store.write_blob(contents.as_bytes()).unwrap()
}

/// Builds a tree (with subtrees) from `(path, contents)` pairs, all
/// regular files, and returns the root tree id.
pub fn create_tree(store: &Store, path_contents: &[(&str, &str)]) -> ObjectId {
    create_tree_with_modes(
        store,
        &path_contents
            .iter()
            .map(|&(path, contents)| (path, contents, FileMode::REGULAR_FILE))
            .collect::<Vec<_>>(),
    )
}

pub fn create_tree_with_modes(
    store: &Store,
    path_contents: &[(&str, &str, FileMode)],
) -> ObjectId {
    use std::collections::BTreeMap;

    use crate::repo_path::RepoPath;

    let mut trees: BTreeMap<RepoPath, Tree> =
        BTreeMap::from([(RepoPath::root(), Tree::default())]);
    for &(path, contents, mode) in path_contents {
        let path = RepoPath::from_internal_string(path);
        let (dir, basename) = path.split().unwrap();
        let mut ancestor = Some(dir.clone());
        while let Some(current) = ancestor {
            if !trees.contains_key(&current) {
                trees.insert(current.clone(), Tree::default());
            }
            ancestor = current.parent();
        }
        let id = store.write_blob(contents.as_bytes()).unwrap();
        trees
            .get_mut(&dir)
            .unwrap()
            .set(basename.to_owned(), TreeEntry { mode, id });
    }
    while let Some((dir, tree)) = trees.pop_last() {
        match dir.split() {
            Some((parent, basename)) => {
                let id = store.write_tree(&tree).unwrap();
                trees.get_mut(&parent).unwrap().set(
                    basename.to_owned(),
                    TreeEntry {
                        mode: FileMode::TREE,
                        id,
                    },
                );
            }
            None => return store.write_tree(&tree).unwrap(),
        }
    }
    unreachable!("trees must contain the root tree");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        let id = backend.write_blob(b"contents").unwrap();
        assert_eq!(backend.read_blob(&id).unwrap(), b"contents");
        assert_eq!(
            backend.read_blob(&blob_id(b"missing")),
            Err(BackendError::NotFound(blob_id(b"missing").hex()))
        );
    }

    #[test]
    fn test_create_tree_nested() {
        let store = new_store();
        let root_id = create_tree(&store, &[("a", "1"), ("d/e/f", "2")]);
        let root = store.get_tree(&root_id).unwrap();
        assert_eq!(root.entry("a").unwrap().id, blob_id(b"1"));
        let d = store.get_tree(&root.entry("d").unwrap().id).unwrap();
        let e = store.get_tree(&d.entry("e").unwrap().id).unwrap();
        assert_eq!(e.entry("f").unwrap().id, blob_id(b"2"));
    }

    #[test]
    fn test_create_tree_is_deterministic() {
        let store = new_store();
        let id1 = create_tree(&store, &[("a", "1"), ("b", "2")]);
        let id2 = create_tree(&store, &[("b", "2"), ("a", "1")]);
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_empty_tree_is_readable() {
        let store = new_store();
        let tree = store.get_tree(store.empty_tree_id()).unwrap();
        assert!(tree.is_empty());
    }
}

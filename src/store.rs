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

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::backend;
use crate::backend::{Backend, BackendResult, ObjectId, Tree};

/// Wraps the low-level backend and adds caching for trees, which the
/// walk loads repeatedly.
#[derive(Debug)]
pub struct Store {
    backend: Box<dyn Backend>,
    tree_cache: RwLock<HashMap<ObjectId, Arc<backend::Tree>>>,
}

impl Store {
    pub fn new(backend: Box<dyn Backend>) -> Arc<Self> {
        Arc::new(Store {
            backend,
            tree_cache: Default::default(),
        })
    }

    pub fn empty_tree_id(&self) -> &ObjectId {
        self.backend.empty_tree_id()
    }

    pub fn get_tree(&self, id: &ObjectId) -> BackendResult<Arc<Tree>> {
        {
            let read_locked_cache = self.tree_cache.read().unwrap();
            if let Some(data) = read_locked_cache.get(id).cloned() {
                return Ok(data);
            }
        }
        let data = Arc::new(self.backend.read_tree(id)?);
        let mut write_locked_cache = self.tree_cache.write().unwrap();
        write_locked_cache.insert(id.clone(), data.clone());
        Ok(data)
    }

    pub fn write_tree(&self, tree: &Tree) -> BackendResult<ObjectId> {
        let id = self.backend.write_tree(tree)?;
        let mut write_locked_cache = self.tree_cache.write().unwrap();
        write_locked_cache.insert(id.clone(), Arc::new(tree.clone()));
        Ok(id)
    }

    pub fn read_blob(&self, id: &ObjectId) -> BackendResult<Vec<u8>> {
        self.backend.read_blob(id)
    }

    pub fn write_blob(&self, contents: &[u8]) -> BackendResult<ObjectId> {
        self.backend.write_blob(contents)
    }

    /// The bytes behind an id, as consumed by the line-level merge. The
    /// zero id stands for an absent side and reads as empty.
    pub fn raw_text(&self, id: &ObjectId) -> BackendResult<Vec<u8>> {
        if id.is_zero() {
            Ok(vec![])
        } else {
            self.backend.read_blob(id)
        }
    }
}

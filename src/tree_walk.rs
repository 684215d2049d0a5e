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
use std::ops::Range;
use std::sync::Arc;

use crate::backend::{BackendResult, FileMode, ObjectId};
use crate::dircache::{DirCache, DirCacheEntry};
use crate::repo_path::RepoPath;
use crate::store::Store;
use crate::working_copy::{WorkFileState, WorktreeSnapshot};

/// The five sources a walk position draws from. Slots are not stages:
/// stages are index-entry slots 0..3, these index the walk inputs.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum WalkSlot {
    Base = 0,
    Ours = 1,
    Theirs = 2,
    Index = 3,
    Workdir = 4,
}

/// What one source has at the current position. An absent source has
/// mode 0 and the zero id. An index or workdir source whose entries lie
/// deeper than the position shows up as a tree with the zero id.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub mode: FileMode,
    pub id: ObjectId,
    pub dircache_entry: Option<DirCacheEntry>,
    pub work_state: Option<WorkFileState>,
}

impl SlotState {
    fn absent() -> SlotState {
        SlotState {
            mode: FileMode::MISSING,
            id: ObjectId::zero(),
            dircache_entry: None,
            work_state: None,
        }
    }

    fn phantom_dir() -> SlotState {
        SlotState {
            mode: FileMode::TREE,
            id: ObjectId::zero(),
            dircache_entry: None,
            work_state: None,
        }
    }
}

impl Default for SlotState {
    fn default() -> Self {
        SlotState::absent()
    }
}

/// One position of the walk: a path and the five aligned source states.
#[derive(Debug)]
pub struct WalkPosition {
    pub path: RepoPath,
    pub slots: [SlotState; 5],
    pub is_subtree: bool,
}

impl WalkPosition {
    pub fn mode(&self, slot: WalkSlot) -> FileMode {
        self.slots[slot as usize].mode
    }

    pub fn id(&self, slot: WalkSlot) -> &ObjectId {
        &self.slots[slot as usize].id
    }

    pub fn slot(&self, slot: WalkSlot) -> &SlotState {
        &self.slots[slot as usize]
    }

    pub fn id_equal(&self, s: WalkSlot, t: WalkSlot) -> bool {
        self.id(s) == self.id(t)
    }
}

#[derive(Default, Clone)]
struct MergedName {
    slots: [SlotState; 5],
    index_range: Range<usize>,
    work_range: Range<usize>,
}

struct Frame {
    dir: RepoPath,
    names: Vec<(String, MergedName)>,
    cursor: usize,
}

struct PendingSubtree {
    dir: RepoPath,
    tree_ids: [Option<ObjectId>; 3],
    index_range: Range<usize>,
    work_range: Range<usize>,
}

/// A synchronised pre-order walk over the three merge trees, the
/// dircache and an optional working-copy snapshot. Sources are aligned
/// by name, so a file and a directory with the same name occupy a single
/// position (the name-conflict case); `is_subtree` reports whether any
/// source has a tree there, and the caller decides descent with
/// `enter_subtree()` before the next `next()` call.
pub struct NameConflictWalk {
    store: Arc<Store>,
    index_entries: Vec<DirCacheEntry>,
    work_states: Vec<(RepoPath, WorkFileState)>,
    stack: Vec<Frame>,
    pending: Option<PendingSubtree>,
}

impl NameConflictWalk {
    pub fn new(
        store: Arc<Store>,
        base_tree: &ObjectId,
        our_tree: &ObjectId,
        their_tree: &ObjectId,
        dircache: &DirCache,
        worktree: Option<&WorktreeSnapshot>,
    ) -> BackendResult<NameConflictWalk> {
        let index_entries = dircache.entries().to_vec();
        let work_states: Vec<(RepoPath, WorkFileState)> = worktree
            .map(|snapshot| {
                snapshot
                    .states()
                    .iter()
                    .map(|(path, state)| (path.clone(), state.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let index_len = index_entries.len();
        let work_len = work_states.len();
        let mut walk = NameConflictWalk {
            store,
            index_entries,
            work_states,
            stack: vec![],
            pending: None,
        };
        let root = walk.build_frame(PendingSubtree {
            dir: RepoPath::root(),
            tree_ids: [
                present_tree(base_tree),
                present_tree(our_tree),
                present_tree(their_tree),
            ],
            index_range: 0..index_len,
            work_range: 0..work_len,
        })?;
        walk.stack.push(root);
        Ok(walk)
    }

    /// Advances to the next position. An un-entered subtree from the
    /// previous position is skipped.
    pub fn next(&mut self) -> BackendResult<Option<WalkPosition>> {
        self.pending = None;
        loop {
            let frame = match self.stack.last_mut() {
                None => return Ok(None),
                Some(frame) => frame,
            };
            if frame.cursor == frame.names.len() {
                self.stack.pop();
                continue;
            }
            let (name, merged) = frame.names[frame.cursor].clone();
            frame.cursor += 1;
            let path = frame.dir.join(&name);
            let is_subtree = merged.slots.iter().any(|slot| slot.mode.is_tree());
            if is_subtree {
                self.pending = Some(PendingSubtree {
                    dir: path.clone(),
                    tree_ids: [
                        subtree_id(&merged.slots[WalkSlot::Base as usize]),
                        subtree_id(&merged.slots[WalkSlot::Ours as usize]),
                        subtree_id(&merged.slots[WalkSlot::Theirs as usize]),
                    ],
                    index_range: merged.index_range.clone(),
                    work_range: merged.work_range.clone(),
                });
            }
            return Ok(Some(WalkPosition {
                path,
                slots: merged.slots,
                is_subtree,
            }));
        }
    }

    /// Descends into the subtree at the position `next()` just returned.
    pub fn enter_subtree(&mut self) -> BackendResult<()> {
        let pending = self
            .pending
            .take()
            .expect("enter_subtree() without a subtree position");
        let frame = self.build_frame(pending)?;
        self.stack.push(frame);
        Ok(())
    }

    fn build_frame(&self, pending: PendingSubtree) -> BackendResult<Frame> {
        let mut names: BTreeMap<String, MergedName> = BTreeMap::new();
        for (slot_index, maybe_id) in pending.tree_ids.iter().enumerate() {
            let Some(id) = maybe_id else { continue };
            let tree = self.store.get_tree(id)?;
            for (name, entry) in tree.entries() {
                let merged = names.entry(name.to_owned()).or_default();
                merged.slots[slot_index] = SlotState {
                    mode: entry.mode,
                    id: entry.id.clone(),
                    dircache_entry: None,
                    work_state: None,
                };
            }
        }

        let index_children = child_runs(
            &pending.dir,
            pending.index_range.clone(),
            |i| &self.index_entries[i].path,
        );
        for run in index_children {
            let merged = names.entry(run.name.clone()).or_default();
            merged.slots[WalkSlot::Index as usize] = match run.exact {
                Some(i) => {
                    let entry = &self.index_entries[i];
                    SlotState {
                        mode: entry.mode,
                        id: entry.id.clone(),
                        dircache_entry: Some(entry.clone()),
                        work_state: None,
                    }
                }
                None => SlotState::phantom_dir(),
            };
            merged.index_range = run.deeper;
        }

        let work_children = child_runs(
            &pending.dir,
            pending.work_range.clone(),
            |i| &self.work_states[i].0,
        );
        for run in work_children {
            let merged = names.entry(run.name.clone()).or_default();
            merged.slots[WalkSlot::Workdir as usize] = match run.exact {
                Some(i) => {
                    let state = &self.work_states[i].1;
                    SlotState {
                        mode: state.mode,
                        id: state.id.clone(),
                        dircache_entry: None,
                        work_state: Some(state.clone()),
                    }
                }
                None => SlotState::phantom_dir(),
            };
            merged.work_range = run.deeper;
        }

        Ok(Frame {
            dir: pending.dir,
            names: names.into_iter().collect(),
            cursor: 0,
        })
    }
}

fn present_tree(id: &ObjectId) -> Option<ObjectId> {
    (!id.is_zero()).then(|| id.clone())
}

fn subtree_id(slot: &SlotState) -> Option<ObjectId> {
    (slot.mode.is_tree() && !slot.id.is_zero()).then(|| slot.id.clone())
}

struct ChildRun {
    name: String,
    /// Position of the entry whose path is exactly `dir/name`, if any.
    /// Conflict stages sort together; the lowest stage wins the slot.
    exact: Option<usize>,
    /// The entries strictly below `dir/name`.
    deeper: Range<usize>,
}

/// Groups a sorted path range by the first component below `dir`. The
/// componentwise entry order makes each child's entries contiguous, with
/// exact-path entries before deeper ones.
fn child_runs<'a>(
    dir: &RepoPath,
    range: Range<usize>,
    path_at: impl Fn(usize) -> &'a RepoPath,
) -> Vec<ChildRun> {
    let mut runs = vec![];
    let mut i = range.start;
    while i < range.end {
        let name = child_component(dir, path_at(i)).to_owned();
        let child_path = dir.join(&name);
        let run_start = i;
        while i < range.end && child_path.contains(path_at(i)) {
            i += 1;
        }
        let mut deeper_start = run_start;
        while deeper_start < i && path_at(deeper_start) == &child_path {
            deeper_start += 1;
        }
        runs.push(ChildRun {
            name,
            exact: (deeper_start > run_start).then_some(run_start),
            deeper: deeper_start..i,
        });
    }
    runs
}

fn child_component<'a>(dir: &RepoPath, path: &'a RepoPath) -> &'a str {
    debug_assert!(dir.contains(path) && dir != path);
    let rest = if dir.is_root() {
        path.as_internal_str()
    } else {
        &path.as_internal_str()[dir.as_internal_str().len() + 1..]
    };
    match rest.find('/') {
        None => rest,
        Some(i) => &rest[..i],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MillisSinceEpoch;
    use crate::dircache::Stage;
    use crate::testutils::{create_tree, new_store};

    fn walk_paths(walk: &mut NameConflictWalk, enter_all: bool) -> Vec<(String, bool)> {
        let mut result = vec![];
        while let Some(position) = walk.next().unwrap() {
            result.push((
                position.path.as_internal_str().to_owned(),
                position.is_subtree,
            ));
            if position.is_subtree && enter_all {
                walk.enter_subtree().unwrap();
            }
        }
        result
    }

    #[test]
    fn test_walk_aligns_trees_by_name() {
        let store = new_store();
        let base = create_tree(&store, &[("a", "1"), ("d/x", "2")]);
        let ours = create_tree(&store, &[("a", "1"), ("b", "3")]);
        let theirs = create_tree(&store, &[("d/x", "2"), ("d/y", "4")]);
        let dircache = DirCache::in_memory();
        let mut walk =
            NameConflictWalk::new(store, &base, &ours, &theirs, &dircache, None).unwrap();
        assert_eq!(
            walk_paths(&mut walk, true),
            vec![
                ("a".to_owned(), false),
                ("b".to_owned(), false),
                ("d".to_owned(), true),
                ("d/x".to_owned(), false),
                ("d/y".to_owned(), false),
            ]
        );
    }

    #[test]
    fn test_walk_skips_unentered_subtree() {
        let store = new_store();
        let base = create_tree(&store, &[("d/x", "1"), ("e", "2")]);
        let empty = store.empty_tree_id().clone();
        let dircache = DirCache::in_memory();
        let mut walk =
            NameConflictWalk::new(store, &base, &empty, &empty, &dircache, None).unwrap();
        assert_eq!(
            walk_paths(&mut walk, false),
            vec![("d".to_owned(), true), ("e".to_owned(), false)]
        );
    }

    #[test]
    fn test_walk_file_vs_directory_is_one_position() {
        let store = new_store();
        let base = store.empty_tree_id().clone();
        let ours = create_tree(&store, &[("a", "file contents")]);
        let theirs = create_tree(&store, &[("a/nested", "dir contents")]);
        let dircache = DirCache::in_memory();
        let mut walk =
            NameConflictWalk::new(store, &base, &ours, &theirs, &dircache, None).unwrap();

        let position = walk.next().unwrap().unwrap();
        assert_eq!(position.path, RepoPath::from_internal_string("a"));
        assert!(position.is_subtree);
        assert!(position.mode(WalkSlot::Ours).is_non_tree());
        assert!(position.mode(WalkSlot::Theirs).is_tree());
        assert!(position.mode(WalkSlot::Base).is_missing());

        // Descending only sees the tree side.
        walk.enter_subtree().unwrap();
        let nested = walk.next().unwrap().unwrap();
        assert_eq!(nested.path, RepoPath::from_internal_string("a/nested"));
        assert!(nested.mode(WalkSlot::Ours).is_missing());
        assert!(nested.mode(WalkSlot::Theirs).is_non_tree());
    }

    #[test]
    fn test_walk_surfaces_index_only_paths() {
        let store = new_store();
        let empty = store.empty_tree_id().clone();
        let mut dircache = DirCache::in_memory();
        let mut builder = dircache.builder();
        builder.add(DirCacheEntry {
            path: RepoPath::from_internal_string("only/in/index"),
            stage: Stage::Merged,
            mode: FileMode::REGULAR_FILE,
            id: crate::backend::blob_id(b"x"),
            mtime: MillisSinceEpoch(0),
            size: 1,
        });
        dircache.finish(builder);

        let mut walk =
            NameConflictWalk::new(store, &empty, &empty, &empty, &dircache, None).unwrap();
        let position = walk.next().unwrap().unwrap();
        assert_eq!(position.path, RepoPath::from_internal_string("only"));
        assert!(position.is_subtree);
        assert!(position.mode(WalkSlot::Index).is_tree());
        walk.enter_subtree().unwrap();
        let position = walk.next().unwrap().unwrap();
        assert_eq!(position.path, RepoPath::from_internal_string("only/in"));
        walk.enter_subtree().unwrap();
        let position = walk.next().unwrap().unwrap();
        assert_eq!(
            position.path,
            RepoPath::from_internal_string("only/in/index")
        );
        assert!(position.mode(WalkSlot::Index).is_non_tree());
        assert!(position.slot(WalkSlot::Index).dircache_entry.is_some());
        assert!(walk.next().unwrap().is_none());
    }

    #[test]
    fn test_walk_index_conflict_stages_surface_lowest() {
        let store = new_store();
        let empty = store.empty_tree_id().clone();
        let mut dircache = DirCache::in_memory();
        let mut builder = dircache.builder();
        for (stage, contents) in [(Stage::Base, "b"), (Stage::Ours, "o")] {
            builder.add(DirCacheEntry {
                path: RepoPath::from_internal_string("f"),
                stage,
                mode: FileMode::REGULAR_FILE,
                id: crate::backend::blob_id(contents.as_bytes()),
                mtime: MillisSinceEpoch(0),
                size: 1,
            });
        }
        dircache.finish(builder);

        let mut walk =
            NameConflictWalk::new(store, &empty, &empty, &empty, &dircache, None).unwrap();
        let position = walk.next().unwrap().unwrap();
        let entry = position.slot(WalkSlot::Index).dircache_entry.clone().unwrap();
        assert_eq!(entry.stage, Stage::Base);
    }
}

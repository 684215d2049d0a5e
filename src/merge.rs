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
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::backend::{BackendError, FileMode, MillisSinceEpoch, ObjectId};
use crate::dircache::{DirCache, DirCacheBuilder, DirCacheEntry, DirCacheError, Stage};
use crate::files;
use crate::files::MergeResult;
use crate::repo_path::RepoPath;
use crate::store::Store;
use crate::tree_walk::{NameConflictWalk, SlotState, WalkPosition, WalkSlot};
use crate::working_copy;
use crate::working_copy::{WorkingCopyError, WorktreeSnapshot};

/// Merges three file modes for one path. Returns the mode both sides can
/// agree on, or `MISSING` to signal a mode conflict.
pub fn merge_modes(base: FileMode, ours: FileMode, theirs: FileMode) -> FileMode {
    if ours == theirs {
        ours
    } else if base == ours {
        // Ours deleted and theirs changed the mode: pick the change.
        if theirs == FileMode::MISSING {
            ours
        } else {
            theirs
        }
    } else if base == theirs {
        if ours == FileMode::MISSING {
            theirs
        } else {
            ours
        }
    } else {
        FileMode::MISSING
    }
}

/// The side an auto-resolving filter picks for a conflicted path.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MergeSide {
    Ours,
    Theirs,
}

pub type MergeFilter = Box<dyn Fn(&RepoPath) -> MergeSide>;

/// Why a merge was aborted. Distinct from a conflict: a conflicted merge
/// completes and records stages, a failing merge gives up.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FailureReason {
    DirtyIndex,
    DirtyWorktree,
    CouldNotDelete,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    DirCache(#[from] DirCacheError),
    #[error(transparent)]
    WorkingCopy(#[from] WorkingCopyError),
    #[error("Failed to write the merged index: {0}")]
    IndexWrite(#[source] DirCacheError),
    #[error("{message}: {err}")]
    Io {
        message: String,
        #[source]
        err: std::io::Error,
    },
}

/// The output of writing merged content: the bytes that went out and the
/// stat data the index entry needs.
struct MergedOutput {
    bytes: Vec<u8>,
    mtime: MillisSinceEpoch,
}

/// A three-way tree merger over a content-addressed store, an index and
/// an optional working copy. One instance performs one merge.
///
/// The merger walks the three trees (plus the index and the working-copy
/// snapshot) in lock-step, decides each path with a fixed case order,
/// stages trivial results at stage 0, records conflicts at stages 1/2/3,
/// and materialises or deletes working-copy files after the walk. A
/// dirty index or working copy aborts the merge instead of conflicting
/// it.
pub struct ResolveMerger {
    store: Arc<Store>,
    in_core: bool,
    dircache: Option<DirCache>,
    dircache_path: Option<PathBuf>,
    implicit_dircache: bool,
    worktree: Option<WorktreeSnapshot>,
    commit_names: [String; 3],
    merge_filter: Option<MergeFilter>,
    // Fixed at construction; not swappable mid-merge.
    merge_algorithm: fn(&[u8], &[u8], &[u8]) -> MergeResult,

    builder: DirCacheBuilder,
    to_be_checked_out: BTreeMap<RepoPath, DirCacheEntry>,
    to_be_deleted: Vec<RepoPath>,
    modified_files: Vec<RepoPath>,
    unmerged_paths: Vec<RepoPath>,
    merge_results: BTreeMap<RepoPath, MergeResult>,
    failing_paths: BTreeMap<RepoPath, FailureReason>,
    enter_subtree: bool,
    result_tree: Option<ObjectId>,
}

impl ResolveMerger {
    pub fn new(store: Arc<Store>, in_core: bool) -> ResolveMerger {
        ResolveMerger {
            store,
            in_core,
            dircache: None,
            dircache_path: None,
            implicit_dircache: false,
            worktree: None,
            commit_names: [
                "BASE".to_string(),
                "OURS".to_string(),
                "THEIRS".to_string(),
            ],
            merge_filter: None,
            merge_algorithm: files::merge,
            builder: DirCacheBuilder::default(),
            to_be_checked_out: BTreeMap::new(),
            to_be_deleted: vec![],
            modified_files: vec![],
            unmerged_paths: vec![],
            merge_results: BTreeMap::new(),
            failing_paths: BTreeMap::new(),
            enter_subtree: true,
            result_tree: None,
        }
    }

    /// Uses a dircache the caller already holds (typically pre-locked).
    /// Without this, `merge()` locks the dircache at the configured path
    /// itself and releases it on every exit path.
    pub fn set_dircache(&mut self, dircache: DirCache) {
        self.dircache = Some(dircache);
    }

    pub fn set_dircache_path(&mut self, path: PathBuf) {
        self.dircache_path = Some(path);
    }

    /// Supplies the working-copy snapshot. Without one, every dirty
    /// check treats the working copy as clean and merged content is
    /// spilled the in-core way.
    pub fn set_worktree(&mut self, worktree: WorktreeSnapshot) {
        self.worktree = Some(worktree);
    }

    /// Names written into conflict markers, as (base, ours, theirs).
    pub fn set_commit_names(&mut self, names: [String; 3]) {
        self.commit_names = names;
    }

    /// An automatic conflict resolver: conflicted paths take the chosen
    /// side at stage 0 instead of staging the conflict, and a dirty
    /// working-copy file no longer aborts the merge.
    pub fn set_merge_filter(&mut self, filter: impl Fn(&RepoPath) -> MergeSide + 'static) {
        self.merge_filter = Some(Box::new(filter));
    }

    pub fn result_tree_id(&self) -> Option<&ObjectId> {
        self.result_tree.as_ref()
    }

    pub fn unmerged_paths(&self) -> &[RepoPath] {
        &self.unmerged_paths
    }

    pub fn modified_files(&self) -> &[RepoPath] {
        &self.modified_files
    }

    pub fn to_be_checked_out(&self) -> &BTreeMap<RepoPath, DirCacheEntry> {
        &self.to_be_checked_out
    }

    pub fn merge_results(&self) -> &BTreeMap<RepoPath, MergeResult> {
        &self.merge_results
    }

    pub fn failing_paths(&self) -> &BTreeMap<RepoPath, FailureReason> {
        &self.failing_paths
    }

    pub fn failed(&self) -> bool {
        !self.failing_paths.is_empty()
    }

    /// The dircache the merge wrote into, for callers that want to
    /// inspect the staged entries.
    pub fn dircache(&self) -> Option<&DirCache> {
        self.dircache.as_ref()
    }

    /// Merges `our_tree` and `their_tree` against `base_tree`. Returns
    /// true when the merge fully resolved and a result tree was written;
    /// false when paths conflicted or the merge aborted on a dirty
    /// index/working copy.
    #[instrument(skip_all)]
    pub fn merge(
        &mut self,
        base_tree: &ObjectId,
        our_tree: &ObjectId,
        their_tree: &ObjectId,
    ) -> Result<bool, MergeError> {
        let result = self.merge_inner(base_tree, our_tree, their_tree);
        if self.implicit_dircache {
            if let Some(dircache) = &mut self.dircache {
                dircache.unlock();
            }
        }
        result
    }

    fn merge_inner(
        &mut self,
        base_tree: &ObjectId,
        our_tree: &ObjectId,
        their_tree: &ObjectId,
    ) -> Result<bool, MergeError> {
        if self.dircache.is_none() {
            match (&self.dircache_path, self.in_core) {
                (Some(path), false) => {
                    self.dircache = Some(DirCache::lock_and_read(path.clone())?);
                    self.implicit_dircache = true;
                }
                _ => self.dircache = Some(DirCache::in_memory()),
            }
        }
        self.builder = self.dircache.as_ref().unwrap().builder();

        let mut walk = NameConflictWalk::new(
            self.store.clone(),
            base_tree,
            our_tree,
            their_tree,
            self.dircache.as_ref().unwrap(),
            self.worktree.as_ref(),
        )?;
        while let Some(position) = walk.next()? {
            self.enter_subtree = true;
            if !self.process_entry(&position)? {
                self.clean_up()?;
                return Ok(false);
            }
            if position.is_subtree && self.enter_subtree {
                walk.enter_subtree()?;
            }
        }
        drop(walk);

        let builder = std::mem::take(&mut self.builder);
        if self.in_core {
            self.dircache.as_mut().unwrap().finish(builder);
        } else {
            self.checkout()?;
            if let Err(err) = self.dircache.as_mut().unwrap().commit(builder) {
                self.clean_up()?;
                return Err(MergeError::IndexWrite(err));
            }
        }

        if self.unmerged_paths.is_empty() && !self.failed() {
            let tree = self.dircache.as_ref().unwrap().write_tree(&self.store)?;
            self.result_tree = Some(tree);
            debug!(tree = ?self.result_tree, "merge fully resolved");
            Ok(true)
        } else {
            debug!(
                unmerged = self.unmerged_paths.len(),
                failing = self.failing_paths.len(),
                "merge did not fully resolve"
            );
            Ok(false)
        }
    }

    /// Decides one walk position. Returns false to abort the merge.
    fn process_entry(&mut self, position: &WalkPosition) -> Result<bool, MergeError> {
        let mode_b = position.mode(WalkSlot::Base);
        let mode_o = position.mode(WalkSlot::Ours);
        let mode_t = position.mode(WalkSlot::Theirs);
        let path = &position.path;

        // The entry that keeps OURS in the index: the current index
        // entry when there is one, else one made up from the tree.
        let our_dce: Option<DirCacheEntry> = match &position.slot(WalkSlot::Index).dircache_entry {
            Some(entry) => Some(entry.clone()),
            None if mode_o.is_non_tree() => Some(DirCacheEntry {
                path: path.clone(),
                stage: Stage::Merged,
                mode: mode_o,
                id: position.id(WalkSlot::Ours).clone(),
                mtime: MillisSinceEpoch(0),
                size: 0,
            }),
            None => None,
        };

        // A position none of the three trees has: a phantom produced by
        // name-conflict alignment or by index/workdir-only paths.
        if mode_b.is_missing() && mode_o.is_missing() && mode_t.is_missing() {
            return Ok(true);
        }

        if self.index_dirty(position) {
            debug!(path = path.as_internal_str(), "aborting: dirty index");
            return Ok(false);
        }

        // Identical blobs on both sides; at most the modes disagree.
        if mode_o.is_non_tree()
            && mode_t.is_non_tree()
            && position.id_equal(WalkSlot::Ours, WalkSlot::Theirs)
        {
            if mode_o == mode_t {
                self.keep(our_dce.expect("non-tree OURS implies an index entry"));
                return Ok(true);
            }
            let new_mode = merge_modes(mode_b, mode_o, mode_t);
            if new_mode != FileMode::MISSING {
                if new_mode == mode_o {
                    self.keep(our_dce.expect("non-tree OURS implies an index entry"));
                } else {
                    // The merged mode comes from THEIRS; the working
                    // copy must not hide local edits.
                    if self.worktree_dirty(position) {
                        return Ok(self.rescue_or_fail(position, &our_dce));
                    }
                    if let Some(entry) =
                        self.add(path, position.slot(WalkSlot::Theirs), Stage::Merged)
                    {
                        self.to_be_checked_out.insert(path.clone(), entry);
                    }
                }
            } else if self.merge_filter.is_some() {
                self.apply_filter_choice(position, &our_dce);
            } else {
                // Modes cannot be merged: stage all three sides. The
                // recorded result is empty but present; consumers rely
                // on the key existing.
                self.add(path, position.slot(WalkSlot::Base), Stage::Base);
                self.add(path, position.slot(WalkSlot::Ours), Stage::Ours);
                self.add(path, position.slot(WalkSlot::Theirs), Stage::Theirs);
                self.unmerged_paths.push(path.clone());
                self.merge_results
                    .insert(path.clone(), MergeResult::empty());
            }
            return Ok(true);
        }

        // THEIRS did not change the path: OURS wins as-is.
        if mode_o.is_non_tree()
            && mode_b == mode_t
            && position.id_equal(WalkSlot::Base, WalkSlot::Theirs)
        {
            self.keep(our_dce.expect("non-tree OURS implies an index entry"));
            return Ok(true);
        }

        // OURS did not change the path: take THEIRS, whatever it did.
        if mode_b == mode_o && position.id_equal(WalkSlot::Base, WalkSlot::Ours) {
            if self.worktree_dirty(position) {
                return Ok(self.rescue_or_fail(position, &our_dce));
            }
            if mode_t.is_non_tree() {
                if let Some(entry) = self.add(path, position.slot(WalkSlot::Theirs), Stage::Merged)
                {
                    self.to_be_checked_out.insert(path.clone(), entry);
                }
            } else if mode_t.is_missing() && !mode_b.is_missing() {
                // THEIRS deleted the path.
                self.to_be_deleted.push(path.clone());
            }
            return Ok(true);
        }

        // A file collides with a directory of the same name.
        if position.is_subtree {
            if mode_o.is_non_tree() && !mode_t.is_non_tree() {
                if mode_b.is_non_tree() {
                    self.add(path, position.slot(WalkSlot::Base), Stage::Base);
                }
                self.add(path, position.slot(WalkSlot::Ours), Stage::Ours);
                self.unmerged_paths.push(path.clone());
                self.enter_subtree = false;
                return Ok(true);
            }
            if mode_t.is_non_tree() && !mode_o.is_non_tree() {
                if mode_b.is_non_tree() {
                    self.add(path, position.slot(WalkSlot::Base), Stage::Base);
                }
                self.add(path, position.slot(WalkSlot::Theirs), Stage::Theirs);
                self.unmerged_paths.push(path.clone());
                self.enter_subtree = false;
                return Ok(true);
            }
            if !mode_o.is_non_tree() {
                // Trees on both sides (or one side absent): descend.
                return Ok(true);
            }
            // Both sides are files and only the base is a tree: treat it
            // as a content merge with an empty base.
        }

        // Both sides are files with differing content.
        if mode_o.is_non_tree() && mode_t.is_non_tree() {
            if self.worktree_dirty(position) {
                return Ok(self.rescue_or_fail(position, &our_dce));
            }
            if mode_o.is_gitlink() || mode_t.is_gitlink() {
                // Nested-repository pointers are never content-merged.
                self.add(path, position.slot(WalkSlot::Base), Stage::Base);
                self.add(path, position.slot(WalkSlot::Ours), Stage::Ours);
                self.add(path, position.slot(WalkSlot::Theirs), Stage::Theirs);
                self.unmerged_paths.push(path.clone());
                return Ok(true);
            }
            let result = self.content_merge(position)?;
            let has_conflicts = result.has_conflicts();
            if has_conflicts && self.merge_filter.is_some() {
                self.apply_filter_choice(position, &our_dce);
                return Ok(true);
            }
            let of = self.write_merged_file(path, &result)?;
            self.update_index(position, result, of)?;
            if has_conflicts {
                self.unmerged_paths.push(path.clone());
            }
            if !self.modified_files.contains(path) {
                self.modified_files.push(path.clone());
            }
            return Ok(true);
        }

        // Exactly one side deleted the path while the other changed it.
        if mode_o != mode_t {
            let modify_delete = (!mode_o.is_missing()
                && !position.id_equal(WalkSlot::Base, WalkSlot::Ours))
                || (!mode_t.is_missing() && !position.id_equal(WalkSlot::Base, WalkSlot::Theirs));
            if modify_delete {
                if self.merge_filter.is_some() {
                    self.apply_filter_choice(position, &our_dce);
                    return Ok(true);
                }
                if mode_o.is_missing() && self.worktree_dirty(position) {
                    self.failing_paths
                        .insert(path.clone(), FailureReason::DirtyWorktree);
                    debug!(path = path.as_internal_str(), "aborting: dirty worktree");
                    return Ok(false);
                }
                self.add(path, position.slot(WalkSlot::Base), Stage::Base);
                self.add(path, position.slot(WalkSlot::Ours), Stage::Ours);
                let their_entry = self.add(path, position.slot(WalkSlot::Theirs), Stage::Theirs);
                if mode_o.is_missing() {
                    // OURS deleted it: surface THEIRS in the working
                    // copy so the user sees what to resolve against.
                    if let Some(entry) = their_entry {
                        self.to_be_checked_out.insert(path.clone(), entry);
                    }
                }
                self.unmerged_paths.push(path.clone());
                let result = self.content_merge(position)?;
                self.merge_results.insert(path.clone(), result);
            }
            return Ok(true);
        }

        // Deleted on both sides, or otherwise nothing left to record.
        Ok(true)
    }

    /// The index must faithfully represent OURS: anything else staged
    /// there would silently fold into the merge result.
    fn index_dirty(&mut self, position: &WalkPosition) -> bool {
        let mode_i = position.mode(WalkSlot::Index);
        let mode_o = position.mode(WalkSlot::Ours);
        let dirty = mode_i.is_non_tree()
            && !(mode_i == mode_o && position.id_equal(WalkSlot::Index, WalkSlot::Ours));
        if dirty {
            self.failing_paths
                .insert(position.path.clone(), FailureReason::DirtyIndex);
        }
        dirty
    }

    /// Whether the working-copy file diverges from OURS. Does not record
    /// a failure; the caller does that only when no filter rescues the
    /// path.
    fn worktree_dirty(&self, position: &WalkPosition) -> bool {
        if self.in_core {
            return false;
        }
        let Some(work) = &position.slot(WalkSlot::Workdir).work_state else {
            return false;
        };
        let mode_o = position.mode(WalkSlot::Ours);
        work.mode_differs(mode_o)
            || (position.mode(WalkSlot::Workdir).is_non_tree()
                && !position.id_equal(WalkSlot::Workdir, WalkSlot::Ours))
    }

    /// The dirty-worktree escape hatch: a filter picks a side and the
    /// merge goes on; without one the path is recorded as failing.
    fn rescue_or_fail(&mut self, position: &WalkPosition, our_dce: &Option<DirCacheEntry>) -> bool {
        if self.merge_filter.is_some() {
            debug!(
                path = position.path.as_internal_str(),
                "dirty worktree rescued by merge filter"
            );
            self.apply_filter_choice(position, our_dce);
            true
        } else {
            self.failing_paths
                .insert(position.path.clone(), FailureReason::DirtyWorktree);
            debug!(
                path = position.path.as_internal_str(),
                "aborting: dirty worktree"
            );
            false
        }
    }

    fn apply_filter_choice(&mut self, position: &WalkPosition, our_dce: &Option<DirCacheEntry>) {
        let filter = self.merge_filter.as_ref().expect("filter must be set");
        let side = filter(&position.path);
        debug!(path = position.path.as_internal_str(), ?side, "filter resolved conflict");
        match side {
            MergeSide::Ours => {
                if let Some(entry) = our_dce {
                    self.keep(entry.clone());
                }
            }
            MergeSide::Theirs => {
                if let Some(entry) = self.add(
                    &position.path,
                    position.slot(WalkSlot::Theirs),
                    Stage::Merged,
                ) {
                    self.to_be_checked_out
                        .insert(position.path.clone(), entry);
                }
            }
        }
    }

    /// Stages a new entry copied from a walk slot. No-op for absent or
    /// tree slots.
    fn add(&mut self, path: &RepoPath, slot: &SlotState, stage: Stage) -> Option<DirCacheEntry> {
        if !slot.mode.is_non_tree() {
            return None;
        }
        let entry = DirCacheEntry {
            path: path.clone(),
            stage,
            mode: slot.mode,
            id: slot.id.clone(),
            mtime: MillisSinceEpoch(0),
            size: 0,
        };
        self.builder.add(entry.clone());
        Some(entry)
    }

    /// Carries an existing index entry over unchanged.
    fn keep(&mut self, entry: DirCacheEntry) {
        self.builder.add(entry);
    }

    /// Runs the configured line-level algorithm over the three sides,
    /// reading each side's bytes (empty when the slot carries no blob).
    fn content_merge(&self, position: &WalkPosition) -> Result<MergeResult, MergeError> {
        let read = |slot: WalkSlot| -> Result<Vec<u8>, MergeError> {
            if position.mode(slot).is_non_tree() {
                Ok(self.store.raw_text(position.id(slot))?)
            } else {
                Ok(vec![])
            }
        };
        let base = read(WalkSlot::Base)?;
        let ours = read(WalkSlot::Ours)?;
        let theirs = read(WalkSlot::Theirs)?;
        Ok((self.merge_algorithm)(&base, &ours, &theirs))
    }

    /// Renders the merge (markers included on conflict) into the working
    /// copy, or into a temporary spill file in-core. In-core conflicts
    /// produce nothing: a conflicted blob must never enter the store.
    fn write_merged_file(
        &self,
        path: &RepoPath,
        result: &MergeResult,
    ) -> Result<Option<MergedOutput>, MergeError> {
        let mut bytes = vec![];
        files::materialize(result, &self.commit_names, &mut bytes).map_err(|err| {
            MergeError::Io {
                message: format!("Failed to render merged content for {path:?}"),
                err,
            }
        })?;
        match &self.worktree {
            Some(worktree) if !self.in_core => {
                let mtime = working_copy::write_merged_bytes(worktree.root(), path, &bytes)?;
                Ok(Some(MergedOutput { bytes, mtime }))
            }
            _ => {
                if result.has_conflicts() {
                    return Ok(None);
                }
                let mut temp_file = NamedTempFile::new().map_err(|err| MergeError::Io {
                    message: "Failed to create temporary merge output".to_string(),
                    err,
                })?;
                temp_file
                    .as_file_mut()
                    .write_all(&bytes)
                    .map_err(|err| MergeError::Io {
                        message: "Failed to write temporary merge output".to_string(),
                        err,
                    })?;
                let metadata = temp_file.as_file().metadata().map_err(|err| MergeError::Io {
                    message: "Failed to stat temporary merge output".to_string(),
                    err,
                })?;
                let mtime = metadata
                    .modified()
                    .ok()
                    .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|duration| MillisSinceEpoch(duration.as_millis() as i64))
                    .unwrap_or(MillisSinceEpoch(0));
                // The spill file is deleted when `temp_file` drops; the
                // bytes live on for the blob insertion.
                Ok(Some(MergedOutput { bytes, mtime }))
            }
        }
    }

    /// Folds a content-merge outcome into the index: stages 1/2/3 on
    /// conflict, else a fresh stage-0 entry whose blob is the merged
    /// content.
    fn update_index(
        &mut self,
        position: &WalkPosition,
        result: MergeResult,
        of: Option<MergedOutput>,
    ) -> Result<(), MergeError> {
        let path = &position.path;
        if result.has_conflicts() {
            self.add(path, position.slot(WalkSlot::Base), Stage::Base);
            self.add(path, position.slot(WalkSlot::Ours), Stage::Ours);
            self.add(path, position.slot(WalkSlot::Theirs), Stage::Theirs);
            self.merge_results.insert(path.clone(), result);
            return Ok(());
        }
        let of = of.expect("a clean merge always produces output");
        let mut mode = merge_modes(
            position.mode(WalkSlot::Base),
            position.mode(WalkSlot::Ours),
            position.mode(WalkSlot::Theirs),
        );
        if mode.is_missing() {
            mode = FileMode::REGULAR_FILE;
        }
        let id = self.store.write_blob(&of.bytes)?;
        let entry = DirCacheEntry {
            path: path.clone(),
            stage: Stage::Merged,
            mode,
            id,
            mtime: of.mtime,
            size: of.bytes.len() as u64,
        };
        self.builder.add(entry.clone());
        self.to_be_checked_out.insert(path.clone(), entry);
        Ok(())
    }

    /// Materialises the scheduled checkouts, then replays the deletions
    /// in reverse so `dir/file` goes before `dir`.
    fn checkout(&mut self) -> Result<(), MergeError> {
        let Some(worktree) = &self.worktree else {
            return Ok(());
        };
        let root = worktree.root().to_owned();
        for (path, entry) in &self.to_be_checked_out {
            working_copy::write_entry(&self.store, &root, entry)?;
            if !self.modified_files.contains(path) {
                self.modified_files.push(path.clone());
            }
        }
        for path in self.to_be_deleted.iter().rev() {
            match working_copy::delete_path(&root, path) {
                Ok(()) => {
                    if !self.modified_files.contains(path) {
                        self.modified_files.push(path.clone());
                    }
                }
                Err(err) => {
                    debug!(path = path.as_internal_str(), ?err, "could not delete");
                    self.failing_paths
                        .insert(path.clone(), FailureReason::CouldNotDelete);
                }
            }
        }
        Ok(())
    }

    /// Reverts everything the merge touched in the working copy back to
    /// the current index. In-core there is nothing to revert.
    fn clean_up(&mut self) -> Result<(), MergeError> {
        if self.in_core {
            self.modified_files.clear();
            return Ok(());
        }
        let Some(worktree) = &self.worktree else {
            self.modified_files.clear();
            return Ok(());
        };
        let root = worktree.root().to_owned();
        let index_entries: Vec<DirCacheEntry> = match self
            .dircache
            .as_ref()
            .and_then(|dircache| dircache.backing_path().map(|path| path.to_owned()))
        {
            Some(path) => DirCache::read(path)?.entries().to_vec(),
            None => self
                .dircache
                .as_ref()
                .map(|dircache| dircache.entries().to_vec())
                .unwrap_or_default(),
        };
        while let Some(path) = self.modified_files.first().cloned() {
            if let Some(entry) = index_entries
                .iter()
                .find(|entry| entry.path == path && entry.stage == Stage::Merged)
            {
                if entry.mode.is_non_tree() {
                    working_copy::write_entry(&self.store, &root, entry)?;
                }
            }
            self.modified_files.remove(0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODES: [FileMode; 5] = [
        FileMode::MISSING,
        FileMode::REGULAR_FILE,
        FileMode::EXECUTABLE_FILE,
        FileMode::SYMLINK,
        FileMode::GITLINK,
    ];

    #[test]
    fn test_merge_modes_agreement() {
        for mode in MODES {
            assert_eq!(merge_modes(FileMode::REGULAR_FILE, mode, mode), mode);
        }
    }

    #[test]
    fn test_merge_modes_one_side_changed() {
        assert_eq!(
            merge_modes(
                FileMode::REGULAR_FILE,
                FileMode::REGULAR_FILE,
                FileMode::EXECUTABLE_FILE
            ),
            FileMode::EXECUTABLE_FILE
        );
        assert_eq!(
            merge_modes(
                FileMode::REGULAR_FILE,
                FileMode::EXECUTABLE_FILE,
                FileMode::REGULAR_FILE
            ),
            FileMode::EXECUTABLE_FILE
        );
    }

    #[test]
    fn test_merge_modes_deletion_does_not_win_over_change() {
        // One side deleted, the other changed the mode: the change wins.
        assert_eq!(
            merge_modes(
                FileMode::REGULAR_FILE,
                FileMode::REGULAR_FILE,
                FileMode::MISSING
            ),
            FileMode::REGULAR_FILE
        );
        assert_eq!(
            merge_modes(
                FileMode::REGULAR_FILE,
                FileMode::MISSING,
                FileMode::REGULAR_FILE
            ),
            FileMode::REGULAR_FILE
        );
    }

    #[test]
    fn test_merge_modes_conflict() {
        assert_eq!(
            merge_modes(
                FileMode::REGULAR_FILE,
                FileMode::EXECUTABLE_FILE,
                FileMode::SYMLINK
            ),
            FileMode::MISSING
        );
    }

    #[test]
    fn test_merge_modes_commutative_in_sides() {
        for base in MODES {
            for ours in MODES {
                for theirs in MODES {
                    assert_eq!(
                        merge_modes(base, ours, theirs),
                        merge_modes(base, theirs, ours),
                        "not commutative for {base:?} {ours:?} {theirs:?}",
                    );
                }
            }
        }
    }
}

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

use std::fmt::{Debug, Error, Formatter};
use std::io::Write;
use std::ops::Range;

use itertools::Itertools;

use crate::diff::{find_lines, matching_ranges, MatchedRange};

#[derive(PartialEq, Eq, Clone)]
pub enum MergeHunk {
    Resolved(Vec<u8>),
    Conflict {
        base: Vec<u8>,
        ours: Vec<u8>,
        theirs: Vec<u8>,
    },
}

impl Debug for MergeHunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        match self {
            MergeHunk::Resolved(data) => f
                .debug_tuple("Resolved")
                .field(&String::from_utf8_lossy(data))
                .finish(),
            MergeHunk::Conflict { base, ours, theirs } => f
                .debug_struct("Conflict")
                .field("base", &String::from_utf8_lossy(base))
                .field("ours", &String::from_utf8_lossy(ours))
                .field("theirs", &String::from_utf8_lossy(theirs))
                .finish(),
        }
    }
}

#[derive(PartialEq, Eq, Clone)]
pub enum MergeResult {
    Resolved(Vec<u8>),
    Conflict(Vec<MergeHunk>),
}

impl MergeResult {
    /// The keyed-but-contentless result recorded for conflicts that never
    /// reach the line level (e.g. unmergeable modes). Consumers rely on
    /// the map key being present.
    pub fn empty() -> Self {
        MergeResult::Conflict(vec![])
    }

    pub fn has_conflicts(&self) -> bool {
        matches!(self, MergeResult::Conflict(_))
    }
}

impl Debug for MergeResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        match self {
            MergeResult::Resolved(data) => f
                .debug_tuple("Resolved")
                .field(&String::from_utf8_lossy(data))
                .finish(),
            MergeResult::Conflict(hunks) => f.debug_tuple("Conflict").field(hunks).finish(),
        }
    }
}

/// A maximal run of lines one side changed: `base` is the replaced base
/// range, `side` what that side put there. Either range may be empty
/// (pure insertion or deletion), never both.
#[derive(Debug, PartialEq, Eq, Clone)]
struct ChangedRange {
    base: Range<usize>,
    side: Range<usize>,
}

/// The gaps between matched ranges.
fn changed_ranges(
    blocks: &[MatchedRange],
    base_len: usize,
    side_len: usize,
) -> Vec<ChangedRange> {
    let mut hunks = vec![];
    let mut prev_base = 0;
    let mut prev_side = 0;
    for block in blocks {
        if block.left.start != prev_base || block.right.start != prev_side {
            hunks.push(ChangedRange {
                base: prev_base..block.left.start,
                side: prev_side..block.right.start,
            });
        }
        prev_base = block.left.end;
        prev_side = block.right.end;
    }
    if base_len != prev_base || side_len != prev_side {
        hunks.push(ChangedRange {
            base: prev_base..base_len,
            side: prev_side..side_len,
        });
    }
    hunks
}

/// Whether two changed base ranges step on each other. Touching at a
/// boundary does not: edits to adjacent lines merge cleanly. A pure
/// insertion collides only with a change it falls strictly inside of,
/// or with another insertion at the same spot.
fn ranges_collide(a: &Range<usize>, b: &Range<usize>) -> bool {
    match (a.is_empty(), b.is_empty()) {
        (false, false) => a.start < b.end && b.start < a.end,
        (true, false) => b.start < a.start && a.start < b.end,
        (false, true) => a.start < b.start && b.start < a.end,
        (true, true) => a.start == b.start,
    }
}

/// One region of the base that at least one side changed, with the
/// participating hunks of each side.
#[derive(Debug)]
struct ChangeRegion {
    base: Range<usize>,
    ours: Vec<ChangedRange>,
    theirs: Vec<ChangedRange>,
}

fn coalesce_regions(
    our_hunks: Vec<ChangedRange>,
    their_hunks: Vec<ChangedRange>,
) -> Vec<ChangeRegion> {
    enum Side {
        Ours,
        Theirs,
    }
    let mut events: Vec<(Side, ChangedRange)> = our_hunks
        .into_iter()
        .map(|hunk| (Side::Ours, hunk))
        .chain(their_hunks.into_iter().map(|hunk| (Side::Theirs, hunk)))
        .collect_vec();
    events.sort_by_key(|(_, hunk)| (hunk.base.start, hunk.base.end));

    let mut regions: Vec<ChangeRegion> = vec![];
    for (side, hunk) in events {
        match regions.last_mut() {
            Some(last) if ranges_collide(&last.base, &hunk.base) => {
                last.base = last.base.start.min(hunk.base.start)
                    ..last.base.end.max(hunk.base.end);
                match side {
                    Side::Ours => last.ours.push(hunk),
                    Side::Theirs => last.theirs.push(hunk),
                }
            }
            _ => {
                let mut region = ChangeRegion {
                    base: hunk.base.clone(),
                    ours: vec![],
                    theirs: vec![],
                };
                match side {
                    Side::Ours => region.ours.push(hunk),
                    Side::Theirs => region.theirs.push(hunk),
                }
                regions.push(region);
            }
        }
    }
    regions
}

/// The side's line range corresponding to a region of the base. Outside
/// its own hunks a side tracks the base one to one, so the region's own
/// hunks (when present) pin the range exactly; otherwise the enclosing
/// matched range does.
fn side_range(
    region_base: &Range<usize>,
    hunks: &[ChangedRange],
    blocks: &[MatchedRange],
    all_hunks: &[ChangedRange],
) -> Range<usize> {
    if let (Some(first), Some(last)) = (hunks.first(), hunks.last()) {
        let start = first.side.start - (first.base.start - region_base.start);
        let end = last.side.end + (region_base.end - last.base.end);
        return start..end;
    }
    if let Some(block) = blocks
        .iter()
        .find(|b| b.left.start <= region_base.start && region_base.end <= b.left.end)
    {
        let start = block.right.start + (region_base.start - block.left.start);
        return start..start + region_base.len();
    }
    // A zero-width region at the boundary of one of this side's hunks.
    for hunk in all_hunks {
        if region_base.start == hunk.base.end {
            return hunk.side.end..hunk.side.end;
        }
        if region_base.start == hunk.base.start {
            return hunk.side.start..hunk.side.start;
        }
    }
    0..0
}

/// Three-way line merge. Regions where both sides still match the base
/// are kept; a changed region takes whichever side changed it, or both
/// when the changes agree, and otherwise becomes a conflict hunk.
pub fn merge(base: &[u8], ours: &[u8], theirs: &[u8]) -> MergeResult {
    let base_lines = find_lines(base);
    let our_lines = find_lines(ours);
    let their_lines = find_lines(theirs);
    let our_blocks = matching_ranges(&base_lines, &our_lines);
    let their_blocks = matching_ranges(&base_lines, &their_lines);
    let our_hunks = changed_ranges(&our_blocks, base_lines.len(), our_lines.len());
    let their_hunks = changed_ranges(&their_blocks, base_lines.len(), their_lines.len());
    let regions = coalesce_regions(our_hunks.clone(), their_hunks.clone());

    let mut resolved_hunk: Vec<u8> = vec![];
    let mut merge_hunks: Vec<MergeHunk> = vec![];
    let mut base_pos = 0;
    for region in &regions {
        resolved_hunk.extend(base_lines[base_pos..region.base.start].concat());
        base_pos = region.base.end;

        let our_range = side_range(&region.base, &region.ours, &our_blocks, &our_hunks);
        let their_range = side_range(&region.base, &region.theirs, &their_blocks, &their_hunks);
        let base_chunk = &base_lines[region.base.clone()];
        let our_chunk = &our_lines[our_range];
        let their_chunk = &their_lines[their_range];
        if our_chunk == their_chunk {
            resolved_hunk.extend(our_chunk.concat());
        } else if our_chunk == base_chunk {
            resolved_hunk.extend(their_chunk.concat());
        } else if their_chunk == base_chunk {
            resolved_hunk.extend(our_chunk.concat());
        } else {
            if !resolved_hunk.is_empty() {
                merge_hunks.push(MergeHunk::Resolved(resolved_hunk));
                resolved_hunk = vec![];
            }
            merge_hunks.push(MergeHunk::Conflict {
                base: base_chunk.concat(),
                ours: our_chunk.concat(),
                theirs: their_chunk.concat(),
            });
        }
    }
    resolved_hunk.extend(base_lines[base_pos..].concat());

    if merge_hunks.is_empty() {
        MergeResult::Resolved(resolved_hunk)
    } else {
        if !resolved_hunk.is_empty() {
            merge_hunks.push(MergeHunk::Resolved(resolved_hunk));
        }
        MergeResult::Conflict(merge_hunks)
    }
}

/// Renders a merge result, conflict markers included, labelled with the
/// configured commit names (base, ours, theirs).
pub fn materialize(
    result: &MergeResult,
    names: &[String; 3],
    file: &mut dyn Write,
) -> std::io::Result<()> {
    match result {
        MergeResult::Resolved(content) => file.write_all(content),
        MergeResult::Conflict(hunks) => {
            for hunk in hunks {
                match hunk {
                    MergeHunk::Resolved(content) => file.write_all(content)?,
                    MergeHunk::Conflict { base, ours, theirs } => {
                        writeln!(file, "<<<<<<< {}", names[1])?;
                        file.write_all(ours)?;
                        writeln!(file, "||||||| {}", names[0])?;
                        file.write_all(base)?;
                        writeln!(file, "=======")?;
                        file.write_all(theirs)?;
                        writeln!(file, ">>>>>>> {}", names[2])?;
                    }
                }
            }
            Ok(())
        }
    }
}

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
use std::ops::Range;

/// Splits into lines, each including its trailing newline (the last line
/// may lack one).
pub fn find_lines(text: &[u8]) -> Vec<&[u8]> {
    text.split_inclusive(|b| *b == b'\n').collect()
}

/// A run of lines that match between the two sides. The ranges have
/// equal lengths.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MatchedRange {
    pub left: Range<usize>,
    pub right: Range<usize>,
}

/// Computes the runs of matching lines between two texts. Matches are
/// anchored on lines that occur exactly once on both sides; regions
/// between anchors are matched recursively after trimming common
/// prefixes and suffixes. Non-anchored ambiguous regions stay unmatched,
/// which errs towards larger (never wrong) difference regions.
pub fn matching_ranges(left: &[&[u8]], right: &[&[u8]]) -> Vec<MatchedRange> {
    let mut pairs = vec![];
    match_ranges_recursive(left, right, 0..left.len(), 0..right.len(), &mut pairs);
    compact_pairs(&pairs)
}

fn match_ranges_recursive(
    left: &[&[u8]],
    right: &[&[u8]],
    mut left_range: Range<usize>,
    mut right_range: Range<usize>,
    pairs: &mut Vec<(usize, usize)>,
) {
    // Common prefix
    while !left_range.is_empty()
        && !right_range.is_empty()
        && left[left_range.start] == right[right_range.start]
    {
        pairs.push((left_range.start, right_range.start));
        left_range.start += 1;
        right_range.start += 1;
    }
    // Common suffix
    let mut suffix_pairs = vec![];
    while !left_range.is_empty()
        && !right_range.is_empty()
        && left[left_range.end - 1] == right[right_range.end - 1]
    {
        left_range.end -= 1;
        right_range.end -= 1;
        suffix_pairs.push((left_range.end, right_range.end));
    }

    let anchors = unique_common_anchors(left, right, &left_range, &right_range);
    if !anchors.is_empty() {
        let mut prev_left = left_range.start;
        let mut prev_right = right_range.start;
        for (anchor_left, anchor_right) in anchors {
            match_ranges_recursive(
                left,
                right,
                prev_left..anchor_left,
                prev_right..anchor_right,
                pairs,
            );
            pairs.push((anchor_left, anchor_right));
            prev_left = anchor_left + 1;
            prev_right = anchor_right + 1;
        }
        match_ranges_recursive(
            left,
            right,
            prev_left..left_range.end,
            prev_right..right_range.end,
            pairs,
        );
    }

    pairs.extend(suffix_pairs.into_iter().rev());
}

/// Lines occurring exactly once in both ranges, paired up, restricted to
/// the longest increasing subsequence of right positions so the result
/// is monotonic on both sides.
fn unique_common_anchors(
    left: &[&[u8]],
    right: &[&[u8]],
    left_range: &Range<usize>,
    right_range: &Range<usize>,
) -> Vec<(usize, usize)> {
    fn unique_positions<'a>(
        lines: &[&'a [u8]],
        range: &Range<usize>,
    ) -> HashMap<&'a [u8], usize> {
        let mut counts: HashMap<&[u8], (usize, usize)> = HashMap::new();
        for i in range.clone() {
            counts
                .entry(lines[i])
                .and_modify(|e| e.0 += 1)
                .or_insert((1, i));
        }
        counts
            .into_iter()
            .filter(|&(_, (count, _))| count == 1)
            .map(|(line, (_, pos))| (line, pos))
            .collect()
    }

    let left_unique = unique_positions(left, left_range);
    let right_unique = unique_positions(right, right_range);
    let mut candidates: Vec<(usize, usize)> = left_unique
        .into_iter()
        .filter_map(|(line, left_pos)| {
            right_unique.get(line).map(|&right_pos| (left_pos, right_pos))
        })
        .collect();
    candidates.sort_unstable();
    longest_increasing_subsequence(&candidates)
}

/// Candidates are sorted by left position; selects a subset whose right
/// positions are strictly increasing, of maximum length.
fn longest_increasing_subsequence(candidates: &[(usize, usize)]) -> Vec<(usize, usize)> {
    // tails[k] = index of the candidate ending the best subsequence of
    // length k+1; prev links reconstruct the chosen chain.
    let mut tails: Vec<usize> = vec![];
    let mut prev: Vec<Option<usize>> = vec![None; candidates.len()];
    for (i, &(_, right_pos)) in candidates.iter().enumerate() {
        let insert_at = tails
            .partition_point(|&tail| candidates[tail].1 < right_pos);
        if insert_at > 0 {
            prev[i] = Some(tails[insert_at - 1]);
        }
        if insert_at == tails.len() {
            tails.push(i);
        } else {
            tails[insert_at] = i;
        }
    }
    let mut result = vec![];
    let mut current = tails.last().copied();
    while let Some(i) = current {
        result.push(candidates[i]);
        current = prev[i];
    }
    result.reverse();
    result
}

fn compact_pairs(pairs: &[(usize, usize)]) -> Vec<MatchedRange> {
    let mut result: Vec<MatchedRange> = vec![];
    for &(left, right) in pairs {
        match result.last_mut() {
            Some(last) if last.left.end == left && last.right.end == right => {
                last.left.end += 1;
                last.right.end += 1;
            }
            _ => result.push(MatchedRange {
                left: left..left + 1,
                right: right..right + 1,
            }),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(left: &[&[u8]], right: &[&[u8]]) -> Vec<(Range<usize>, Range<usize>)> {
        matching_ranges(left, right)
            .into_iter()
            .map(|m| (m.left, m.right))
            .collect()
    }

    #[test]
    fn test_find_lines() {
        assert_eq!(find_lines(b""), Vec::<&[u8]>::new());
        assert_eq!(find_lines(b"a\nb\n"), vec![&b"a\n"[..], &b"b\n"[..]]);
        assert_eq!(find_lines(b"a\nb"), vec![&b"a\n"[..], &b"b"[..]]);
    }

    #[test]
    fn test_matching_identical() {
        let lines: Vec<&[u8]> = vec![b"a\n", b"b\n", b"c\n"];
        assert_eq!(ranges(&lines, &lines), vec![(0..3, 0..3)]);
    }

    #[test]
    fn test_matching_disjoint() {
        let left: Vec<&[u8]> = vec![b"a\n"];
        let right: Vec<&[u8]> = vec![b"b\n"];
        assert_eq!(ranges(&left, &right), vec![]);
    }

    #[test]
    fn test_matching_middle_change() {
        let left: Vec<&[u8]> = vec![b"a\n", b"b\n", b"c\n"];
        let right: Vec<&[u8]> = vec![b"a\n", b"x\n", b"c\n"];
        assert_eq!(ranges(&left, &right), vec![(0..1, 0..1), (2..3, 2..3)]);
    }

    #[test]
    fn test_matching_insertion() {
        let left: Vec<&[u8]> = vec![b"a\n", b"c\n"];
        let right: Vec<&[u8]> = vec![b"a\n", b"b\n", b"c\n"];
        assert_eq!(ranges(&left, &right), vec![(0..1, 0..1), (1..2, 2..3)]);
    }

    #[test]
    fn test_matching_anchored_between_repeats() {
        // The repeated "x" lines are ambiguous; the unique "m" line
        // anchors the alignment around them.
        let left: Vec<&[u8]> = vec![b"x\n", b"m\n", b"x\n"];
        let right: Vec<&[u8]> = vec![b"y\n", b"x\n", b"m\n", b"x\n", b"y\n"];
        assert_eq!(
            ranges(&left, &right),
            vec![(0..3, 1..4)],
        );
    }

    #[test]
    fn test_matching_crossed_uniques_stay_monotonic() {
        let left: Vec<&[u8]> = vec![b"a\n", b"b\n"];
        let right: Vec<&[u8]> = vec![b"b\n", b"a\n"];
        // Only one of the two unique lines can be kept.
        let result = ranges(&left, &right);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].0.len(), 1);
    }

    #[test]
    fn test_longest_increasing_subsequence() {
        assert_eq!(
            longest_increasing_subsequence(&[(0, 3), (1, 1), (2, 2), (3, 0)]),
            vec![(1, 1), (2, 2)]
        );
        assert_eq!(longest_increasing_subsequence(&[]), vec![]);
    }
}

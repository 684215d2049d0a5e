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

use std::cmp::Ordering;
use std::fmt::{Debug, Error, Formatter};
use std::path::{Path, PathBuf};

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RepoPath {
    // Internal string form: components joined by '/', no leading or
    // trailing slash. The root path is the empty string.
    value: String,
}

impl Debug for RepoPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.write_fmt(format_args!("{:?}", &self.value))
    }
}

impl RepoPath {
    pub fn root() -> Self {
        RepoPath {
            value: String::new(),
        }
    }

    /// The full string form used internally, not for presenting to users
    /// (where we may want to use the platform's separator).
    pub fn from_internal_string(value: &str) -> Self {
        assert!(!value.starts_with('/') && !value.ends_with('/'));
        RepoPath {
            value: value.to_owned(),
        }
    }

    pub fn as_internal_str(&self) -> &str {
        &self.value
    }

    pub fn is_root(&self) -> bool {
        self.value.is_empty()
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.value.split('/').filter(|c| !c.is_empty())
    }

    pub fn join(&self, name: &str) -> RepoPath {
        debug_assert!(!name.is_empty() && !name.contains('/'));
        if self.is_root() {
            RepoPath {
                value: name.to_owned(),
            }
        } else {
            RepoPath {
                value: format!("{}/{}", self.value, name),
            }
        }
    }

    pub fn parent(&self) -> Option<RepoPath> {
        if self.is_root() {
            None
        } else {
            match self.value.rfind('/') {
                None => Some(RepoPath::root()),
                Some(i) => Some(RepoPath {
                    value: self.value[..i].to_owned(),
                }),
            }
        }
    }

    pub fn split(&self) -> Option<(RepoPath, &str)> {
        if self.is_root() {
            None
        } else {
            match self.value.rfind('/') {
                None => Some((RepoPath::root(), &self.value)),
                Some(i) => Some((
                    RepoPath {
                        value: self.value[..i].to_owned(),
                    },
                    &self.value[i + 1..],
                )),
            }
        }
    }

    pub fn basename(&self) -> Option<&str> {
        self.split().map(|(_, name)| name)
    }

    /// Whether `self` is an ancestor directory of `other` (or equal to it).
    pub fn contains(&self, other: &RepoPath) -> bool {
        if self.is_root() {
            return true;
        }
        other.value.starts_with(&self.value)
            && (other.value.len() == self.value.len()
                || other.value.as_bytes()[self.value.len()] == b'/')
    }

    pub fn to_fs_path(&self, base: &Path) -> PathBuf {
        let mut result = base.to_owned();
        for component in self.components() {
            result.push(component);
        }
        result
    }
}

// Paths are ordered component by component, not by the raw internal
// string. That makes "a/b" sort before "a.x", which is the order a
// pre-order tree walk produces and the order the dircache requires.
impl Ord for RepoPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components().cmp(other.components())
    }
}

impl PartialOrd for RepoPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

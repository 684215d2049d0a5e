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

//! A three-way tree merger for a content-addressed version-control
//! object model: given a common-ancestor tree and two sides, it updates
//! the index and the working copy per path, staging conflicts the way an
//! interactive user expects to find them.

pub mod backend;
pub mod diff;
pub mod dircache;
pub mod files;
pub mod lock;
pub mod merge;
pub mod repo_path;
pub mod store;
pub mod testutils;
pub mod tree_walk;
pub mod working_copy;

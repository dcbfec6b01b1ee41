// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The merged view over a delta stack: for each logical cluster, which level
//! owns it and where that level's BAT says the data lives. Built once at
//! open time (lower levels first, so a higher level's assignment always
//! shadows a lower one) and kept current as the writer allocates new
//! top-level clusters.

/// One logical cluster's resolved location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub level: u32,
    pub physical: u32,
}

#[derive(Debug, Default)]
pub struct MergedMap {
    entries: Vec<Option<Entry>>,
}

impl MergedMap {
    pub fn new(logical_size_clusters: u32) -> Self {
        Self {
            entries: vec![None; logical_size_clusters as usize],
        }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Extends the map with unallocated (`None`) slots up to `logical_size`.
    /// A no-op if the map is already at least that large; the map never
    /// shrinks, since a higher delta narrowing the device isn't meaningful.
    pub fn grow_to(&mut self, logical_size_clusters: u32) {
        if logical_size_clusters as usize > self.entries.len() {
            self.entries.resize(logical_size_clusters as usize, None);
        }
    }

    pub fn get(&self, logical: u32) -> Option<Entry> {
        self.entries.get(logical as usize).copied().flatten()
    }

    /// Records that `logical` is owned by `level` at `physical`. Called in
    /// ascending level order while opening the stack, so a later call for
    /// the same `logical` (from a higher delta) always wins; also called by
    /// the writer when it allocates a fresh top-level cluster.
    pub fn assign(&mut self, logical: u32, level: u32, physical: u32) {
        self.entries[logical as usize] = Some(Entry { level, physical });
    }
}

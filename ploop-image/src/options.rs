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

/// Whether the top delta is opened for writing.
///
/// Only the top (last) path passed to [`crate::Image::open`] is ever opened
/// read-write; every level below it is always read-only, regardless of
/// `Mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    ReadOnly,
    ReadWrite,
}

/// When the top delta's mmap'd BAT gets `msync`'d.
///
/// See DESIGN.md for why `Always` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MsyncPolicy {
    /// Flush the touched BAT page after every allocating write.
    #[default]
    Always,
    /// Only flush once, when the image is closed. Faster under heavy
    /// allocation, at the cost of a wider crash window in which a written
    /// data cluster has no corresponding BAT entry yet.
    OnClose,
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub(crate) mode: Mode,
    pub(crate) msync_policy: MsyncPolicy,
    pub(crate) direct_io: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            msync_policy: MsyncPolicy::default(),
            direct_io: true,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn msync_policy(mut self, policy: MsyncPolicy) -> Self {
        self.msync_policy = policy;
        self
    }

    /// Whether to open delta files with `O_DIRECT`. Defaults to `true`,
    /// matching the reference engine's unconditional use of direct I/O on
    /// real block-backed storage. Disable for delta files that live on a
    /// filesystem that doesn't support it (tmpfs is the common case, which
    /// is why tests built on [`tempfile`](https://docs.rs/tempfile) turn
    /// this off).
    pub fn direct_io(mut self, enabled: bool) -> Self {
        self.direct_io = enabled;
        self
    }
}

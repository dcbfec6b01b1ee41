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

//! A page-aligned scratch buffer, the Rust equivalent of the reference
//! engine's `posix_memalign`-backed cluster buffer. Direct I/O requires the
//! kernel to DMA straight into/out of this memory, so it must start on a
//! page boundary; a plain `Vec<u8>` makes no such promise.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use ploop_err::{Error, ResourceError, Result};

pub const PAGE_SIZE: usize = 4096;

pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl AlignedBuffer {
    pub fn new(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len, PAGE_SIZE).map_err(|_| Error::Resource(ResourceError::Alloc))?;
        // SAFETY: layout has non-zero size (checked by callers: len is always
        // a cluster size, always > 0) and a valid alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Error::Resource(ResourceError::Alloc))?;
        Ok(Self { ptr, len })
    }

    pub fn resize(&mut self, len: usize) -> Result<()> {
        if len == self.len {
            return Ok(());
        }
        *self = Self::new(len)?;
        Ok(())
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr was allocated with `len` bytes and is never aliased.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `Deref`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, PAGE_SIZE).expect("layout was valid at construction");
        // SAFETY: ptr was allocated from the global allocator with this exact
        // layout in `new`/`resize`, and is dropped at most once.
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

// The buffer owns its memory outright; it's fine to move it across threads
// (the engine itself is single-threaded, but nothing here prevents Send).
unsafe impl Send for AlignedBuffer {}

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

//! The merged, copy-on-write image: open a stack of delta files bottom-up,
//! serve reads through the merged map, and serve writes by either rewriting
//! a top-level cluster in place or copying one up from a lower level.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::{debug, info, warn};
use memmap2::{MmapMut, MmapOptions};
use zerocopy::{FromBytes, IntoBytes};

use ploop_err::{ArgError, Error, FormatError, IoError, ResourceError, Result};
use ploop_format::{decode_bat_cluster, max_addressable_index, validate_header, Header, HEADER_SIZE, HEADER_SIZE_32};

use crate::aligned::AlignedBuffer;
use crate::map::MergedMap;
use crate::options::{Mode, MsyncPolicy, OpenOptions};

const HEADER_STRUCT_SIZE: usize = std::mem::size_of::<Header>();
/// The page/alignment unit every caller-supplied buffer, size, and offset
/// must be a multiple of, per spec.md §4.3: direct I/O works in whole pages,
/// not whole sectors.
const ALIGNMENT: u64 = crate::aligned::PAGE_SIZE as u64;

fn io_err(context: &'static str, source: std::io::Error) -> Error {
    IoError::System { context, source }.into()
}

/// Owns the top delta's BAT region mmap'd for direct word updates. The
/// mapping is only ever created over the file it was opened from and is
/// dropped (unmapped) strictly before that `File` is dropped, since it is
/// held alongside it inside [`Image`] and [`Image::close`] drops the map
/// before closing any descriptor.
struct TopBatMap {
    mmap: MmapMut,
}

impl TopBatMap {
    fn open(file: &File, bat_size_clusters: u32, cluster_size: u32) -> Result<Self> {
        let len = bat_size_clusters as usize * cluster_size as usize;
        // SAFETY: the mapping is private to this process for the lifetime of
        // the `Image`, and nothing else truncates the top delta's BAT region
        // concurrently.
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(file) }.map_err(ResourceError::Mmap)?;
        Ok(Self { mmap })
    }

    /// `word_index` is the BAT entry's absolute position, including the
    /// reserved header words (i.e. `logical + HEADER_SIZE_32`).
    fn entry(&self, word_index: u32) -> u32 {
        let off = word_index as usize * 4;
        u32::from_le_bytes(self.mmap[off..off + 4].try_into().unwrap())
    }

    /// `word_index` is the BAT entry's absolute position, including the
    /// reserved header words (i.e. `logical + HEADER_SIZE_32`).
    fn set_entry(&mut self, word_index: u32, physical: u32) {
        let off = word_index as usize * 4;
        self.mmap[off..off + 4].copy_from_slice(&physical.to_le_bytes());
    }

    fn flush(&self) -> Result<()> {
        self.mmap.flush().map_err(ResourceError::Mmap)?;
        Ok(())
    }
}

fn set_in_use(file: &File, in_use: bool) -> Result<()> {
    let mut buf = AlignedBuffer::new(HEADER_SIZE)?;
    file.read_exact_at(&mut buf, 0).map_err(|e| io_err("reading header", e))?;
    let mut header =
        Header::read_from_bytes(&buf[..HEADER_STRUCT_SIZE]).map_err(|_| FormatError::BadMagic)?;
    header.mark_in_use(in_use);
    buf[..HEADER_STRUCT_SIZE].copy_from_slice(header.as_bytes());
    file.write_all_at(&buf, 0).map_err(|e| io_err("writing in-use flag", e))?;
    file.sync_data().map_err(|e| io_err("fsync header", e))?;
    Ok(())
}

/// A merged, copy-on-write view over a stack of ploop-style delta files.
///
/// Level 0 is the base image; the last path passed to [`Image::open`] is the
/// top delta, the only one ever opened for writing. See spec.md §3-4 for the
/// on-disk model this mirrors.
pub struct Image {
    mode: Mode,
    deltas: Vec<File>,
    cluster_size: u32,
    logical_size: u32,
    top_bat_size: u32,
    top_alloc_size: u32,
    map: MergedMap,
    top_bat: Option<TopBatMap>,
    scratch: AlignedBuffer,
    max_idx: u32,
    msync_policy: MsyncPolicy,
}

impl Image {
    /// Opens a delta stack bottom-up. `paths[0]` is the base image,
    /// `paths[paths.len() - 1]` is the top delta. Only the top delta is ever
    /// opened read-write, and only when `options` requests [`Mode::ReadWrite`].
    pub fn open<P: AsRef<Path>>(paths: &[P], options: OpenOptions) -> Result<Image> {
        if paths.is_empty() {
            return Err(ArgError::NoDeltas.into());
        }
        let max_levels = paths.len();
        let top_level = max_levels - 1;

        let mut deltas = Vec::with_capacity(max_levels);
        let mut cluster_size: u32 = 0;
        let mut logical_size: u32 = 0;
        let mut top_bat_size: u32 = 0;
        let mut top_alloc_size: u32 = 0;
        let mut map = MergedMap::new(0);
        let mut scratch = AlignedBuffer::new(HEADER_SIZE)?;

        for (level, path) in paths.iter().enumerate() {
            let path = path.as_ref();
            let writable = options.mode == Mode::ReadWrite && level == top_level;

            let mut open_opts = std::fs::OpenOptions::new();
            open_opts.read(true).write(writable);
            if options.direct_io {
                #[cfg(target_os = "linux")]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    open_opts.custom_flags(libc::O_DIRECT);
                }
            }
            let file = open_opts.open(path).map_err(|source| ResourceError::Open {
                path: path.display().to_string(),
                source,
            })?;

            let mut hdr_buf = AlignedBuffer::new(HEADER_SIZE)?;
            file.read_exact_at(&mut hdr_buf, 0).map_err(|e| io_err("reading header", e))?;
            let header =
                Header::read_from_bytes(&hdr_buf[..HEADER_STRUCT_SIZE]).map_err(|_| FormatError::BadMagic)?;
            validate_header(&header)?;

            let delta_cluster_size = header.cluster_size();
            if level == 0 {
                cluster_size = delta_cluster_size;
            } else if delta_cluster_size != cluster_size {
                return Err(FormatError::ClusterSizeMismatch {
                    expected: cluster_size,
                    got: delta_cluster_size,
                }
                .into());
            }

            let delta_logical_size = header.logical_size_clusters();
            let delta_bat_size = header.bat_size_clusters();
            let file_len = file.metadata().map_err(|e| io_err("stat delta", e))?.len();
            let delta_alloc_size = (file_len / delta_cluster_size as u64) as u32;

            logical_size = delta_logical_size;
            map.grow_to(logical_size);

            scratch.resize(delta_cluster_size as usize)?;
            for cluster_index in 0..delta_bat_size {
                file.read_exact_at(&mut scratch[..], cluster_index as u64 * delta_cluster_size as u64)
                    .map_err(|e| io_err("reading BAT cluster", e))?;
                let assignments = decode_bat_cluster(
                    cluster_index,
                    &scratch,
                    delta_logical_size,
                    delta_bat_size,
                    delta_alloc_size,
                )?;
                for a in assignments {
                    map.assign(a.logical, level as u32, a.physical);
                }
            }

            debug!(
                "opened delta {} at level {level} ({} clusters, BAT {} clusters)",
                path.display(),
                delta_logical_size,
                delta_bat_size
            );

            top_bat_size = delta_bat_size;
            top_alloc_size = delta_alloc_size;
            deltas.push(file);
        }

        let max_idx = max_addressable_index(top_bat_size, cluster_size);

        let top_bat = if options.mode == Mode::ReadWrite {
            let top_file = deltas.last().expect("checked non-empty above");
            set_in_use(top_file, true)?;
            info!("marked top delta in use");
            Some(TopBatMap::open(top_file, top_bat_size, cluster_size)?)
        } else {
            None
        };

        Ok(Image {
            mode: options.mode,
            deltas,
            cluster_size,
            logical_size,
            top_bat_size,
            top_alloc_size,
            map,
            top_bat,
            scratch,
            max_idx,
            msync_policy: options.msync_policy,
        })
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn logical_size_bytes(&self) -> u64 {
        self.logical_size as u64 * self.cluster_size as u64
    }

    pub fn bat_size_clusters(&self) -> u32 {
        self.top_bat_size
    }

    pub fn levels(&self) -> usize {
        self.deltas.len()
    }

    /// Clears the top delta's dirty flag and flushes its BAT mmap, then
    /// closes every delta file top-to-bottom (the reverse of open order).
    pub fn close(mut self) -> Result<()> {
        let result = (|| -> Result<()> {
            if self.mode == Mode::ReadWrite {
                if let Some(top) = self.deltas.last() {
                    set_in_use(top, false)?;
                    info!("cleared in-use flag on close");
                }
                if let Some(bat) = self.top_bat.take() {
                    bat.flush()?;
                }
            }
            Ok(())
        })();
        while let Some(delta) = self.deltas.pop() {
            drop(delta);
        }
        result
    }

    fn check_alignment(&self, size: u64, offset: u64) -> Result<()> {
        if size % ALIGNMENT != 0 || offset % ALIGNMENT != 0 {
            return Err(ArgError::Unaligned.into());
        }
        Ok(())
    }

    fn check_bounds(&self, size: u64, offset: u64) -> Result<()> {
        if offset.checked_add(size).is_none() || offset + size > self.logical_size_bytes() {
            return Err(ArgError::PastEnd { offset, size }.into());
        }
        Ok(())
    }

    /// Whole-request precondition for writes: the last logical cluster the
    /// write would touch must stay within the BAT's addressable range, per
    /// spec.md §4.4. Checked once up front, like `check_bounds`, so a write
    /// whose later clusters would exceed `max_idx` performs no I/O at all
    /// rather than allocating earlier clusters before failing.
    fn check_writable_range(&self, size: u64, offset: u64) -> Result<()> {
        let cluster_size = self.cluster_size as u64;
        let last_cluster = (offset + size).div_ceil(cluster_size);
        if last_cluster >= self.max_idx as u64 {
            warn!(
                "write offset={offset} size={size} reaches cluster {last_cluster}, past max_idx {}; BAT growth is not implemented",
                self.max_idx
            );
            return Err(ArgError::TooLarge { offset, size }.into());
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes starting at `offset`, both of which must be
    /// sector-aligned. Clusters with no BAT entry at any level read back as
    /// zero, matching a sparse device's unallocated region.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<u64> {
        let size = buf.len() as u64;
        self.check_alignment(size, offset)?;
        self.check_bounds(size, offset)?;

        let mut done = 0u64;
        while done < size {
            let cluster_size = self.cluster_size as u64;
            let logical = ((offset + done) / cluster_size) as u32;
            let in_cluster_off = (offset + done) % cluster_size;
            let chunk = (size - done).min(cluster_size - in_cluster_off);
            let dst = &mut buf[done as usize..(done + chunk) as usize];

            match self.map.get(logical) {
                Some(entry) => {
                    let phys_off = entry.physical as u64 * cluster_size + in_cluster_off;
                    self.deltas[entry.level as usize]
                        .read_exact_at(dst, phys_off)
                        .map_err(|e| io_err("reading data cluster", e))?;
                }
                None => dst.fill(0),
            }
            done += chunk;
        }
        Ok(size)
    }

    /// Writes `buf.len()` bytes starting at `offset`, both of which must be
    /// sector-aligned. A cluster already owned by the top delta is rewritten
    /// in place; any other cluster (absent, or owned by a lower level) is
    /// copied up: the source cluster (or zeros) is read into scratch, the
    /// write is applied to scratch, a new top-level cluster is appended and
    /// written, and only then is the BAT updated to point at it.
    pub fn write(&mut self, buf: &[u8], offset: u64) -> Result<u64> {
        if self.mode != Mode::ReadWrite {
            return Err(ArgError::ReadOnly.into());
        }
        let size = buf.len() as u64;
        self.check_alignment(size, offset)?;
        self.check_bounds(size, offset)?;
        self.check_writable_range(size, offset)?;

        let top_level = (self.deltas.len() - 1) as u32;
        let cluster_size = self.cluster_size as u64;

        let mut done = 0u64;
        while done < size {
            let logical = ((offset + done) / cluster_size) as u32;
            let in_cluster_off = (offset + done) % cluster_size;
            let chunk = (size - done).min(cluster_size - in_cluster_off);
            let src = &buf[done as usize..(done + chunk) as usize];

            match self.map.get(logical) {
                Some(entry) if entry.level == top_level => {
                    let phys_off = entry.physical as u64 * cluster_size + in_cluster_off;
                    self.deltas[top_level as usize]
                        .write_all_at(src, phys_off)
                        .map_err(|e| io_err("writing data cluster", e))?;
                }
                existing => {
                    self.allocate_and_write(logical, in_cluster_off, src, existing)?;
                }
            }
            done += chunk;
        }
        Ok(size)
    }

    fn allocate_and_write(
        &mut self,
        logical: u32,
        in_cluster_off: u64,
        src: &[u8],
        existing: Option<crate::map::Entry>,
    ) -> Result<()> {
        let cluster_size = self.cluster_size as usize;
        self.scratch.resize(cluster_size)?;
        match existing {
            Some(entry) => {
                let src_off = entry.physical as u64 * cluster_size as u64;
                self.deltas[entry.level as usize]
                    .read_exact_at(&mut self.scratch[..], src_off)
                    .map_err(|e| io_err("reading cluster to copy up", e))?;
            }
            None => self.scratch.fill(0),
        }
        let start = in_cluster_off as usize;
        self.scratch[start..start + src.len()].copy_from_slice(src);

        let top_level = self.deltas.len() - 1;
        let new_physical = self.top_alloc_size;
        let new_len = (new_physical as u64 + 1) * cluster_size as u64;
        let top_file = &self.deltas[top_level];
        let prev_len = top_file.metadata().map_err(|e| io_err("stat top delta", e))?.len();

        let grow_result = (|| -> Result<()> {
            top_file.set_len(new_len).map_err(|e| io_err("growing top delta", e))?;
            top_file
                .write_all_at(&self.scratch[..], new_physical as u64 * cluster_size as u64)
                .map_err(|e| io_err("writing new cluster", e))?;
            Ok(())
        })();
        if let Err(e) = grow_result {
            let _ = top_file.set_len(prev_len);
            return Err(e);
        }

        // Data is on disk; stamp the BAT next. The prior on-disk entry must
        // still be zero — if it isn't, the cluster was already owned by the
        // top level and Case A should have applied. Checked before touching
        // in-memory state: a crash or bail-out here just leaves an
        // unreferenced cluster at the tail of the file, wasted but harmless.
        let bat = self.top_bat.as_mut().expect("write() only reaches here in read-write mode");
        let word = logical + HEADER_SIZE_32;
        let prior = bat.entry(word);
        if prior != 0 {
            let _ = self.deltas[top_level].set_len(prev_len);
            return Err(FormatError::BatAlreadyOwned {
                idx: logical,
                value: prior,
            }
            .into());
        }
        bat.set_entry(word, new_physical);
        if self.msync_policy == MsyncPolicy::Always {
            bat.flush()?;
        }

        self.top_alloc_size += 1;
        self.map.assign(logical, top_level as u32, new_physical);
        Ok(())
    }
}

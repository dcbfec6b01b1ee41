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

//! On-disk layout of a single ploop-style delta image: the 4 KiB header
//! (`Header`, matching `struct ploop_pvd_header`) and the BAT entry
//! conventions that follow it. Nothing in this crate touches a file or a
//! socket; `ploop_image` drives the actual I/O and calls into
//! [`validate_header`] and friends with bytes it already has in hand.

use ploop_err::{FormatError, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size in bytes of every delta's header region, and the unit of alignment
/// the whole engine works in (direct I/O requires page-aligned buffers).
pub const HEADER_SIZE: usize = 4096;

/// log2(512), i.e. the sector-to-byte shift used throughout the format.
pub const SECTOR_LOG: u32 = 9;

/// Size of the header, in 32-bit words; BAT entries below this index in the
/// first BAT cluster overlap the header and are reserved.
pub const HEADER_SIZE_32: u32 = 16;

/// `m_Type` value for a structured (sparse) ploop disk.
pub const PRL_IMAGE_COMPRESSED: u32 = 2;

/// `m_DiskInUse` sentinel marking a delta as held open for writing.
pub const SIGNATURE_DISK_IN_USE: u32 = 0x746F_6E59;

/// `m_Sig` value for a v1 structured disk (rejected — see spec Non-goals).
pub const SIGNATURE_STRUCTURED_DISK_V1: [u8; 16] = *b"WithoutFreSpacEx";

/// `m_Sig` value for the only signature this engine accepts.
pub const SIGNATURE_STRUCTURED_DISK_V2: [u8; 16] = *b"WithouFreSpacExt";

/// The default cluster size used before any delta has been opened (1 MiB,
/// expressed in 512-byte sectors as `m_Sectors` would store it).
pub const DEFAULT_CLUSTER_SECTORS: u32 = (1 << 20) >> SECTOR_LOG;

/// Bit-exact layout of the first 4 KiB of every delta file.
///
/// Field names and order follow the reference `ploop_pvd_header`; fields the
/// engine doesn't interpret are kept (and round-tripped) as opaque bytes so
/// that writing a header back out never corrupts information this engine
/// doesn't understand.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Header {
    pub m_sig: [u8; 16],
    pub m_type: U32,
    pub m_heads: U32,
    pub m_cylinders: U32,
    pub m_sectors: U32,
    pub m_size_in_sectors_v1: U32,
    pub m_disk_in_use: U32,
    pub m_first_block_offset: U32,
    pub m_flags: U32,
    pub m_size_in_sectors_v2: U64,
    pub m_under: U32,
    pub m_padding: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<Header>() == (HEADER_SIZE_32 as usize) * 4);

impl Header {
    /// Cluster size in bytes, `S` in spec terms.
    pub fn cluster_size(&self) -> u32 {
        self.m_sectors.get() << SECTOR_LOG
    }

    /// Logical device size in clusters, `L` in spec terms.
    ///
    /// Requires `cluster_size()` to already be known non-zero and a power of
    /// two multiple of 512; callers call this only after [`validate_header`]
    /// has succeeded.
    pub fn logical_size_clusters(&self) -> u32 {
        let shift = self.m_sectors.get().trailing_zeros();
        (self.m_size_in_sectors_v2.get() >> shift) as u32
    }

    /// BAT size in clusters, `B` in spec terms.
    pub fn bat_size_clusters(&self) -> u32 {
        let shift = self.m_sectors.get().trailing_zeros();
        self.m_first_block_offset.get() >> shift
    }

    pub fn is_in_use(&self) -> bool {
        self.m_disk_in_use.get() != 0
    }

    pub fn mark_in_use(&mut self, in_use: bool) {
        self.m_disk_in_use
            .set(if in_use { SIGNATURE_DISK_IN_USE } else { 0 });
    }
}

/// Validates everything about a header that spec.md §4.1 requires before any
/// metrics are derived from it: signature, type, and the not-in-use check.
///
/// Does not check cluster-size agreement across levels — that's a
/// cross-delta concern the caller (which knows about the rest of the stack)
/// decides.
pub fn validate_header(header: &Header) -> Result<()> {
    if header.m_type.get() != PRL_IMAGE_COMPRESSED {
        return Err(FormatError::WrongType.into());
    }
    if header.m_sig != SIGNATURE_STRUCTURED_DISK_V2 {
        if header.m_sig == SIGNATURE_STRUCTURED_DISK_V1 {
            return Err(FormatError::V1Unsupported.into());
        }
        return Err(FormatError::BadMagic.into());
    }
    if header.is_in_use() {
        return Err(FormatError::InUse.into());
    }
    if !header.m_sectors.get().is_power_of_two() {
        return Err(FormatError::BadMagic.into());
    }
    Ok(())
}

/// One decoded, range-checked BAT entry: the logical cluster it covers and
/// the physical cluster it points at within the delta it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatAssignment {
    pub logical: u32,
    pub physical: u32,
}

/// Decodes the 32-bit little-endian BAT entries packed into one BAT cluster
/// and range-checks each non-zero one, per spec.md §4.1. `cluster_index` is
/// this BAT cluster's position (0-based) within the BAT; only cluster 0 has
/// the first [`HEADER_SIZE_32`] entries reserved.
pub fn decode_bat_cluster(
    cluster_index: u32,
    cluster_bytes: &[u8],
    logical_size_clusters: u32,
    bat_size_clusters: u32,
    alloc_size_clusters: u32,
) -> Result<Vec<BatAssignment>> {
    let entries_per_cluster = cluster_bytes.len() / 4;
    let first_entry = if cluster_index == 0 {
        HEADER_SIZE_32 as usize
    } else {
        0
    };

    let mut out = Vec::new();
    for (slot, raw) in cluster_bytes.chunks_exact(4).enumerate().skip(first_entry) {
        let value = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if value == 0 {
            continue;
        }

        let logical = cluster_index * entries_per_cluster as u32 + slot as u32 - HEADER_SIZE_32;

        if logical >= logical_size_clusters {
            return Err(FormatError::BatBeyondDevice {
                idx: logical,
                value,
            }
            .into());
        }
        if value >= alloc_size_clusters {
            return Err(FormatError::BatPastEof {
                idx: logical,
                value,
            }
            .into());
        }
        if value < bat_size_clusters {
            return Err(FormatError::BatBeforeData {
                idx: logical,
                value,
            }
            .into());
        }

        out.push(BatAssignment {
            logical,
            physical: value,
        });
    }
    Ok(out)
}

/// The BAT's maximum addressable logical index, `max_idx` in spec terms:
/// past this, growing the BAT would be required, which this engine doesn't
/// implement.
pub fn max_addressable_index(bat_size_clusters: u32, cluster_size_bytes: u32) -> u32 {
    (bat_size_clusters * cluster_size_bytes / 4).saturating_sub(HEADER_SIZE_32)
}

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

//! End-to-end tests built on synthetic delta files, the way the reference
//! engine's own command-file driver exercised `plus_open`/`plus_read`/
//! `plus_write` against real fixtures.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;

use ploop_err::{ArgError, Error, FormatError};
use ploop_format::{Header, HEADER_SIZE_32, PRL_IMAGE_COMPRESSED, SECTOR_LOG, SIGNATURE_STRUCTURED_DISK_V2};
use ploop_image::{Image, Mode, OpenOptions};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, IntoBytes};

// Two pages per cluster, so a write can touch a 4 KiB-aligned prefix of a
// cluster without covering it, exercising the Case B payload reconstruction.
const CLUSTER_SIZE: u32 = 8192;

/// Delta files built by [`make_delta`] live on whatever filesystem backs the
/// test temp dir (often tmpfs), which commonly rejects `O_DIRECT`.
fn test_options() -> OpenOptions {
    OpenOptions::new().direct_io(false)
}

fn header_for(cluster_size: u32, logical_size_clusters: u32, bat_size_clusters: u32) -> Header {
    let sectors = cluster_size >> SECTOR_LOG;
    Header {
        m_sig: SIGNATURE_STRUCTURED_DISK_V2,
        m_type: U32::new(PRL_IMAGE_COMPRESSED),
        m_heads: U32::new(0),
        m_cylinders: U32::new(0),
        m_sectors: U32::new(sectors),
        m_size_in_sectors_v1: U32::new(0),
        m_disk_in_use: U32::new(0),
        m_first_block_offset: U32::new(bat_size_clusters * sectors),
        m_flags: U32::new(0),
        m_size_in_sectors_v2: U64::new(logical_size_clusters as u64 * sectors as u64),
        m_under: U32::new(0),
        m_padding: [0; 8],
    }
}

/// Builds one synthetic delta file: a header, `bat_size_clusters` BAT
/// clusters encoding `assignments`, and `file_len_clusters` total clusters
/// (the rest zero-filled by `set_len`), optionally seeding specific physical
/// clusters with `data`.
fn make_delta(
    path: &Path,
    cluster_size: u32,
    logical_size_clusters: u32,
    bat_size_clusters: u32,
    file_len_clusters: u32,
    assignments: &[(u32, u32)],
    data: &[(u32, &[u8])],
) {
    let file = File::create(path).unwrap();
    file.set_len(file_len_clusters as u64 * cluster_size as u64).unwrap();

    let header = header_for(cluster_size, logical_size_clusters, bat_size_clusters);
    file.write_all_at(header.as_bytes(), 0).unwrap();

    let entries_per_cluster = cluster_size / 4;
    for cluster_index in 0..bat_size_clusters {
        let mut buf = vec![0u8; cluster_size as usize];
        for &(logical, physical) in assignments {
            let word = logical + HEADER_SIZE_32;
            if word / entries_per_cluster == cluster_index {
                let slot = (word % entries_per_cluster) as usize;
                buf[slot * 4..slot * 4 + 4].copy_from_slice(&physical.to_le_bytes());
            }
        }
        file.write_all_at(&buf, cluster_index as u64 * cluster_size as u64).unwrap();
    }

    for &(physical, bytes) in data {
        let mut buf = vec![0u8; cluster_size as usize];
        buf[..bytes.len()].copy_from_slice(bytes);
        file.write_all_at(&buf, physical as u64 * cluster_size as u64).unwrap();
    }
}

#[test]
fn reads_unallocated_cluster_as_zero() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("base.hdd");
    make_delta(&path, CLUSTER_SIZE, 4, 1, 1, &[], &[]);

    let image = Image::open(&[&path], test_options()).unwrap();
    assert_eq!(image.cluster_size(), CLUSTER_SIZE);
    assert_eq!(image.logical_size_bytes(), 4 * CLUSTER_SIZE as u64);

    let mut buf = vec![0xFFu8; CLUSTER_SIZE as usize];
    let n = image.read(&mut buf, 0).unwrap();
    assert_eq!(n, CLUSTER_SIZE as u64);
    assert!(buf.iter().all(|&b| b == 0));

    image.close().unwrap();
}

#[test]
fn write_then_read_back_same_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("top.hdd");
    make_delta(&path, CLUSTER_SIZE, 4, 1, 1, &[], &[]);

    let mut image = Image::open(&[&path], test_options().mode(Mode::ReadWrite)).unwrap();

    let mut payload = vec![0u8; 4096];
    payload.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
    image.write(&payload, 0).unwrap();

    let mut buf = vec![0u8; CLUSTER_SIZE as usize];
    image.read(&mut buf, 0).unwrap();
    assert_eq!(&buf[..4096], &payload[..]);
    assert!(buf[4096..].iter().all(|&b| b == 0));

    image.close().unwrap();

    // Reopening read-only must see the persisted BAT entry and data, and the
    // in-use flag must have been cleared by close().
    let image = Image::open(&[&path], test_options()).unwrap();
    let mut reread = vec![0u8; CLUSTER_SIZE as usize];
    image.read(&mut reread, 0).unwrap();
    assert_eq!(&reread[..4096], &payload[..]);
    image.close().unwrap();

    let mut raw_header = vec![0u8; std::mem::size_of::<Header>()];
    File::open(&path).unwrap().read_exact_at(&mut raw_header, 0).unwrap();
    let header = Header::read_from_bytes(&raw_header[..]).unwrap();
    assert!(!header.is_in_use());
}

#[test]
fn reads_fall_through_to_lower_level() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = dir.path().join("base.hdd");
    let top_path = dir.path().join("top.hdd");

    let pattern = vec![0xABu8; CLUSTER_SIZE as usize];
    // Base owns logical cluster 1 at physical cluster 1 (right after its
    // single BAT cluster).
    make_delta(&base_path, CLUSTER_SIZE, 4, 1, 2, &[(1, 1)], &[(1, &pattern)]);
    // Top delta is freshly created, empty, on top of base.
    make_delta(&top_path, CLUSTER_SIZE, 4, 1, 1, &[], &[]);

    let image = Image::open(&[&base_path, &top_path], test_options()).unwrap();
    assert_eq!(image.levels(), 2);

    let mut buf = vec![0u8; CLUSTER_SIZE as usize];
    image.read(&mut buf, CLUSTER_SIZE as u64).unwrap();
    assert_eq!(buf, pattern);

    let mut zeros = vec![0xFFu8; CLUSTER_SIZE as usize];
    image.read(&mut zeros, 0).unwrap();
    assert!(zeros.iter().all(|&b| b == 0));

    image.close().unwrap();
}

#[test]
fn write_copies_lower_cluster_up_before_overwriting_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = dir.path().join("base.hdd");
    let top_path = dir.path().join("top.hdd");

    let mut base_cluster = vec![0u8; CLUSTER_SIZE as usize];
    base_cluster.iter_mut().for_each(|b| *b = 0x55);
    make_delta(&base_path, CLUSTER_SIZE, 4, 1, 2, &[(2, 1)], &[(1, &base_cluster)]);
    make_delta(&top_path, CLUSTER_SIZE, 4, 1, 1, &[], &[]);

    let mut image = Image::open(&[&base_path, &top_path], test_options().mode(Mode::ReadWrite)).unwrap();

    let overwrite = vec![0xAAu8; 4096];
    image.write(&overwrite, 2 * CLUSTER_SIZE as u64).unwrap();

    let mut buf = vec![0u8; CLUSTER_SIZE as usize];
    image.read(&mut buf, 2 * CLUSTER_SIZE as u64).unwrap();
    assert_eq!(&buf[..4096], &overwrite[..]);
    assert!(buf[4096..].iter().all(|&b| b == 0x55));

    // The base delta's own cluster must be untouched — the write went to a
    // brand-new top-level cluster.
    let mut base_buf = vec![0u8; CLUSTER_SIZE as usize];
    File::open(&base_path).unwrap().read_exact_at(&mut base_buf, CLUSTER_SIZE as u64).unwrap();
    assert_eq!(base_buf, base_cluster);

    image.close().unwrap();
}

#[test]
fn rejects_unaligned_offset_and_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("top.hdd");
    make_delta(&path, CLUSTER_SIZE, 4, 1, 1, &[], &[]);
    let mut image = Image::open(&[&path], test_options().mode(Mode::ReadWrite)).unwrap();

    let buf = vec![0u8; 100];
    let err = image.write(&buf, 0).unwrap_err();
    assert!(matches!(err, Error::Arg(ArgError::Unaligned)));

    let mut rbuf = vec![0u8; 4096];
    let err = image.read(&mut rbuf, 7).unwrap_err();
    assert!(matches!(err, Error::Arg(ArgError::Unaligned)));

    image.close().unwrap();
}

#[test]
fn rejects_read_write_past_logical_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("top.hdd");
    make_delta(&path, CLUSTER_SIZE, 1, 1, 1, &[], &[]);
    let image = Image::open(&[&path], test_options()).unwrap();

    let mut buf = vec![0u8; CLUSTER_SIZE as usize];
    let err = image.read(&mut buf, CLUSTER_SIZE as u64).unwrap_err();
    assert!(matches!(err, Error::Arg(ArgError::PastEnd { .. })));

    image.close().unwrap();
}

#[test]
fn rejects_write_to_read_only_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("top.hdd");
    make_delta(&path, CLUSTER_SIZE, 4, 1, 1, &[], &[]);
    let mut image = Image::open(&[&path], test_options()).unwrap();

    let buf = vec![0u8; 4096];
    let err = image.write(&buf, 0).unwrap_err();
    assert!(matches!(err, Error::Arg(ArgError::ReadOnly)));

    image.close().unwrap();
}

#[test]
fn rejects_write_beyond_bat_addressable_range() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("top.hdd");
    // bat_size_clusters=1 over an 8192-byte cluster addresses 2048-16=2032
    // logical clusters; declare a much larger logical size so the
    // past-logical-end check doesn't fire first.
    make_delta(&path, CLUSTER_SIZE, 3000, 1, 1, &[], &[]);
    let mut image = Image::open(&[&path], test_options().mode(Mode::ReadWrite)).unwrap();

    let buf = vec![0u8; 4096];
    let err = image.write(&buf, 2500 * CLUSTER_SIZE as u64).unwrap_err();
    assert!(matches!(err, Error::Arg(ArgError::TooLarge { .. })));

    image.close().unwrap();
}

#[test]
fn open_rejects_image_already_marked_in_use() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.hdd");
    make_delta(&path, CLUSTER_SIZE, 4, 1, 1, &[], &[]);

    // Simulate a crash while the image was open for writing: mark it in use
    // and leave it that way.
    let mut header = header_for(CLUSTER_SIZE, 4, 1);
    header.mark_in_use(true);
    File::options().write(true).open(&path).unwrap().write_all_at(header.as_bytes(), 0).unwrap();

    let err = Image::open(&[&path], test_options().mode(Mode::ReadWrite)).unwrap_err();
    assert!(matches!(err, Error::Format(FormatError::InUse)));
}

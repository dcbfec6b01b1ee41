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

//! `probe` subcommand: a scripted series of single-cluster reads against a
//! stack, grounded on the reference `read-blocks.c` tool. Each read lands in
//! an anonymous mmap scratch buffer rather than a file, since nothing here
//! needs the result to persist past the process.

use std::path::PathBuf;

use log::{info, warn};
use memmap2::MmapOptions;
use ploop_err::{Error, Result};
use ploop_image::{Image, OpenOptions};

pub fn run(deltas: &[PathBuf], offsets: &[u64]) -> Result<()> {
    let image = Image::open(deltas, OpenOptions::new())?;
    let cluster_size = image.cluster_size() as usize;

    let mut scratch = MmapOptions::new()
        .len(cluster_size)
        .map_anon()
        .map_err(ploop_err::ResourceError::Mmap)?;

    for &offset in offsets {
        match image.read(&mut scratch[..], offset) {
            Ok(n) => info!("probe offset={offset} ok, {n} bytes"),
            Err(Error::Arg(arg)) => warn!("probe offset={offset} rejected: {arg}"),
            Err(err) => return Err(err),
        }
    }

    image.close()
}

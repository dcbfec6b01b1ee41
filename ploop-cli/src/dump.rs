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

//! `dump` subcommand: read an entire delta stack in one call, grounded on
//! the reference `read-all.c` tool.

use std::path::{Path, PathBuf};

use log::info;
use memmap2::MmapOptions;
use ploop_err::{IoError, ResourceError, Result};
use ploop_image::{Image, OpenOptions};

pub fn run(deltas: &[PathBuf], out: &Path) -> Result<()> {
    let image = Image::open(deltas, OpenOptions::new())?;
    let size = image.logical_size_bytes();

    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(out)
        .map_err(|source| ResourceError::Open {
            path: out.display().to_string(),
            source,
        })?;
    file.set_len(size).map_err(|source| IoError::System {
        context: "sizing dump output file",
        source,
    })?;

    let mut mmap = unsafe { MmapOptions::new().len(size as usize).map_mut(&file) }.map_err(ResourceError::Mmap)?;
    let n = image.read(&mut mmap[..], 0)?;
    mmap.flush().map_err(ResourceError::Mmap)?;

    info!("dumped {n} of {size} bytes from {} level(s) to {}", image.levels(), out.display());
    image.close()
}

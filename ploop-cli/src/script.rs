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

//! The line-oriented scripted test driver: `add PATH`, `open MODE`,
//! `read OFFSET SIZE FILE`, `write OFFSET SIZE FILE`, `close`.
//!
//! Ports the reference driver's command set, fixing the bug noted in
//! spec.md §9: the reference matched `close` against the 6-byte prefix
//! `"close "` (with a trailing space meant for an argument `close` never
//! takes), so a bare `close` line was silently treated as unrecognized.
//! Here `close` is matched as a whole line.

use std::fs::File;
use std::path::{Path, PathBuf};

use log::info;
use memmap2::{Mmap, MmapOptions};
use ploop_image::{Image, Mode, OpenOptions};

use crate::{CliError, CliResult};

fn usage(msg: impl Into<String>) -> CliError {
    CliError::Usage(msg.into())
}

fn io_err(context: &'static str, source: std::io::Error) -> CliError {
    CliError::Engine(ploop_err::IoError::System { context, source }.into())
}

fn mmap_err(source: std::io::Error) -> CliError {
    CliError::Engine(ploop_err::ResourceError::Mmap(source).into())
}

struct IoArgs {
    offset: u64,
    size: u64,
    file: PathBuf,
}

fn parse_io_args(rest: &str) -> Option<IoArgs> {
    let mut parts = rest.split_whitespace();
    let offset = parts.next()?.parse().ok()?;
    let size = parts.next()?.parse().ok()?;
    let file = PathBuf::from(parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    Some(IoArgs { offset, size, file })
}

fn do_read(img: &Image, args: IoArgs) -> CliResult {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&args.file)
        .map_err(|e| io_err("creating read output file", e))?;
    file.set_len(args.size).map_err(|e| io_err("sizing read output file", e))?;

    let mut mmap = unsafe { MmapOptions::new().len(args.size as usize).map_mut(&file) }.map_err(mmap_err)?;
    let n = img.read(&mut mmap[..], args.offset)?;
    if n != args.size {
        return Err(CliError::Engine(
            ploop_err::IoError::Short {
                context: "read",
                expected: args.size as usize,
                got: n as usize,
            }
            .into(),
        ));
    }
    mmap.flush().map_err(mmap_err)?;
    Ok(())
}

fn do_write(img: &mut Image, args: IoArgs) -> CliResult {
    let file = File::open(&args.file).map_err(|e| io_err("opening write input file", e))?;
    let mmap = unsafe { Mmap::map(&file) }.map_err(mmap_err)?;
    if mmap.len() as u64 != args.size {
        return Err(usage(format!(
            "{} is {} bytes, command specifies {}",
            args.file.display(),
            mmap.len(),
            args.size
        )));
    }
    let n = img.write(&mmap[..], args.offset)?;
    if n != args.size {
        return Err(CliError::Engine(
            ploop_err::IoError::Short {
                context: "write",
                expected: args.size as usize,
                got: n as usize,
            }
            .into(),
        ));
    }
    Ok(())
}

pub fn run(cmdfile: &Path) -> CliResult {
    let contents =
        std::fs::read_to_string(cmdfile).map_err(|e| usage(format!("can't open {}: {e}", cmdfile.display())))?;

    let mut deltas: Vec<PathBuf> = Vec::new();
    let mut image: Option<Image> = None;

    for (i, line) in contents.lines().enumerate() {
        let lineno = i + 1;
        info!("CMD {line}");

        if let Some(rest) = line.strip_prefix("add ") {
            deltas.push(PathBuf::from(rest));
        } else if line.strip_prefix("open ").is_some() {
            // Mode is parsed but currently ignored: the stack is always
            // opened read-write, matching the reference driver's FIXME.
            if deltas.is_empty() {
                return Err(usage(format!("line {lineno}: no deltas added before open")));
            }
            if image.is_some() {
                return Err(usage(format!("line {lineno}: already opened")));
            }
            image = Some(Image::open(&deltas, OpenOptions::new().mode(Mode::ReadWrite))?);
        } else if let Some(rest) = line.strip_prefix("read ") {
            let img = image.as_ref().ok_or_else(|| usage(format!("line {lineno}: not opened")))?;
            let args = parse_io_args(rest).ok_or_else(|| usage(format!("line {lineno}: can't parse {line}")))?;
            do_read(img, args)?;
        } else if let Some(rest) = line.strip_prefix("write ") {
            let img = image.as_mut().ok_or_else(|| usage(format!("line {lineno}: not opened")))?;
            let args = parse_io_args(rest).ok_or_else(|| usage(format!("line {lineno}: can't parse {line}")))?;
            do_write(img, args)?;
        } else if line == "close" {
            let img = image.take().ok_or_else(|| usage(format!("line {lineno}: not opened")))?;
            img.close()?;
        } else {
            return Err(usage(format!("line {lineno}: unknown command {line}")));
        }
    }

    Ok(())
}

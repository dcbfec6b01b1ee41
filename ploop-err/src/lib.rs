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

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Operation attempted on a null/closed image handle.
    #[error("bad file descriptor")]
    BadHandle,
    #[error("invalid argument: {0}")]
    Arg(#[from] ArgError),
    #[error("I/O: {0}")]
    Io(#[from] IoError),
    #[error("format: {0}")]
    Format(#[from] FormatError),
    #[error("resource: {0}")]
    Resource(#[from] ResourceError),
}

#[derive(thiserror::Error, Debug)]
pub enum ArgError {
    #[error("at least one delta path is required")]
    NoDeltas,
    #[error("buf, size, or offset unaligned")]
    Unaligned,
    #[error("offset={offset} size={size} past logical end")]
    PastEnd { offset: u64, size: u64 },
    #[error("offset={offset} size={size} past BAT (BAT growing is not implemented)")]
    TooLarge { offset: u64, size: u64 },
    #[error("read-only")]
    ReadOnly,
}

#[derive(thiserror::Error, Debug)]
pub enum IoError {
    /// A short read/write/truncate, or the underlying syscall failed.
    #[error("{context}: {source}")]
    System {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: short transfer, expected {expected} got {got}")]
    Short {
        context: &'static str,
        expected: usize,
        got: usize,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("image doesn't look like a ploop delta file")]
    BadMagic,
    #[error("image is a v1 image; not supported")]
    V1Unsupported,
    #[error("image is not PRL_IMAGE_COMPRESSED")]
    WrongType,
    #[error("image is in use")]
    InUse,
    #[error("img got different cluster size {got}, expected {expected}")]
    ClusterSizeMismatch { expected: u32, got: u32 },
    #[error("BAT entry beyond block device size ({idx} -> {value})")]
    BatBeyondDevice { idx: u32, value: u32 },
    #[error("BAT entry points past EOF ({idx} -> {value})")]
    BatPastEof { idx: u32, value: u32 },
    #[error("BAT entry points to before data blocks ({idx} -> {value})")]
    BatBeforeData { idx: u32, value: u32 },
    #[error("corrupt BAT: entry {idx} already non-zero ({value})")]
    BatAlreadyOwned { idx: u32, value: u32 },
}

#[derive(thiserror::Error, Debug)]
pub enum ResourceError {
    #[error("memory allocation failed")]
    Alloc,
    #[error("mmap failed: {0}")]
    Mmap(std::io::Error),
    #[error("can't open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

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

//! Layered block-image engine: a merged, copy-on-write view over a stack of
//! ploop-style delta files. [`Image`] is the entry point; [`ploop_format`]
//! defines the on-disk structures this crate parses and writes.

mod aligned;
mod image;
mod map;
mod options;

pub use image::Image;
pub use options::{Mode, MsyncPolicy, OpenOptions};

pub use ploop_err::{Error, Result};

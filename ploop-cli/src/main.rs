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

//! Command-line front end for the layered block-image engine: a scripted
//! test driver plus two read-only diagnostic subcommands.

mod dump;
mod probe;
mod script;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ploop", about = "layered block-image engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a line-oriented command file: add/open/read/write/close.
    Script { cmdfile: PathBuf },
    /// Reads an entire delta stack into a freshly created output file.
    Dump {
        #[arg(long)]
        out: PathBuf,
        #[arg(required = true)]
        deltas: Vec<PathBuf>,
    },
    /// Issues a scripted series of single-cluster reads against a stack.
    Probe {
        #[arg(required = true)]
        deltas: Vec<PathBuf>,
        #[arg(long, value_delimiter = ',')]
        offsets: Vec<u64>,
    },
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Script { cmdfile } => script::run(&cmdfile),
        Command::Dump { deltas, out } => dump::run(&deltas, &out).map_err(Into::into),
        Command::Probe { deltas, offsets } => probe::run(&deltas, &offsets).map_err(Into::into),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Usage(msg)) => {
            eprintln!("Error: {msg}");
            ExitCode::from(2)
        }
        Err(CliError::Engine(err)) => {
            eprintln!("Error: {err}");
            ExitCode::from(1)
        }
    }
}

/// Mirrors the reference driver's two exit codes: 2 for usage/parse
/// failures, 1 for everything the engine itself rejects.
pub(crate) enum CliError {
    Usage(String),
    Engine(ploop_err::Error),
}

impl From<ploop_err::Error> for CliError {
    fn from(err: ploop_err::Error) -> Self {
        CliError::Engine(err)
    }
}

pub(crate) type CliResult = Result<(), CliError>;

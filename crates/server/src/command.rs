// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tokenizer for memcache command lines.

use roost_common_storage_queue::path::MAX_QUEUE_NAME_LEN;

/// A parsed command line, without its trailing CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `set <name> <flags> <expiry> <bytes>`; a data chunk follows.
    Set {
        name:   String,
        flags:  u32,
        expiry: u32,
        len:    usize,
    },
    /// `get <name> [<name> ...]`
    Get { names: Vec<String> },
    /// `delete <name> [<time>]`
    Delete { name: String },
    Stats,
    Shutdown,
    Version,
    Quit,
    Unknown,
}

impl Command {
    /// Classifies one command line. Anything malformed is [`Command::Unknown`].
    pub fn parse(line: &[u8]) -> Self {
        let Ok(line) = std::str::from_utf8(line) else {
            return Self::Unknown;
        };
        let mut tokens = line.split_ascii_whitespace();
        let Some(verb) = tokens.next() else {
            return Self::Unknown;
        };
        let args: Vec<&str> = tokens.collect();

        match (verb, args.as_slice()) {
            ("set", [name, flags, expiry, len]) => parse_set(name, flags, expiry, len),
            ("get", names) if !names.is_empty() => {
                if names.iter().all(|n| is_valid_key(n)) {
                    Self::Get {
                        names: names.iter().map(|n| (*n).to_string()).collect(),
                    }
                } else {
                    Self::Unknown
                }
            }
            ("delete", [name]) if is_valid_key(name) => Self::Delete {
                name: (*name).to_string(),
            },
            ("delete", [name, time]) if is_valid_key(name) && time.parse::<u64>().is_ok() => {
                Self::Delete {
                    name: (*name).to_string(),
                }
            }
            ("stats", []) => Self::Stats,
            ("shutdown", []) => Self::Shutdown,
            ("version", []) => Self::Version,
            ("quit", []) => Self::Quit,
            _ => Self::Unknown,
        }
    }
}

fn parse_set(name: &str, flags: &str, expiry: &str, len: &str) -> Command {
    if !is_valid_key(name) {
        return Command::Unknown;
    }
    match (flags.parse(), expiry.parse(), len.parse()) {
        (Ok(flags), Ok(expiry), Ok(len)) => Command::Set {
            name: name.to_string(),
            flags,
            expiry,
            len,
        },
        _ => Command::Unknown,
    }
}

fn is_valid_key(key: &str) -> bool { !key.is_empty() && key.len() <= MAX_QUEUE_NAME_LEN }

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

//! Per-connection memcache protocol state machine.
//!
//! [`ProtocolHandler`] is sans-I/O: the transport hands it whatever bytes
//! arrived and writes back whatever [`Reply`] it returns.
//!
//! ```text
//!                  set <name> <flags> <expiry> <bytes>\r\n
//!   ┌──────────────────────┐ ───────────────────────────▶ ┌────────────────────┐
//!   │ AwaitingCommandLine  │                              │ AwaitingDataChunk  │
//!   └──────────────────────┘ ◀─────────────────────────── └────────────────────┘
//!                           <bytes + 2> octets received
//! ```
//!
//! A `set` larger than the item limit is not buffered: its chunk is skipped
//! as it arrives and answered with `SERVER_ERROR`.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use roost_common_storage_queue::{QueueError, QueueRegistry};
use snafu::{ResultExt, Snafu};
use tracing::{debug, error, info, trace, warn};

use crate::{command::Command, config::DEFAULT_MAX_ITEM_SIZE, envelope, stats::ServerStats};

/// Version reported by `version` and `STATS`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const CRLF: &[u8] = b"\r\n";
const ERR_UNKNOWN_COMMAND: &[u8] = b"CLIENT_ERROR bad command line format\r\n";
const ERR_BAD_DATA_CHUNK: &[u8] = b"CLIENT_ERROR bad data chunk\r\nERROR\r\n";
const GET_RESPONSE_EMPTY: &[u8] = b"END\r\n";
const SET_RESPONSE_SUCCESS: &[u8] = b"STORED\r\n";
const SET_RESPONSE_FAILURE: &[u8] = b"NOT STORED\r\n";
const DELETE_RESPONSE_SUCCESS: &[u8] = b"DELETED\r\n";
const DELETE_RESPONSE_MISSING: &[u8] = b"NOT_FOUND\r\n";
const ERR_ITEM_TOO_LARGE: &[u8] = b"SERVER_ERROR object too large for cache\r\n";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProtocolError {
    #[snafu(display("Queue storage failure"))]
    Storage {
        source: QueueError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Stored item of {len} bytes has no expiry header"))]
    MalformedEnvelope {
        len: usize,
        #[snafu(implicit)]
        loc: snafu::Location,
    },
}

/// Bytes to send back plus what the transport should do next.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reply {
    pub response: Bytes,
    /// The client asked the broker to terminate.
    pub shutdown: bool,
    /// The client asked to close this connection.
    pub close:    bool,
}

#[derive(Debug)]
struct PendingSet {
    name:     String,
    flags:    u32,
    expiry:   u32,
    /// Payload length plus the trailing CRLF.
    expected: usize,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    AwaitingCommandLine,
    AwaitingDataChunk(PendingSet),
    /// Skipping the chunk of an oversized `set`; bytes still to drop.
    DiscardingDataChunk(usize),
}

enum Action {
    Continue,
    Shutdown,
    Close,
}

pub struct ProtocolHandler {
    registry:        Arc<QueueRegistry>,
    stats:           Arc<ServerStats>,
    max_line_length: usize,
    max_item_size:   usize,
    buffer:          BytesMut,
    state:           State,
}

impl ProtocolHandler {
    pub fn new(
        registry: Arc<QueueRegistry>,
        stats: Arc<ServerStats>,
        max_line_length: usize,
    ) -> Self {
        Self {
            registry,
            stats,
            max_line_length,
            max_item_size: DEFAULT_MAX_ITEM_SIZE,
            buffer: BytesMut::new(),
            state: State::AwaitingCommandLine,
        }
    }

    /// Largest `set` payload accepted.
    #[must_use]
    pub fn with_max_item_size(mut self, max_item_size: usize) -> Self {
        self.max_item_size = max_item_size;
        self
    }

    /// Whether a `set` is waiting for its data chunk.
    pub const fn is_awaiting_data(&self) -> bool {
        matches!(
            self.state,
            State::AwaitingDataChunk(_) | State::DiscardingDataChunk(_)
        )
    }

    /// Feeds received bytes through the state machine.
    ///
    /// Every complete command in `incoming` is executed in order; a partial
    /// command stays buffered for the next call.
    pub fn receive(&mut self, incoming: &[u8]) -> Reply {
        self.stats.record_read(incoming.len());
        self.buffer.extend_from_slice(incoming);

        let mut out = BytesMut::new();
        let mut reply = Reply::default();
        loop {
            let action = match std::mem::take(&mut self.state) {
                State::AwaitingCommandLine => {
                    let Some(pos) = find_crlf(&self.buffer) else {
                        if self.buffer.len() > self.max_line_length {
                            warn!(len = self.buffer.len(), "Command line too long, discarding");
                            self.buffer.clear();
                            out.extend_from_slice(ERR_UNKNOWN_COMMAND);
                        }
                        break;
                    };
                    let line = self.buffer.split_to(pos + CRLF.len()).freeze();
                    if pos > self.max_line_length {
                        warn!(len = pos, "Command line too long, discarding");
                        out.extend_from_slice(ERR_UNKNOWN_COMMAND);
                        Action::Continue
                    } else {
                        self.process_line(&line[..pos], &mut out)
                    }
                }
                State::AwaitingDataChunk(pending) => {
                    if self.buffer.len() < pending.expected {
                        self.state = State::AwaitingDataChunk(pending);
                        break;
                    }
                    let chunk = self.buffer.split_to(pending.expected).freeze();
                    self.process_chunk(pending, &chunk, &mut out);
                    Action::Continue
                }
                State::DiscardingDataChunk(remaining) => {
                    let dropped = remaining.min(self.buffer.len());
                    self.buffer.advance(dropped);
                    if dropped < remaining {
                        self.state = State::DiscardingDataChunk(remaining - dropped);
                        break;
                    }
                    out.extend_from_slice(ERR_ITEM_TOO_LARGE);
                    Action::Continue
                }
            };

            match action {
                Action::Continue => {}
                Action::Shutdown => {
                    reply.shutdown = true;
                    break;
                }
                Action::Close => {
                    reply.close = true;
                    break;
                }
            }
        }

        self.stats.record_written(out.len());
        reply.response = out.freeze();
        reply
    }

    fn process_line(&mut self, line: &[u8], out: &mut BytesMut) -> Action {
        let command = Command::parse(line);
        trace!(?command, "Command received");

        let mut response = BytesMut::new();
        match self.execute(command, line, &mut response) {
            Ok(action) => {
                out.extend_from_slice(&response);
                action
            }
            Err(e) => {
                error!(error = ?e, "Error handling request");
                out.extend_from_slice(GET_RESPONSE_EMPTY);
                Action::Continue
            }
        }
    }

    fn execute(
        &mut self,
        command: Command,
        line: &[u8],
        response: &mut BytesMut,
    ) -> Result<Action, ProtocolError> {
        match command {
            Command::Set {
                name,
                flags,
                expiry,
                len,
            } => {
                self.stats.record_set();
                if len > self.max_item_size {
                    warn!(
                        queue = %name,
                        len,
                        limit = self.max_item_size,
                        "Item too large, discarding"
                    );
                    self.state = State::DiscardingDataChunk(len.saturating_add(CRLF.len()));
                    return Ok(Action::Continue);
                }
                let Some(expected) = len.checked_add(CRLF.len()) else {
                    response.extend_from_slice(ERR_UNKNOWN_COMMAND);
                    return Ok(Action::Continue);
                };
                self.state = State::AwaitingDataChunk(PendingSet {
                    name,
                    flags,
                    expiry,
                    expected,
                });
            }
            Command::Get { names } => {
                let now = chrono::Utc::now().timestamp();
                for name in &names {
                    self.stats.record_get();
                    // Items already popped for earlier keys must still be sent.
                    if let Err(e) = self.get(name, now, response) {
                        error!(queue = %name, error = ?e, "Error reading queue, skipping key");
                    }
                }
                response.extend_from_slice(GET_RESPONSE_EMPTY);
            }
            Command::Delete { name } => {
                let deleted = self.registry.delete(&name).context(StorageSnafu)?;
                response.extend_from_slice(if deleted {
                    DELETE_RESPONSE_SUCCESS
                } else {
                    DELETE_RESPONSE_MISSING
                });
            }
            Command::Stats => response.extend_from_slice(self.render_stats().as_bytes()),
            Command::Shutdown => {
                info!("Shutdown requested by client");
                return Ok(Action::Shutdown);
            }
            Command::Version => {
                response.extend_from_slice(format!("VERSION {VERSION}\r\n").as_bytes());
            }
            Command::Quit => return Ok(Action::Close),
            Command::Unknown => {
                warn!(line = %String::from_utf8_lossy(line), "Unknown command");
                response.extend_from_slice(ERR_UNKNOWN_COMMAND);
            }
        }
        Ok(Action::Continue)
    }

    /// Pops from `name` until a live item turns up; expired items are
    /// dropped and counted.
    fn get(&self, name: &str, now: i64, response: &mut BytesMut) -> Result<(), ProtocolError> {
        while let Some(item) = self.registry.take(name).context(StorageSnafu)? {
            let (expiry, payload) = envelope::unpack(item)?;
            if envelope::is_live(expiry, now) {
                response.extend_from_slice(
                    format!("VALUE {name} 0 {}\r\n", payload.len()).as_bytes(),
                );
                response.extend_from_slice(&payload);
                response.extend_from_slice(CRLF);
                return Ok(());
            }
            debug!(queue = name, expiry, "Dropping expired item");
            self.registry.record_expired(name);
        }
        Ok(())
    }

    fn process_chunk(&self, pending: PendingSet, chunk: &[u8], out: &mut BytesMut) {
        let Some(payload) = chunk.strip_suffix(CRLF) else {
            warn!(queue = %pending.name, len = chunk.len(), "Data chunk not terminated by CRLF");
            out.extend_from_slice(ERR_BAD_DATA_CHUNK);
            return;
        };

        trace!(queue = %pending.name, flags = pending.flags, len = payload.len(), "Storing item");
        let item = envelope::pack(pending.expiry, payload);
        match self.registry.put(&pending.name, item) {
            Ok(true) => out.extend_from_slice(SET_RESPONSE_SUCCESS),
            Ok(false) => out.extend_from_slice(SET_RESPONSE_FAILURE),
            Err(e) => {
                error!(queue = %pending.name, error = ?e, "Error storing item");
                out.extend_from_slice(GET_RESPONSE_EMPTY);
            }
        }
    }

    fn render_stats(&self) -> String {
        let registry = self.registry.stats();
        let (rusage_user, rusage_system) = crate::stats::rusage();
        let mut out = String::with_capacity(1024);
        let mut stat = |key: &str, value: &dyn std::fmt::Display| {
            out.push_str(&format!("STAT {key} {value}\r\n"));
        };

        stat("pid", &std::process::id());
        stat("uptime", &self.stats.uptime_secs());
        stat("time", &chrono::Utc::now().timestamp());
        stat("version", &VERSION);
        stat("rusage_user", &format!("{rusage_user:.6}"));
        stat("rusage_system", &format!("{rusage_system:.6}"));
        stat("curr_items", &registry.current_size);
        stat("total_items", &registry.total_items);
        stat("bytes", &registry.current_bytes);
        stat("curr_connections", &self.stats.curr_connections());
        stat("total_connections", &self.stats.total_connections());
        stat("cmd_get", &self.stats.cmd_get());
        stat("cmd_set", &self.stats.cmd_set());
        stat("get_hits", &registry.get_hits);
        stat("get_misses", &registry.get_misses);
        stat("bytes_read", &self.stats.bytes_read());
        stat("bytes_written", &self.stats.bytes_written());
        stat("limit_maxbytes", &0);

        for queue in self.registry.queue_stats() {
            let name = &queue.name;
            stat(&format!("queue_{name}_items"), &queue.items);
            stat(&format!("queue_{name}_total_items"), &queue.total_items);
            stat(&format!("queue_{name}_logsize"), &queue.logsize);
            stat(&format!("queue_{name}_expired_items"), &queue.expired_items);
            stat(&format!("queue_{name}_age"), &queue.age);
        }
        out.push_str("END\r\n");
        out
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> { buf.windows(CRLF.len()).position(|w| w == CRLF) }

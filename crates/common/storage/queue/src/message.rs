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

//! On-disk record formats.
//!
//! ## Journal records
//!
//! A transactional queue journal is a sequence of variable length records:
//!
//! ```text
//! PUSH: ┌────────────┬─────────────────┬──────────────────────┐
//!       │ 0x00 (1B)  │ Length (4B LE)  │ Payload (variable)   │
//!       └────────────┴─────────────────┴──────────────────────┘
//! POP:  ┌────────────┐
//!       │ 0x01 (1B)  │
//!       └────────────┘
//! ```
//!
//! ## Segment frames
//!
//! Segment files of the overflow log hold bare frames:
//!
//! ```text
//! ┌─────────────────┬──────────────────────┐
//! │ Length (4B LE)  │ Payload (variable)   │
//! └─────────────────┴──────────────────────┘
//! ```
//!
//! Neither format carries a checksum. A record cut short by a crash is
//! detected because its declared length runs past the end of the file.

use std::io::{self, Read};

use bytes::{BufMut, Bytes, BytesMut};
use snafu::OptionExt;

use crate::error::ItemTooLargeSnafu;

/// Opcode of a journal PUSH record.
pub(crate) const OP_PUSH: u8 = 0x00;

/// Opcode of a journal POP record.
pub(crate) const OP_POP: u8 = 0x01;

/// Size of the length prefix in bytes (4 bytes = u32).
pub(crate) const LENGTH_PREFIX_SIZE: usize = 4;

/// Encoded journal PUSH record for `payload`.
pub(crate) fn encode_push(payload: &[u8]) -> crate::Result<Bytes> {
    let length = length_prefix(payload.len())?;
    let mut buf = BytesMut::with_capacity(1 + LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u8(OP_PUSH);
    buf.put_u32_le(length);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Encoded segment frame for `payload`.
pub(crate) fn encode_frame(payload: &[u8]) -> crate::Result<Bytes> {
    let length = length_prefix(payload.len())?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32_le(length);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// The 4-byte prefix cannot describe payloads of 4 GiB or more.
fn length_prefix(len: usize) -> crate::Result<u32> {
    u32::try_from(len).ok().context(ItemTooLargeSnafu { len })
}

/// A decoded journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JournalRecord {
    Push(Bytes),
    Pop,
}

/// Why a scan stopped before reaching the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Anomaly {
    /// The last record's header or payload runs past the end of the file.
    Truncated,
    /// An opcode other than PUSH or POP.
    UnknownOpcode(u8),
}

/// Outcome of reading one record.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome<T> {
    Record(T),
    /// Clean end of file on a record boundary.
    End,
    /// Everything from [`RecordReader::offset`] on must be treated as absent.
    Stop(Anomaly),
}

/// Sequential reader over journal records or segment frames.
///
/// Tracks the byte offset of the end of the last complete record so callers
/// can truncate a torn tail before appending.
pub(crate) struct RecordReader<R> {
    inner:  R,
    offset: u64,
    len:    u64,
}

impl<R: Read> RecordReader<R> {
    /// `len` is the total number of bytes `inner` will yield.
    pub(crate) const fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            offset: 0,
            len,
        }
    }

    /// Offset just past the last complete record.
    pub(crate) const fn offset(&self) -> u64 { self.offset }

    pub(crate) fn next_journal_record(&mut self) -> io::Result<ReadOutcome<JournalRecord>> {
        let mut op = [0u8; 1];
        if self.fill(&mut op)? == 0 {
            return Ok(ReadOutcome::End);
        }
        match op[0] {
            OP_PUSH => Ok(match self.read_payload(1)? {
                ReadOutcome::Record(payload) => ReadOutcome::Record(JournalRecord::Push(payload)),
                ReadOutcome::End => ReadOutcome::Stop(Anomaly::Truncated),
                ReadOutcome::Stop(anomaly) => ReadOutcome::Stop(anomaly),
            }),
            OP_POP => {
                self.offset += 1;
                Ok(ReadOutcome::Record(JournalRecord::Pop))
            }
            other => Ok(ReadOutcome::Stop(Anomaly::UnknownOpcode(other))),
        }
    }

    pub(crate) fn next_frame(&mut self) -> io::Result<ReadOutcome<Bytes>> { self.read_payload(0) }

    /// Skips over the next frame without reading its payload.
    pub(crate) fn skip_frame(&mut self) -> io::Result<ReadOutcome<u32>>
    where
        R: io::Seek,
    {
        let Some(length) = self.read_length(0)? else {
            return Ok(ReadOutcome::End);
        };
        let length = match length {
            Ok(length) => length,
            Err(anomaly) => return Ok(ReadOutcome::Stop(anomaly)),
        };
        self.inner.seek(io::SeekFrom::Current(i64::from(length)))?;
        self.offset += (LENGTH_PREFIX_SIZE as u64) + u64::from(length);
        Ok(ReadOutcome::Record(length))
    }

    /// Reads `[len][payload]`; `consumed` header bytes were already read for
    /// this record.
    fn read_payload(&mut self, consumed: u64) -> io::Result<ReadOutcome<Bytes>> {
        let Some(length) = self.read_length(consumed)? else {
            return Ok(if consumed == 0 {
                ReadOutcome::End
            } else {
                ReadOutcome::Stop(Anomaly::Truncated)
            });
        };
        let length = match length {
            Ok(length) => length,
            Err(anomaly) => return Ok(ReadOutcome::Stop(anomaly)),
        };

        let mut payload = vec![0u8; length as usize];
        if self.fill(&mut payload)? != payload.len() {
            return Ok(ReadOutcome::Stop(Anomaly::Truncated));
        }
        self.offset += consumed + (LENGTH_PREFIX_SIZE as u64) + u64::from(length);
        Ok(ReadOutcome::Record(Bytes::from(payload)))
    }

    /// Returns `None` on a clean EOF, `Some(Err)` when the declared length
    /// cannot fit in the rest of the file.
    fn read_length(&mut self, consumed: u64) -> io::Result<Option<Result<u32, Anomaly>>> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        match self.fill(&mut prefix)? {
            0 => return Ok(None),
            LENGTH_PREFIX_SIZE => {}
            _ => return Ok(Some(Err(Anomaly::Truncated))),
        }
        let length = u32::from_le_bytes(prefix);
        let remaining = self
            .len
            .saturating_sub(self.offset + consumed + LENGTH_PREFIX_SIZE as u64);
        if u64::from(length) > remaining {
            return Ok(Some(Err(Anomaly::Truncated)));
        }
        Ok(Some(Ok(length)))
    }

    /// Reads until `buf` is full or EOF; returns the number of bytes read.
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            match self.inner.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }
}

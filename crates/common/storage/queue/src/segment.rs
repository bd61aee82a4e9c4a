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

//! Unbounded overflow store made of numbered segment files.
//!
//! ```text
//! base/segmented/<name>/
//! ├── 00000000000000000000.seg   oldest, consumed first
//! ├── 00000000000000000001.seg
//! └── 00000000000000000002.seg   active, receives appends
//! ```
//!
//! Each segment holds at most `segment_max_items` frames. Segments are only
//! ever consumed whole: every frame of the oldest segment is handed to a sink
//! and the file is deleted afterwards.

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, error, info, warn};

use crate::{
    FlushMode, QueueConfig, Result,
    error::{IoSnafu, NoTransactionLogSnafu},
    message::{LENGTH_PREFIX_SIZE, ReadOutcome, RecordReader, encode_frame},
    path::{scan_segment_files, segment_dir, segment_file_path, validate_queue_name},
};

#[derive(Debug)]
struct SegmentMeta {
    sequence: u64,
    path:     PathBuf,
    items:    u64,
    bytes:    u64,
}

struct SegmentState {
    /// Oldest first; the last entry is the active segment.
    segments:    VecDeque<SegmentMeta>,
    active:      Option<File>,
    total_items: u64,
}

/// Append-only log of length-prefixed frames split across segment files.
pub struct SegmentedLog {
    name:          String,
    dir:           PathBuf,
    max_items:     u64,
    flush_mode:    FlushMode,
    initial_bytes: u64,
    state:         Mutex<SegmentState>,
}

impl SegmentedLog {
    /// Opens the segment directory of `name`, creating it if needed.
    ///
    /// Existing segments are counted by skipping over their frames. A torn
    /// frame at the end of the active segment is cut off.
    pub fn open(config: &QueueConfig, name: &str) -> Result<Self> {
        validate_queue_name(name)?;
        let dir = segment_dir(&config.base_path, name);
        std::fs::create_dir_all(&dir).context(IoSnafu { path: &dir })?;

        let files = scan_segment_files(&dir)?;
        let last_index = files.len().saturating_sub(1);
        let mut segments = VecDeque::with_capacity(files.len().max(1));
        for (index, (sequence, path)) in files.into_iter().enumerate() {
            let (items, bytes) = count_frames(name, &path, index == last_index)?;
            segments.push_back(SegmentMeta {
                sequence,
                path,
                items,
                bytes,
            });
        }

        if segments.is_empty() {
            segments.push_back(SegmentMeta {
                sequence: 0,
                path:     segment_file_path(&dir, 0),
                items:    0,
                bytes:    0,
            });
        }
        let active_path = segments
            .back()
            .map_or_else(|| segment_file_path(&dir, 0), |s| s.path.clone());
        let active = open_segment(&active_path)?;

        let total_items: u64 = segments.iter().map(|s| s.items).sum();
        let logsize: u64 = segments.iter().map(|s| s.bytes).sum();
        let initial_bytes = logsize.saturating_sub(LENGTH_PREFIX_SIZE as u64 * total_items);

        info!(
            queue = name,
            dir = ?dir,
            segments = segments.len(),
            items = total_items,
            logsize,
            "Segmented log opened"
        );

        Ok(Self {
            name: name.to_string(),
            dir,
            max_items: config.segment_max_items.max(1),
            flush_mode: config.flush_mode,
            initial_bytes,
            state: Mutex::new(SegmentState {
                segments,
                active: Some(active),
                total_items,
            }),
        })
    }

    pub fn dir(&self) -> &Path { &self.dir }

    /// Appends one frame to the active segment, rotating first if it is full.
    pub fn push(&self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload)?;
        let mut state = self.state.lock();
        if state.active.is_none() {
            return NoTransactionLogSnafu {
                name: self.name.as_str(),
            }
            .fail();
        }
        if state.segments.back().is_some_and(|s| s.items >= self.max_items) {
            self.roll(&mut state)?;
        }

        let path = state
            .segments
            .back()
            .map(|s| s.path.clone())
            .unwrap_or_default();
        let active = state.active.as_mut().context(NoTransactionLogSnafu {
            name: self.name.as_str(),
        })?;
        active.write_all(&frame).context(IoSnafu { path: &path })?;
        if self.flush_mode == FlushMode::Sync {
            active.sync_data().context(IoSnafu { path: &path })?;
        }

        if let Some(meta) = state.segments.back_mut() {
            meta.items += 1;
            meta.bytes += frame.len() as u64;
        }
        state.total_items += 1;
        Ok(())
    }

    /// Moves every item of the oldest segment into `sink`, in order, then
    /// deletes that segment. Returns the number of items moved.
    ///
    /// When the oldest segment is also the active one it is sealed first so
    /// later pushes go to a new file. If `sink` fails part way, the items it
    /// has not accepted are written back as the oldest segment.
    pub fn consume_into<F>(&self, mut sink: F) -> Result<u64>
    where
        F: FnMut(Bytes) -> Result<()>,
    {
        let mut state = self.state.lock();
        if state.active.is_none() {
            return NoTransactionLogSnafu {
                name: self.name.as_str(),
            }
            .fail();
        }
        let oldest_items = state.segments.front().map_or(0, |s| s.items);
        if state.segments.len() <= 1 {
            if oldest_items == 0 {
                return Ok(0);
            }
            self.roll(&mut state)?;
        }
        let Some(mut oldest) = state.segments.pop_front() else {
            return Ok(0);
        };

        let frames = match read_frames(&self.name, &oldest.path) {
            Ok(frames) => frames,
            Err(e) => {
                state.segments.push_front(oldest);
                return Err(e);
            }
        };

        for (delivered, payload) in frames.iter().enumerate() {
            if let Err(e) = sink(payload.clone()) {
                let remaining = &frames[delivered..];
                if let Err(rewrite) = rewrite_segment(&oldest.path, remaining) {
                    error!(
                        queue = %self.name,
                        path = ?oldest.path,
                        error = %rewrite,
                        "Failed to write back undelivered segment items"
                    );
                }
                oldest.items = remaining.len() as u64;
                oldest.bytes = remaining
                    .iter()
                    .map(|p| LENGTH_PREFIX_SIZE as u64 + p.len() as u64)
                    .sum();
                state.segments.push_front(oldest);
                return Err(e);
            }
        }

        // Every frame is delivered at this point; the segment must not come
        // back on the next open even if it cannot be unlinked.
        retire_segment(&self.name, &oldest.path);
        debug!(
            queue = %self.name,
            sequence = oldest.sequence,
            items = frames.len(),
            "Segment consumed"
        );
        Ok(frames.len() as u64)
    }

    /// Pending items across all segments.
    pub fn len(&self) -> u64 { self.state.lock().segments.iter().map(|s| s.items).sum() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Bytes on disk across all segments.
    pub fn logsize(&self) -> u64 { self.state.lock().segments.iter().map(|s| s.bytes).sum() }

    pub fn total_items(&self) -> u64 { self.state.lock().total_items }

    /// Payload bytes that were pending at open.
    pub fn initial_bytes(&self) -> u64 { self.initial_bytes }

    pub fn segment_count(&self) -> usize { self.state.lock().segments.len() }

    pub fn close(&self) -> Result<()> {
        let active = self.state.lock().active.take();
        if let Some(active) = active {
            active.sync_all().context(IoSnafu { path: &self.dir })?;
            debug!(queue = %self.name, "Segmented log closed");
        }
        Ok(())
    }

    /// Closes the log and removes its directory.
    pub fn purge(&self) -> Result<()> {
        self.close()?;
        self.state.lock().segments.clear();
        match std::fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(e).context(IoSnafu { path: &self.dir })
            }
            _ => {
                info!(queue = %self.name, "Segmented log purged");
                Ok(())
            }
        }
    }

    /// Seals the active segment and opens the next one.
    fn roll(&self, state: &mut SegmentState) -> Result<()> {
        let sequence = state.segments.back().map_or(0, |s| s.sequence + 1);
        let path = segment_file_path(&self.dir, sequence);
        let file = open_segment(&path)?;
        if let (Some(previous), Some(sealed)) = (state.active.replace(file), state.segments.back()) {
            if self.flush_mode == FlushMode::Sync {
                previous.sync_all().context(IoSnafu { path: &sealed.path })?;
            }
        }
        state.segments.push_back(SegmentMeta {
            sequence,
            path,
            items: 0,
            bytes: 0,
        });
        debug!(queue = %self.name, sequence, "Segment rolled");
        Ok(())
    }
}

fn open_segment(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .context(IoSnafu { path })
}

/// Counts complete frames without reading payloads. Returns `(items, bytes)`
/// where `bytes` covers the complete frames only.
fn count_frames(name: &str, path: &Path, is_active: bool) -> Result<(u64, u64)> {
    let file = OpenOptions::new()
        .read(true)
        .write(is_active)
        .open(path)
        .context(IoSnafu { path })?;
    let file_len = file.metadata().context(IoSnafu { path })?.len();
    let mut reader = RecordReader::new(BufReader::new(&file), file_len);
    let mut items = 0;

    loop {
        match reader.skip_frame().context(IoSnafu { path })? {
            ReadOutcome::Record(_) => items += 1,
            ReadOutcome::End => break,
            ReadOutcome::Stop(anomaly) => {
                warn!(
                    queue = name,
                    path = ?path,
                    offset = reader.offset(),
                    file_len,
                    ?anomaly,
                    "Discarding unreadable segment tail"
                );
                if is_active {
                    file.set_len(reader.offset()).context(IoSnafu { path })?;
                }
                break;
            }
        }
    }
    Ok((items, reader.offset()))
}

/// Deletes a fully consumed segment, falling back to emptying it.
fn retire_segment(name: &str, path: &Path) {
    let Err(e) = std::fs::remove_file(path) else {
        return;
    };
    if e.kind() == std::io::ErrorKind::NotFound {
        return;
    }
    warn!(queue = name, path = ?path, error = %e, "Failed to remove consumed segment, truncating");
    let truncated = OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_len(0));
    if let Err(e) = truncated {
        error!(
            queue = name,
            path = ?path,
            error = %e,
            "Consumed segment left on disk; its items will be replayed"
        );
    }
}

fn read_frames(name: &str, path: &Path) -> Result<Vec<Bytes>> {
    let file = File::open(path).context(IoSnafu { path })?;
    let file_len = file.metadata().context(IoSnafu { path })?.len();
    let mut reader = RecordReader::new(BufReader::new(file), file_len);
    let mut frames = Vec::new();

    loop {
        match reader.next_frame().context(IoSnafu { path })? {
            ReadOutcome::Record(payload) => frames.push(payload),
            ReadOutcome::End => break,
            ReadOutcome::Stop(anomaly) => {
                warn!(queue = name, path = ?path, ?anomaly, "Segment ends in a torn frame");
                break;
            }
        }
    }
    Ok(frames)
}

fn rewrite_segment(path: &Path, frames: &[Bytes]) -> Result<()> {
    let mut file = File::create(path).context(IoSnafu { path })?;
    for payload in frames {
        file.write_all(&encode_frame(payload)?)
            .context(IoSnafu { path })?;
    }
    file.sync_all().context(IoSnafu { path })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::QueueError;

    fn test_config(temp_dir: &TempDir, max_items: u64) -> QueueConfig {
        QueueConfig {
            base_path: temp_dir.path().to_path_buf(),
            segment_max_items: max_items,
            ..Default::default()
        }
    }

    fn consume_all(log: &SegmentedLog) -> Vec<Bytes> {
        let mut out = Vec::new();
        while !log.is_empty() {
            log.consume_into(|p| {
                out.push(p);
                Ok(())
            })
            .unwrap();
        }
        out
    }

    #[test]
    fn test_push_rolls_segments() {
        let temp_dir = TempDir::new().unwrap();
        let log = SegmentedLog::open(&test_config(&temp_dir, 2), "rolls").unwrap();

        for i in 0..5 {
            log.push(format!("item-{i}").as_bytes()).unwrap();
        }

        assert_eq!(log.segment_count(), 3);
        assert_eq!(scan_segment_files(log.dir()).unwrap().len(), 3);
        assert_eq!(log.len(), 5);
        assert_eq!(log.logsize(), 5 * (4 + 6));
    }

    #[test]
    fn test_consume_moves_oldest_segment() {
        let temp_dir = TempDir::new().unwrap();
        let log = SegmentedLog::open(&test_config(&temp_dir, 2), "oldest").unwrap();
        for item in ["a", "b", "c"] {
            log.push(item.as_bytes()).unwrap();
        }

        let mut sink = Vec::new();
        let moved = log
            .consume_into(|p| {
                sink.push(p);
                Ok(())
            })
            .unwrap();

        assert_eq!(moved, 2);
        assert_eq!(sink, vec!["a", "b"]);
        assert_eq!(log.len(), 1);
        assert_eq!(scan_segment_files(log.dir()).unwrap().len(), 1);
    }

    #[test]
    fn test_consume_order_across_segments() {
        let temp_dir = TempDir::new().unwrap();
        let log = SegmentedLog::open(&test_config(&temp_dir, 3), "order").unwrap();
        let expected: Vec<Bytes> = (0..10).map(|i| Bytes::from(format!("{i}"))).collect();
        for item in &expected {
            log.push(item).unwrap();
        }

        assert_eq!(consume_all(&log), expected);
        assert_eq!(log.logsize(), 0);
    }

    #[test]
    fn test_consume_empty_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let log = SegmentedLog::open(&test_config(&temp_dir, 3), "empty").unwrap();

        let moved = log.consume_into(|_| panic!("nothing to deliver")).unwrap();
        assert_eq!(moved, 0);
        assert_eq!(log.segment_count(), 1);
    }

    #[test]
    fn test_consume_seals_partial_active_segment() {
        let temp_dir = TempDir::new().unwrap();
        let log = SegmentedLog::open(&test_config(&temp_dir, 10), "partial").unwrap();
        log.push(b"only").unwrap();

        let mut sink = Vec::new();
        log.consume_into(|p| {
            sink.push(p);
            Ok(())
        })
        .unwrap();
        assert_eq!(sink, vec!["only"]);

        log.push(b"next").unwrap();
        assert_eq!(consume_all(&log), vec!["next"]);
    }

    #[test]
    fn test_failed_sink_keeps_undelivered_items() {
        let temp_dir = TempDir::new().unwrap();
        let log = SegmentedLog::open(&test_config(&temp_dir, 4), "failing").unwrap();
        for item in ["a", "b", "c", "d"] {
            log.push(item.as_bytes()).unwrap();
        }

        let mut accepted = 0;
        let result = log.consume_into(|_| {
            if accepted == 2 {
                return Err(QueueError::Internal {
                    message: "sink full".to_string(),
                });
            }
            accepted += 1;
            Ok(())
        });

        assert!(result.is_err());
        assert_eq!(log.len(), 2);
        assert_eq!(consume_all(&log), vec!["c", "d"]);
    }

    #[test]
    fn test_unremovable_segment_still_counts_as_consumed() {
        let temp_dir = TempDir::new().unwrap();
        let log = SegmentedLog::open(&test_config(&temp_dir, 2), "stuck").unwrap();
        for item in ["a", "b", "c"] {
            log.push(item.as_bytes()).unwrap();
        }
        let oldest = segment_file_path(log.dir(), 0);

        // Swapping the file for a directory makes the unlink fail.
        let mut delivered = Vec::new();
        let moved = log
            .consume_into(|p| {
                if delivered.is_empty() {
                    std::fs::remove_file(&oldest).unwrap();
                    std::fs::create_dir(&oldest).unwrap();
                }
                delivered.push(p);
                Ok(())
            })
            .unwrap();

        assert_eq!(moved, 2);
        assert_eq!(delivered, vec!["a", "b"]);
        assert_eq!(log.len(), 1);
        assert_eq!(consume_all(&log), vec!["c"]);
    }

    #[test]
    fn test_retire_segment_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gone.seg");
        std::fs::write(&path, encode_frame(b"x").unwrap()).unwrap();
        retire_segment("retire", &path);
        assert!(!path.exists());

        // Missing files are already retired.
        retire_segment("retire", &path);
        assert!(!path.exists());
    }

    #[test]
    fn test_reopen_resumes_numbering() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir, 2);

        {
            let log = SegmentedLog::open(&config, "resume").unwrap();
            for item in ["a", "b", "c"] {
                log.push(item.as_bytes()).unwrap();
            }
            log.close().unwrap();
        }

        let log = SegmentedLog::open(&config, "resume").unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log.initial_bytes(), 3);
        log.push(b"d").unwrap();
        log.push(b"e").unwrap();

        let sequences: Vec<u64> = scan_segment_files(log.dir())
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(consume_all(&log), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_reopen_truncates_torn_active_tail() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir, 10);

        let active = {
            let log = SegmentedLog::open(&config, "torn").unwrap();
            log.push(b"kept").unwrap();
            log.close().unwrap();
            segment_file_path(log.dir(), 0)
        };
        {
            let mut file = OpenOptions::new().append(true).open(&active).unwrap();
            file.write_all(&encode_frame(b"half written").unwrap()[..6]).unwrap();
        }

        let log = SegmentedLog::open(&config, "torn").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(std::fs::metadata(&active).unwrap().len(), 8);

        log.push(b"after").unwrap();
        assert_eq!(consume_all(&log), vec!["kept", "after"]);
    }

    #[test]
    fn test_purge_removes_directory() {
        let temp_dir = TempDir::new().unwrap();
        let log = SegmentedLog::open(&test_config(&temp_dir, 2), "purged").unwrap();
        log.push(b"x").unwrap();

        log.purge().unwrap();
        assert!(!log.dir().exists());
        assert_eq!(log.len(), 0);
        assert!(log.push(b"y").is_err());
    }
}

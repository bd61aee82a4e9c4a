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

use std::path::{Path, PathBuf};

use snafu::{ResultExt, ensure};

use crate::{
    Result,
    error::{InvalidQueueNameSnafu, IoSnafu},
};

/// Longest queue name accepted, matching the memcache key limit.
pub const MAX_QUEUE_NAME_LEN: usize = 250;

/// Directory under the registry root holding per-queue segment directories.
pub const SEGMENT_DIR_NAME: &str = "segmented";

/// Directory under the registry root where journals wait while rotated.
/// Queue names cannot take this name, so a backup never lands on a journal.
pub const ROTATION_DIR_NAME: &str = ".rotate";

const SEGMENT_EXTENSION: &str = "seg";

/// Checks that `name` can be used both as a protocol key and a file name.
pub fn validate_queue_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && name != "."
        && name != ".."
        && name != SEGMENT_DIR_NAME
        && name != ROTATION_DIR_NAME
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '/' || c == '\\');
    ensure!(valid, InvalidQueueNameSnafu { name });
    Ok(())
}

/// Journal of a transactional queue: `base/<name>`.
pub fn journal_path<P: AsRef<Path>>(base: P, name: &str) -> PathBuf { base.as_ref().join(name) }

/// Directory holding journals being rotated: `base/.rotate`.
pub fn rotation_dir<P: AsRef<Path>>(base: P) -> PathBuf { base.as_ref().join(ROTATION_DIR_NAME) }

/// Temporary name a journal is moved to while being rotated:
/// `base/.rotate/<name>.<unix seconds>`.
pub fn journal_backup_path<P: AsRef<Path>>(base: P, name: &str, unix_secs: i64) -> PathBuf {
    rotation_dir(base).join(format!("{name}.{unix_secs}"))
}

/// Segment directory of a queue: `base/segmented/<name>`.
pub fn segment_dir<P: AsRef<Path>>(base: P, name: &str) -> PathBuf {
    base.as_ref().join(SEGMENT_DIR_NAME).join(name)
}

/// Generates a segment file name: `NNNNNNNNNNNNNNNNNNNN.seg`.
///
/// Zero padding keeps lexicographic order equal to creation order.
pub fn segment_file_name(sequence: u64) -> String { format!("{sequence:020}.{SEGMENT_EXTENSION}") }

pub fn segment_file_path<P: AsRef<Path>>(dir: P, sequence: u64) -> PathBuf {
    dir.as_ref().join(segment_file_name(sequence))
}

/// Extracts the sequence number from a segment file path.
pub fn parse_segment_sequence(path: &Path) -> Option<u64> {
    if path.extension().and_then(|s| s.to_str()) != Some(SEGMENT_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse().ok())
}

/// Lists `(sequence, path)` of all segment files in `dir`, oldest first.
pub fn scan_segment_files<P: AsRef<Path>>(dir: P) -> Result<Vec<(u64, PathBuf)>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).context(IoSnafu { path: dir })? {
        let path = entry.context(IoSnafu { path: dir })?.path();
        if let Some(sequence) = parse_segment_sequence(&path) {
            files.push((sequence, path));
        }
    }
    files.sort_unstable_by_key(|(sequence, _)| *sequence);
    Ok(files)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_journal_paths() {
        assert_eq!(journal_path("/q", "jobs"), PathBuf::from("/q/jobs"));
        assert_eq!(
            journal_backup_path("/q", "jobs", 1_700_000_000),
            PathBuf::from("/q/.rotate/jobs.1700000000")
        );
    }

    #[test]
    fn test_segment_paths() {
        let dir = segment_dir("/q", "jobs");
        assert_eq!(dir, PathBuf::from("/q/segmented/jobs"));
        assert_eq!(
            segment_file_path(&dir, 42),
            PathBuf::from("/q/segmented/jobs/00000000000000000042.seg")
        );
    }

    #[test]
    fn test_segment_names_sort_by_sequence() {
        let mut names = vec![segment_file_name(10), segment_file_name(9), segment_file_name(100)];
        names.sort();
        assert_eq!(
            names,
            vec![segment_file_name(9), segment_file_name(10), segment_file_name(100)]
        );
    }

    #[test_case("/q/00000000000000000007.seg", Some(7) ; "segment file")]
    #[test_case("/q/00000000000000000007.data", None ; "wrong extension")]
    #[test_case("/q/abc.seg", None ; "non numeric")]
    fn test_parse_segment_sequence(path: &str, expected: Option<u64>) {
        assert_eq!(parse_segment_sequence(Path::new(path)), expected);
    }

    #[test]
    fn test_scan_segment_files() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let dir = temp_dir.path();

        for sequence in [3, 1, 2] {
            std::fs::File::create(segment_file_path(dir, sequence)).unwrap();
        }
        std::fs::File::create(dir.join("stray.tmp")).unwrap();

        let files = scan_segment_files(dir).unwrap();
        let sequences: Vec<u64> = files.iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let files = scan_segment_files(temp_dir.path().join("missing")).unwrap();
        assert!(files.is_empty());
    }

    #[test_case("jobs", true ; "plain")]
    #[test_case("jobs.high-priority_1", true ; "punctuation")]
    #[test_case("", false ; "empty")]
    #[test_case("has space", false ; "whitespace")]
    #[test_case("a/b", false ; "separator")]
    #[test_case("..", false ; "parent dir")]
    #[test_case("segmented", false ; "reserved")]
    #[test_case(".rotate", false ; "rotation dir")]
    fn test_validate_queue_name(name: &str, ok: bool) {
        assert_eq!(validate_queue_name(name).is_ok(), ok);
    }

    #[test]
    fn test_validate_queue_name_length() {
        assert!(validate_queue_name(&"x".repeat(MAX_QUEUE_NAME_LEN)).is_ok());
        assert!(validate_queue_name(&"x".repeat(MAX_QUEUE_NAME_LEN + 1)).is_err());
    }
}

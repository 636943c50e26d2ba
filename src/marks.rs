//! Fast-import mark numbering.
//!
//! Marks form one flat namespace per target repository. Commit marks count
//! upwards from [`INITIAL_MARK`] and stay globally unique; blob marks count
//! downwards from [`MAX_MARK`]` - 1` and are recycled once no transaction is
//! outstanding. Splitting the range lets blob and commit streams interleave
//! without coordination.

use std::io::BufRead;
use std::path::Path;

pub type Mark = u64;

/// First commit mark is `INITIAL_MARK + 1`.
pub const INITIAL_MARK: Mark = 42_000_000;

/// Reserved for the rolling refs/notes/commits mark; blob marks start just
/// below it.
pub const MAX_MARK: Mark = u64::MAX;

#[derive(Debug)]
pub struct MarkAllocator {
    last_commit_mark: Mark,
    next_blob_mark: Mark,
}

impl Default for MarkAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkAllocator {
    pub fn new() -> Self {
        MarkAllocator {
            last_commit_mark: INITIAL_MARK,
            next_blob_mark: MAX_MARK - 1,
        }
    }

    pub fn next_commit_mark(&mut self) -> Mark {
        self.last_commit_mark += 1;
        // In case the two mark ranges meet, we might as well just abort.
        assert!(
            self.last_commit_mark < self.next_blob_mark - 1,
            "commit mark {} ran into blob mark {}",
            self.last_commit_mark,
            self.next_blob_mark,
        );
        self.last_commit_mark
    }

    pub fn next_blob_mark(&mut self) -> Mark {
        let mark = self.next_blob_mark;
        self.next_blob_mark -= 1;
        assert!(
            mark > self.last_commit_mark + 1,
            "blob mark {} ran into commit mark {}",
            mark,
            self.last_commit_mark,
        );
        mark
    }

    /// Blob marks are recycled between revisions, once every transaction of
    /// the previous revision has been dropped.
    pub fn reset_blob_marks(&mut self) {
        self.next_blob_mark = MAX_MARK - 1;
    }

    pub fn last_commit_mark(&self) -> Mark {
        self.last_commit_mark
    }

    /// Advances the commit counter past marks recovered from a previous run.
    pub fn bump_commit_mark(&mut self, mark: Mark) {
        if self.last_commit_mark < mark {
            self.last_commit_mark = mark;
        }
    }
}

/// Scans a marks file written by git-fast-import and returns the last mark of
/// the contiguous ascending prefix, the trustworthy boundary for resuming.
/// Lines look like `:MARK SHA1`. Returns 0 when the file is missing or the
/// content is not a strictly ascending mark sequence.
pub fn last_valid_mark(marks_path: &Path) -> Mark {
    let Ok(file) = std::fs::File::open(marks_path) else {
        return 0;
    };
    log::debug!("scanning marks file {}", marks_path.display());

    let mut prev_mark = INITIAL_MARK;
    for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
        let Ok(line) = line else {
            return 0;
        };
        if line.is_empty() {
            continue;
        }

        let mark: Mark = line
            .strip_prefix(':')
            .and_then(|rest| rest.split(' ').next())
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);

        if mark == 0 {
            log::error!(
                "{} line {}: marks file corrupt?",
                marks_path.display(),
                lineno + 1
            );
            return 0;
        }
        if mark == prev_mark {
            log::error!(
                "{} line {}: marks file has duplicates",
                marks_path.display(),
                lineno + 1
            );
            return 0;
        }
        if mark < prev_mark {
            log::error!(
                "{} line {}: marks file not sorted",
                marks_path.display(),
                lineno + 1
            );
            return 0;
        }
        if mark > prev_mark + 1 {
            break;
        }
        prev_mark = mark;
    }
    prev_mark
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_commit_marks_ascend_from_initial() {
        let mut alloc = MarkAllocator::new();
        assert_eq!(alloc.next_commit_mark(), INITIAL_MARK + 1);
        assert_eq!(alloc.next_commit_mark(), INITIAL_MARK + 2);
        assert_eq!(alloc.last_commit_mark(), INITIAL_MARK + 2);
    }

    #[test]
    fn test_blob_marks_descend_and_reset() {
        let mut alloc = MarkAllocator::new();
        assert_eq!(alloc.next_blob_mark(), MAX_MARK - 1);
        assert_eq!(alloc.next_blob_mark(), MAX_MARK - 2);
        alloc.reset_blob_marks();
        assert_eq!(alloc.next_blob_mark(), MAX_MARK - 1);
    }

    #[test]
    fn test_bump_commit_mark_is_monotonic() {
        let mut alloc = MarkAllocator::new();
        alloc.bump_commit_mark(INITIAL_MARK + 10);
        alloc.bump_commit_mark(INITIAL_MARK + 5);
        assert_eq!(alloc.next_commit_mark(), INITIAL_MARK + 11);
    }

    fn write_marks(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_last_valid_mark_contiguous() {
        let file = write_marks(&[
            ":42000001 aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            ":42000002 bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            ":42000003 cccccccccccccccccccccccccccccccccccccccc",
        ]);
        assert_eq!(last_valid_mark(file.path()), INITIAL_MARK + 3);
    }

    #[test]
    fn test_last_valid_mark_stops_at_gap() {
        let file = write_marks(&[
            ":42000001 aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            ":42000005 bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
        ]);
        assert_eq!(last_valid_mark(file.path()), INITIAL_MARK + 1);
    }

    #[test]
    fn test_last_valid_mark_rejects_duplicates_and_disorder() {
        let dup = write_marks(&[":42000001 aaaa", ":42000001 bbbb"]);
        assert_eq!(last_valid_mark(dup.path()), 0);
        let unsorted = write_marks(&[":42000002 aaaa", ":42000001 bbbb"]);
        assert_eq!(last_valid_mark(unsorted.path()), 0);
        let garbage = write_marks(&["junk"]);
        assert_eq!(last_valid_mark(garbage.path()), 0);
    }

    #[test]
    fn test_last_valid_mark_missing_file() {
        assert_eq!(last_valid_mark(Path::new("/nonexistent/marks")), 0);
    }
}

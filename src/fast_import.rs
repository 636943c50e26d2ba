//! One git-fast-import child per target repository, plus the LRU cache that
//! bounds how many children run at once.

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::Write as _;
use std::path::Path;
use std::process::Child;
use std::process::ChildStdin;
use std::process::Stdio;
use std::rc::Rc;
use std::rc::Weak;
use std::time::Duration;
use wait_timeout::ChildExt as _;

use crate::repository::FastImportRepository;
use crate::util::git_command;

/// Upper bound on simultaneously running fast-import children. A fleet
/// conversion may declare thousands of targets; file descriptors and child
/// memory make an unbounded set of children impossible.
pub const MAX_SIMULTANEOUS_PROCESSES: usize = 100;

enum Sink {
    /// A real `git fast-import` child; everything written is also appended to
    /// the log file, except blob bodies.
    Child {
        child: Child,
        stdin: ChildStdin,
        log: std::fs::File,
    },
    /// `--create-dump`: the stream goes to a `<repository>.fi` file.
    Dump(std::fs::File),
    /// `--dry-run`: all writes are discarded.
    Null,
}

/// State machine: not started -> running -> closed (restartable). A child
/// that exited without `close()` is a crash and fatal on the next write.
pub struct FastImportProcess {
    repo_name: String,
    sink: Option<Sink>,
    has_started_once: bool,
}

impl FastImportProcess {
    pub fn new(repo_name: &str) -> Self {
        FastImportProcess {
            repo_name: repo_name.to_owned(),
            sink: None,
            has_started_once: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.sink.is_some()
    }

    /// Spawns `git fast-import` inside `repo_dir`, with its merged
    /// stdout/stderr appended to `log_path`.
    pub fn start_child(
        &mut self,
        repo_dir: &Path,
        marks_file_name: &str,
        log_path: &Path,
    ) -> Result<()> {
        self.check_not_crashed()?;
        if self.sink.is_some() {
            return Ok(());
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("Could not open log file {}", log_path.display()))?;
        let mut child = git_command(repo_dir)
            .arg("fast-import")
            .arg(format!("--import-marks={marks_file_name}"))
            .arg(format!("--export-marks={marks_file_name}"))
            .arg("--force")
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log.try_clone()?))
            .spawn()
            .with_context(|| format!("Could not start git-fast-import for {}", self.repo_name))?;
        let stdin = child.stdin.take().context("Could not connect stdin")?;
        self.sink = Some(Sink::Child { child, stdin, log });
        self.has_started_once = true;
        Ok(())
    }

    /// Opens the `<repository>.fi` dump file instead of spawning a child.
    pub fn start_dump(&mut self, dump_path: &Path) -> Result<()> {
        if self.sink.is_some() {
            return Ok(());
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dump_path)
            .with_context(|| format!("Could not open dump file {}", dump_path.display()))?;
        self.sink = Some(Sink::Dump(file));
        self.has_started_once = true;
        Ok(())
    }

    pub fn start_null(&mut self) {
        if self.sink.is_none() {
            self.sink = Some(Sink::Null);
            self.has_started_once = true;
        }
    }

    /// A child that exited underneath us is a crash; a restart after a
    /// graceful close (cache eviction) is normal.
    fn check_not_crashed(&mut self) -> Result<()> {
        if let Some(Sink::Child { child, .. }) = &mut self.sink
            && let Some(status) = child.try_wait().unwrap_or(None)
        {
            bail!(
                "git-fast-import for {} has been started once and crashed? ({status})",
                self.repo_name
            );
        }
        Ok(())
    }

    /// Writes stream bytes, with a copy appended to the log file.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.sink.as_mut() {
            Some(Sink::Child { stdin, log, .. }) => {
                stdin
                    .write_all(data)
                    .with_context(|| format!("Failed to write to process for {}", self.repo_name))?;
                log.write_all(data)
                    .with_context(|| format!("Failed to write log for {}", self.repo_name))?;
            }
            Some(Sink::Dump(file)) => file
                .write_all(data)
                .with_context(|| format!("Failed to write dump for {}", self.repo_name))?,
            Some(Sink::Null) => {}
            None => bail!("fast-import for {} is not running", self.repo_name),
        }
        Ok(())
    }

    /// Writes stream bytes without the log copy; used for blob bodies, which
    /// would bloat the log without aiding resume.
    pub fn write_no_log(&mut self, data: &[u8]) -> Result<()> {
        match self.sink.as_mut() {
            Some(Sink::Child { stdin, .. }) => stdin
                .write_all(data)
                .with_context(|| format!("Failed to write to process for {}", self.repo_name)),
            Some(Sink::Dump(file)) => file
                .write_all(data)
                .with_context(|| format!("Failed to write dump for {}", self.repo_name)),
            Some(Sink::Null) => Ok(()),
            None => bail!("fast-import for {} is not running", self.repo_name),
        }
    }

    /// Sends a final checkpoint, closes the write end and waits up to
    /// `timeout_secs` (0 waits forever). A child surviving termination only
    /// warns.
    pub fn close(&mut self, timeout_secs: u64) -> Result<()> {
        match self.sink.take() {
            Some(Sink::Child {
                mut child,
                mut stdin,
                log,
            }) => {
                let _ = stdin.write_all(b"checkpoint\n");
                let _ = stdin.flush();
                drop(stdin);
                drop(log);
                let finished = if timeout_secs == 0 {
                    log::debug!("Waiting forever for fast-import to finish.");
                    child.wait().map(Some)
                } else {
                    log::debug!("Waiting {timeout_secs} seconds for fast-import to finish.");
                    child.wait_timeout(Duration::from_secs(timeout_secs))
                }
                .with_context(|| format!("Waiting for git-fast-import of {}", self.repo_name))?;
                if finished.is_none() {
                    child.kill().ok();
                    if child
                        .wait_timeout(Duration::from_millis(200))
                        .unwrap_or(None)
                        .is_none()
                    {
                        log::warn!(
                            "git-fast-import for repository {} did not die",
                            self.repo_name
                        );
                    }
                }
            }
            Some(Sink::Dump(mut file)) => {
                let _ = file.flush();
            }
            Some(Sink::Null) | None => {}
        }
        self.has_started_once = false;
        Ok(())
    }
}

/// Bounds the number of live fast-import children with least-recently-used
/// eviction; an evicted child is closed gracefully (checkpoint + wait).
pub struct ProcessCache {
    limit: usize,
    order: VecDeque<String>,
    repos: HashMap<String, Weak<RefCell<FastImportRepository>>>,
}

pub type ProcessCacheHandle = Rc<RefCell<ProcessCache>>;

impl ProcessCache {
    pub fn new(limit: usize) -> ProcessCacheHandle {
        Rc::new(RefCell::new(ProcessCache {
            limit,
            order: VecDeque::new(),
            repos: HashMap::new(),
        }))
    }

    pub fn register(&mut self, name: &str, repo: Weak<RefCell<FastImportRepository>>) {
        self.repos.insert(name.to_owned(), repo);
    }

    /// Marks `name` most-recently-used and returns the repositories that must
    /// be closed to keep the cache within its limit. The caller performs the
    /// closes; doing it here would re-enter the cache.
    pub fn touch(&mut self, name: &str) -> Vec<Weak<RefCell<FastImportRepository>>> {
        self.order.retain(|entry| entry != name);
        let mut evicted = Vec::new();
        while self.order.len() >= self.limit {
            let front = self.order.pop_front().expect("non-empty while over limit");
            if let Some(repo) = self.repos.get(&front) {
                evicted.push(repo.clone());
            }
        }
        self.order.push_back(name.to_owned());
        evicted
    }

    pub fn remove(&mut self, name: &str) {
        self.order.retain(|entry| entry != name);
    }
}

/// In dump mode the log file *is* the fast-import stream file.
pub fn log_file_name(repo_name: &str, create_dump: bool) -> String {
    let safe = crate::util::safe_file_name(repo_name);
    if create_dump {
        format!("{safe}.fi")
    } else {
        format!("log-{safe}")
    }
}

pub fn marks_file_name(repo_name: &str) -> String {
    format!("marks-{}", crate::util::safe_file_name(repo_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(marks_file_name("a/b.git"), "marks-a_b.git");
        assert_eq!(log_file_name("a/b.git", false), "log-a_b.git");
        assert_eq!(log_file_name("a/b.git", true), "a_b.git.fi");
    }

    #[test]
    fn test_dump_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("one.fi");
        let mut process = FastImportProcess::new("one");
        process.start_dump(&dump).unwrap();
        process.write(b"progress hello\n").unwrap();
        process.write_no_log(b"blobdata\n").unwrap();
        process.close(0).unwrap();
        let content = std::fs::read_to_string(&dump).unwrap();
        assert_eq!(content, "progress hello\nblobdata\n");
    }

    #[test]
    fn test_null_sink_discards() {
        let mut process = FastImportProcess::new("one");
        process.start_null();
        process.write(b"anything").unwrap();
        process.close(0).unwrap();
    }

    #[test]
    fn test_write_requires_start() {
        let mut process = FastImportProcess::new("one");
        assert!(process.write(b"x").is_err());
    }
}

//! Target repository state: per-branch history, pending branch resets,
//! annotated tags, branch notes, and the incremental-resume machinery.

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use bstr::BString;
use bstr::ByteSlice as _;
use lazy_static::lazy_static;
use regex::Regex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::rc::Rc;

use crate::cli::Options;
use crate::fast_import::FastImportProcess;
use crate::fast_import::ProcessCacheHandle;
use crate::fast_import::log_file_name;
use crate::fast_import::marks_file_name;
use crate::marks::MAX_MARK;
use crate::marks::Mark;
use crate::marks::MarkAllocator;
use crate::marks::last_valid_mark;
use crate::rules::RepoDecl;
use crate::transaction::Transaction;
use crate::util::CommandExtension as _;
use crate::util::ensure_trailing_newline;
use crate::util::git_command;
use crate::util::safe_file_name;

pub type RepoHandle = Rc<RefCell<FastImportRepository>>;

/// Per-branch history. `commits` and `marks` stay index-aligned; a mark of 0
/// records a branch reset or copy that produced no own content.
#[derive(Debug, Default, Clone)]
pub struct Branch {
    /// Revision that created the branch; 0 means not created yet, 1 is used
    /// for branches pre-declared in the rule file.
    pub created: i64,
    pub commits: Vec<i64>,
    pub marks: Vec<Mark>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AnnotatedTag {
    pub supporting_ref: String,
    pub svn_prefix: BString,
    pub author: BString,
    pub log: BString,
    pub datetime: u64,
    pub revnum: i64,
}

/// Result of resolving a `(branch, revnum)` pair to a commit mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkFrom {
    /// The source branch does not exist.
    UnknownBranch,
    /// The branch exists but has no commit at or before the revision.
    NotYet,
    Found { mark: Mark, closest_rev: i64 },
}

/// A target repository as seen by the rule dispatcher: either a directly
/// backing fast-import stream or a transparent forwarding view that routes
/// into another target, optionally under a path prefix. Forwarding chains are
/// flattened at rule-graph construction time.
#[derive(Clone)]
pub enum Repository {
    Direct(RepoHandle),
    Forwarding {
        name: String,
        target: RepoHandle,
        prefix: String,
    },
}

impl Repository {
    pub fn name(&self) -> String {
        match self {
            Repository::Direct(handle) => handle.borrow().name.clone(),
            Repository::Forwarding { name, .. } => name.clone(),
        }
    }

    pub fn effective_name(&self) -> String {
        self.handle().borrow().name.clone()
    }

    /// The backing repository, following forwarding transitively.
    pub fn handle(&self) -> &RepoHandle {
        match self {
            Repository::Direct(handle) => handle,
            Repository::Forwarding { target, .. } => target,
        }
    }

    fn path_prefix(&self) -> &str {
        match self {
            Repository::Direct(_) => "",
            Repository::Forwarding { prefix, .. } => prefix,
        }
    }

    pub fn has_prefix(&self) -> bool {
        !self.path_prefix().is_empty()
    }

    /// Opens a transaction for one `(branch, revnum)`. The branch is allowed
    /// to be unknown; it will be created by the first commit. Every N-th call
    /// writes a fast-import checkpoint so the marks file reaches disk.
    pub fn new_transaction(
        &self,
        branch: &str,
        svn_prefix: &str,
        revnum: i64,
    ) -> Result<Transaction> {
        self.handle().borrow_mut().begin_transaction(branch)?;
        Ok(Transaction::new(
            self.handle().clone(),
            self.path_prefix(),
            branch,
            svn_prefix,
            revnum,
        ))
    }

    pub fn create_branch(
        &self,
        branch: &str,
        revnum: i64,
        branch_from: &str,
        branch_rev: i64,
    ) -> Result<()> {
        self.handle()
            .borrow_mut()
            .create_branch(branch, revnum, branch_from, branch_rev)
    }

    pub fn create_branch_from_tree(
        &self,
        branch: &str,
        revnum: i64,
        tree_hash: &str,
        txn: &mut Transaction,
    ) -> Result<()> {
        self.handle()
            .borrow_mut()
            .create_branch_from_tree(branch, revnum, tree_hash, txn)
    }

    pub fn create_branch_from_tree_with_parent(
        &self,
        branch: &str,
        revnum: i64,
        branch_from: &str,
        branch_rev: i64,
        tree_hash: &str,
        txn: &mut Transaction,
    ) -> Result<()> {
        self.handle().borrow_mut().create_branch_from_tree_with_parent(
            branch,
            revnum,
            branch_from,
            branch_rev,
            tree_hash,
            txn,
        )
    }

    pub fn delete_branch(&self, branch: &str, revnum: i64) -> Result<()> {
        self.handle().borrow_mut().delete_branch(branch, revnum)
    }

    pub fn create_annotated_tag(
        &self,
        ref_name: &str,
        svn_prefix: &str,
        revnum: i64,
        author: &BString,
        datetime: u64,
        log_msg: &BString,
    ) {
        self.handle()
            .borrow_mut()
            .create_annotated_tag(ref_name, svn_prefix, revnum, author, datetime, log_msg);
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.handle().borrow().branches.contains_key(branch)
    }

    /// Flushes pending branch deletions and resets to the stream.
    pub fn commit(&self) -> Result<()> {
        self.handle().borrow_mut().commit_pending()
    }

    pub fn setup_incremental(&self, cutoff: &mut i64) -> Result<i64> {
        match self {
            Repository::Direct(handle) => handle.borrow_mut().setup_incremental(cutoff),
            // The shutdown/resume loops also visit the forwarding target
            // under its own name.
            Repository::Forwarding { .. } => Ok(1),
        }
    }

    pub fn restore_state(&self) -> Result<()> {
        if let Repository::Direct(handle) = self {
            let mut repo = handle.borrow_mut();
            repo.restore_annotated_tags()?;
            repo.restore_branch_notes()?;
        }
        Ok(())
    }

    pub fn restore_log(&self) -> Result<()> {
        if let Repository::Direct(handle) = self {
            handle.borrow().restore_log()?;
        }
        Ok(())
    }

    pub fn finalize_tags(&self) -> Result<()> {
        match self {
            Repository::Direct(handle) => finalize_tags(handle),
            Repository::Forwarding { .. } => Ok(()),
        }
    }

    pub fn save_branch_notes(&self) -> Result<()> {
        match self {
            Repository::Direct(handle) => handle.borrow().save_branch_notes(),
            Repository::Forwarding { .. } => Ok(()),
        }
    }

    pub fn close(&self) -> Result<()> {
        if let Repository::Direct(handle) = self {
            handle.borrow_mut().close_fast_import()?;
        }
        Ok(())
    }
}

pub struct FastImportRepository {
    pub(crate) name: String,
    pub(crate) options: Rc<Options>,
    cache: ProcessCacheHandle,
    pub(crate) branches: BTreeMap<String, Branch>,
    pub(crate) branch_notes: BTreeMap<String, BString>,
    annotated_tags: BTreeMap<String, AnnotatedTag>,
    pub(crate) delayed_notes: Vec<(u64, BString)>,
    deleted_branches: BString,
    pub(crate) reset_branches: BString,
    deleted_branch_names: HashSet<String>,
    pub(crate) reset_branch_names: HashSet<String>,
    pub(crate) fast_import: FastImportProcess,
    pub(crate) marks: MarkAllocator,
    commit_count: usize,
    outstanding_transactions: usize,
    /// Deduplicates once-per-content warnings (tag re-creation, branch-copy
    /// log lines).
    pub(crate) warned_already: HashSet<String>,
}

/// Turns a branch name into a full ref, leaving explicit refs untouched.
pub fn full_ref(branch: &str) -> String {
    if branch.starts_with("refs/") {
        branch.to_owned()
    } else {
        format!("refs/heads/{branch}")
    }
}

/// `svn path=...; revision=N[; tag=T]` trailer for messages and notes.
pub fn format_metadata_message(svn_prefix: &str, revnum: i64, tag: Option<&str>) -> BString {
    let mut msg = format!("svn path={svn_prefix}; revision={revnum}");
    if let Some(tag) = tag {
        msg.push_str(&format!("; tag={tag}"));
    }
    msg.push('\n');
    BString::from(msg)
}

/// Strips commit-template remnants: everything from the first template line
/// onwards is dropped. The returned message keeps one LF per kept line.
pub fn msg_filter(msg: &[u8]) -> BString {
    let mut lines: Vec<&[u8]> = msg.split(|&b| b == b'\n').collect();
    while lines.len() > 1 && lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    let mut output = BString::from("");
    for line in lines {
        if line.ends_with(b"those below, will be ignored--")
            || line.starts_with(b"> Description of fields to fill in above")
            || line.starts_with(b"> PR:            If a GNATS PR is affected by the change")
            || line.starts_with(b"> Submitted by:  If someone else sent in the change")
            || line.starts_with(b"_M   ")
        {
            return output;
        }
        output.extend_from_slice(line);
        output.push(b'\n');
    }
    output
}

lazy_static! {
    static ref PROGRESS_RE: Regex =
        Regex::new(r"^progress SVN r(\d+) branch (.*) = :(\d+)$").unwrap();
}

/// The pre-truncation copy of a log file lives next to it as `<logpath>.old`.
fn log_backup_path(log_path: &std::path::Path) -> PathBuf {
    let mut os = log_path.as_os_str().to_owned();
    os.push(".old");
    PathBuf::from(os)
}

impl FastImportRepository {
    /// Creates the in-memory state and, unless running dry or into a dump
    /// file, the on-disk bare repository with its empty marks file.
    pub fn create(
        decl: &RepoDecl,
        options: Rc<Options>,
        cache: ProcessCacheHandle,
    ) -> Result<RepoHandle> {
        let mut branches = BTreeMap::new();
        for branch in &decl.branches {
            branches.insert(branch.clone(), Branch { created: 1, ..Default::default() });
        }
        // The default branch always exists.
        branches
            .entry("master".to_owned())
            .or_insert(Branch { created: 1, ..Default::default() });

        let repo = FastImportRepository {
            name: decl.name.clone(),
            options: options.clone(),
            cache: cache.clone(),
            branches,
            branch_notes: BTreeMap::new(),
            annotated_tags: BTreeMap::new(),
            delayed_notes: Vec::new(),
            deleted_branches: BString::from(""),
            reset_branches: BString::from(""),
            deleted_branch_names: HashSet::new(),
            reset_branch_names: HashSet::new(),
            fast_import: FastImportProcess::new(&decl.name),
            marks: MarkAllocator::new(),
            commit_count: 0,
            outstanding_transactions: 0,
            warned_already: HashSet::new(),
        };

        if !options.no_repo_setup() {
            let repo_dir = repo.repo_dir();
            if !repo_dir.exists() {
                log::debug!("Creating new repository {}", decl.name);
                std::fs::create_dir_all(&repo_dir)
                    .with_context(|| format!("Could not create {}", repo_dir.display()))?;
                gix::init_bare(&repo_dir)
                    .with_context(|| format!("git init of {} failed", decl.name))?;
                git_command(&repo_dir)
                    .args(["config", "core.ignorecase", "false"])
                    .checked_output()?;
                if !decl.description.is_empty() {
                    std::fs::write(
                        repo_dir.join("description"),
                        format!("{}\n", decl.description),
                    )?;
                }
                std::fs::write(repo.marks_path(), "")?;
            }
        }

        let handle = Rc::new(RefCell::new(repo));
        cache.borrow_mut().register(&decl.name, Rc::downgrade(&handle));
        Ok(handle)
    }

    fn repo_dir(&self) -> PathBuf {
        self.options.target_dir.join(&self.name)
    }

    fn marks_path(&self) -> PathBuf {
        self.repo_dir().join(marks_file_name(&self.name))
    }

    fn log_path(&self) -> PathBuf {
        self.options
            .target_dir
            .join(log_file_name(&self.name, self.options.create_dump))
    }

    fn annotated_tags_path(&self) -> PathBuf {
        self.repo_dir()
            .join(format!("annotatedTags-{}", safe_file_name(&self.name)))
    }

    fn branch_notes_path(&self) -> PathBuf {
        self.repo_dir()
            .join(format!("branchNotes-{}", safe_file_name(&self.name)))
    }

    /// Replays the log file to rebuild branch state and find where to resume.
    /// The log is truncated (after a backup to `.old`) at the first entry at
    /// or past the cutoff, or at the first mark beyond the trustworthy
    /// boundary of the marks file; in the latter case the cutoff is lowered
    /// to that revision. Returns the next revision to convert.
    pub fn setup_incremental(&mut self, cutoff: &mut i64) -> Result<i64> {
        let log_path = self.log_path();
        if !log_path.exists() {
            return Ok(1);
        }

        let content = std::fs::read(&log_path)
            .with_context(|| format!("Could not read {}", log_path.display()))?;
        let last_valid = last_valid_mark(&self.marks_path());
        let backup_path = log_backup_path(&log_path);

        let mut last_revnum: i64 = 0;
        let mut truncate_at: Option<usize> = None;
        let mut pos = 0usize;
        for raw_line in content.split_inclusive(|&b| b == b'\n') {
            let line_start = pos;
            pos += raw_line.len();
            let mut line = raw_line;
            if let Some(hash) = line.find_byte(b'#') {
                line = &line[..hash];
            }
            let line = line.trim();
            let Ok(line) = std::str::from_utf8(line) else {
                continue;
            };
            let Some(caps) = PROGRESS_RE.captures(line) else {
                continue;
            };
            let (Ok(revnum), Ok(mark)) = (caps[1].parse::<i64>(), caps[3].parse::<Mark>()) else {
                continue;
            };
            let branch = &caps[2];

            if revnum >= *cutoff {
                truncate_at = Some(line_start);
                break;
            }
            if revnum < last_revnum {
                log::warn!(
                    "{}: revision numbers are not monotonic: got {last_revnum} and then {revnum}",
                    self.name
                );
            }
            if mark > last_valid {
                log::warn!(
                    "{}: unknown commit mark found: rewinding -- did you hit Ctrl-C?",
                    self.name
                );
                *cutoff = revnum;
                truncate_at = Some(line_start);
                break;
            }

            last_revnum = revnum;
            self.marks.bump_commit_mark(mark);

            let br = self.branches.entry(branch.to_owned()).or_default();
            if br.created == 0 || mark == 0 || br.marks.last().copied().unwrap_or(0) == 0 {
                br.created = revnum;
            }
            br.commits.push(revnum);
            br.marks.push(mark);
        }

        match truncate_at {
            None => {
                let next = last_revnum + 1;
                if next == *cutoff {
                    // Remove a stale backup so restore_log() cannot confuse a
                    // previous run's log with this one.
                    let _ = std::fs::remove_file(&backup_path);
                }
                Ok(next)
            }
            Some(boundary) => {
                let _ = std::fs::remove_file(&backup_path);
                std::fs::copy(&log_path, &backup_path)
                    .with_context(|| format!("Could not back up {}", log_path.display()))?;
                log::debug!("{}: truncating history to revision {}", self.name, *cutoff);
                let file = std::fs::OpenOptions::new().write(true).open(&log_path)?;
                file.set_len(boundary as u64)?;
                Ok(*cutoff)
            }
        }
    }

    /// Puts the pre-truncation log back, leaving the on-disk state intact for
    /// another attempt after a fatal error.
    pub fn restore_log(&self) -> Result<()> {
        let log_path = self.log_path();
        let backup_path = log_backup_path(&log_path);
        if backup_path.exists() {
            let _ = std::fs::remove_file(&log_path);
            std::fs::rename(&backup_path, &log_path)
                .with_context(|| format!("Could not restore {}", log_path.display()))?;
        }
        Ok(())
    }

    pub fn restore_annotated_tags(&mut self) -> Result<()> {
        let path = self.annotated_tags_path();
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read(&path)?;
        let (tags, _) = bincode::serde::decode_from_slice(&data, bincode::config::standard())
            .with_context(|| format!("Corrupt annotated-tags file {}", path.display()))?;
        self.annotated_tags = tags;
        Ok(())
    }

    pub fn restore_branch_notes(&mut self) -> Result<()> {
        let path = self.branch_notes_path();
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read(&path)?;
        let (notes, _) = bincode::serde::decode_from_slice(&data, bincode::config::standard())
            .with_context(|| format!("Corrupt branch-notes file {}", path.display()))?;
        self.branch_notes = notes;
        Ok(())
    }

    fn save_annotated_tags(&self) -> Result<()> {
        if self.options.no_repo_setup() {
            return Ok(());
        }
        let data = bincode::serde::encode_to_vec(&self.annotated_tags, bincode::config::standard())?;
        std::fs::write(self.annotated_tags_path(), data)?;
        Ok(())
    }

    pub fn save_branch_notes(&self) -> Result<()> {
        if self.branch_notes.is_empty() || self.options.no_repo_setup() {
            return Ok(());
        }
        let data = bincode::serde::encode_to_vec(&self.branch_notes, bincode::config::standard())?;
        std::fs::write(self.branch_notes_path(), data)?;
        Ok(())
    }

    /// Ensures the fast-import sink is live, restarting a gracefully closed
    /// child and evicting the least-recently-used repositories over the cache
    /// limit.
    pub(crate) fn start_fast_import(&mut self) -> Result<()> {
        let evicted = self.cache.borrow_mut().touch(&self.name);
        for weak in evicted {
            if let Some(other) = weak.upgrade() {
                other.borrow_mut().close_fast_import()?;
            }
        }
        if self.fast_import.is_running() {
            return Ok(());
        }
        if self.options.dry_run {
            self.fast_import.start_null();
        } else if self.options.create_dump {
            self.fast_import.start_dump(&self.log_path())?;
        } else {
            self.fast_import.start_child(
                &self.repo_dir(),
                &marks_file_name(&self.name),
                &self.log_path(),
            )?;
        }
        self.reload_branches()?;
        Ok(())
    }

    pub(crate) fn close_fast_import(&mut self) -> Result<()> {
        if self.fast_import.is_running() {
            self.fast_import.close(self.options.fast_import_timeout)?;
        }
        self.cache.borrow_mut().remove(&self.name);
        Ok(())
    }

    /// After a (re)start, point every known branch ref at its last mark so
    /// the child agrees with the resumed state.
    fn reload_branches(&mut self) -> Result<()> {
        let mut reset_notes = false;
        let mut commands = BString::from("");
        for (branch, br) in &self.branches {
            let last_mark = br.marks.last().copied().unwrap_or(0);
            if last_mark == 0 {
                continue;
            }
            reset_notes = true;
            let branch_ref = full_ref(branch);
            commands.extend_from_slice(
                format!(
                    "reset {branch_ref}\nfrom :{last_mark}\n\nprogress Branch {branch_ref} reloaded\n"
                )
                .as_bytes(),
            );
        }
        if !commands.is_empty() {
            self.fast_import.write(&commands)?;
        }
        if reset_notes && self.options.add_metadata_notes {
            self.fast_import
                .write(format!("reset refs/notes/commits\nfrom :{MAX_MARK}\n").as_bytes())?;
        }
        Ok(())
    }

    /// Resolves the commit mark of `branch_from` at (or rounded down from)
    /// `branch_rev`.
    pub(crate) fn mark_from(&self, branch_from: &str, branch_rev: i64) -> MarkFrom {
        let Some(br) = self.branches.get(branch_from) else {
            return MarkFrom::UnknownBranch;
        };
        if br.created == 0 || br.commits.is_empty() {
            return MarkFrom::UnknownBranch;
        }
        if br.commits.last() == Some(&branch_rev) {
            return MarkFrom::Found {
                mark: *br.marks.last().unwrap(),
                closest_rev: branch_rev,
            };
        }
        let idx = br.commits.partition_point(|&commit| commit <= branch_rev);
        if idx == 0 {
            return MarkFrom::NotYet;
        }
        MarkFrom::Found {
            mark: br.marks[idx - 1],
            closest_rev: br.commits[idx - 1],
        }
    }

    pub fn create_branch(
        &mut self,
        branch: &str,
        revnum: i64,
        branch_from: &str,
        branch_rev: i64,
    ) -> Result<()> {
        let (mark, reset_to, desc) =
            self.resolve_branch_from(branch, branch_from, branch_rev)?;
        log::debug!(
            "Creating branch: {branch} from {branch_from} ({branch_rev} {desc})"
        );
        // Preserve note.
        let note = self.branch_notes.get(branch_from).cloned().unwrap_or_default();
        self.branch_notes.insert(branch.to_owned(), note);
        self.reset_branch(branch, revnum, mark, reset_to.as_bytes(), &desc)
    }

    fn resolve_branch_from(
        &mut self,
        branch: &str,
        branch_from: &str,
        branch_rev: i64,
    ) -> Result<(Mark, String, String)> {
        let mut desc = format!("from branch {branch_from}");
        match self.mark_from(branch_from, branch_rev) {
            MarkFrom::UnknownBranch => bail!(
                "{branch} in repository {} is branching from branch {branch_from} \
                 but the latter doesn't exist. Can't continue.",
                self.name
            ),
            MarkFrom::NotYet | MarkFrom::Found { mark: 0, .. } => {
                log::warn!(
                    "{branch} in repository {} is branching but no exported commits exist \
                     in repository, creating an empty branch.",
                    self.name
                );
                desc.push_str(", deleted/unknown");
                Ok((0, full_ref(branch_from), desc))
            }
            MarkFrom::Found { mark, closest_rev } => {
                desc.push_str(&format!(" at r{branch_rev}"));
                if closest_rev != branch_rev {
                    desc.push_str(&format!(" => r{closest_rev}"));
                }
                Ok((mark, format!(":{mark}"), desc))
            }
        }
    }

    /// Branch created from a bare tree hash, without a parent. The next
    /// commit on the branch starts from that tree via the transaction's
    /// `resetFromTree` sidecar.
    pub fn create_branch_from_tree(
        &mut self,
        branch: &str,
        revnum: i64,
        tree_hash: &str,
        txn: &mut Transaction,
    ) -> Result<()> {
        log::debug!("Creating branch: {branch} without parent (from tree {tree_hash})");
        let branch_ref = full_ref(branch);
        let br = self.branches.entry(branch.to_owned()).or_default();
        br.created = revnum;
        br.commits.push(revnum);
        br.marks.push(0);
        self.reset_branches.extend_from_slice(
            format!(
                "reset {branch_ref}\n\nprogress SVN r{revnum} branch {branch} = {tree_hash}\n\n"
            )
            .as_bytes(),
        );
        self.reset_branch_names.insert(branch_ref);
        txn.reset_from_tree
            .extend_from_slice(format!("M 040000 {tree_hash} \n").as_bytes());
        Ok(())
    }

    /// Branch created from a tree hash *and* a parent branch.
    pub fn create_branch_from_tree_with_parent(
        &mut self,
        branch: &str,
        revnum: i64,
        branch_from: &str,
        branch_rev: i64,
        tree_hash: &str,
        txn: &mut Transaction,
    ) -> Result<()> {
        let (mark, reset_to, desc) =
            self.resolve_branch_from(branch, branch_from, branch_rev)?;
        log::debug!(
            "Creating branch: {branch} from {branch_from} ({branch_rev} {desc}) (from tree {tree_hash})"
        );
        let note = self.branch_notes.get(branch_from).cloned().unwrap_or_default();
        self.branch_notes.insert(branch.to_owned(), note);

        let branch_ref = full_ref(branch);
        let br = self.branches.entry(branch.to_owned()).or_default();
        br.created = revnum;
        br.commits.push(revnum);
        br.marks.push(mark);
        self.reset_branches.extend_from_slice(
            format!(
                "reset {branch_ref}\nfrom {reset_to}\n\n\
                 progress SVN r{revnum} branch {branch} = {tree_hash}\n\n"
            )
            .as_bytes(),
        );
        self.reset_branch_names.insert(branch_ref);
        txn.reset_from_tree
            .extend_from_slice(format!("M 040000 {tree_hash} \n").as_bytes());
        Ok(())
    }

    pub fn delete_branch(&mut self, branch: &str, revnum: i64) -> Result<()> {
        self.reset_branch(branch, revnum, 0, "0".repeat(40).as_bytes(), "delete")
    }

    /// Queues a `reset` for the branch ref, backing up previously existing
    /// content under refs/backups (or refs/tags/backups for deletions).
    fn reset_branch(
        &mut self,
        branch: &str,
        revnum: i64,
        mark: Mark,
        reset_to: &[u8],
        comment: &str,
    ) -> Result<()> {
        let branch_ref = full_ref(branch);
        let br = self.branches.entry(branch.to_owned()).or_default();

        let mut backup_cmd = BString::from("");
        if br.created != 0
            && br.created != revnum
            && br.marks.last().copied().unwrap_or(0) != 0
        {
            let backup_branch = if comment == "delete" && branch_ref.starts_with("refs/heads/") {
                format!("refs/tags/backups/{}@{revnum}", &branch_ref[11..])
            } else {
                format!("refs/backups/r{revnum}{}", &branch_ref[4..])
            };
            log::warn!("backing up branch {branch} to {backup_branch}");
            backup_cmd =
                BString::from(format!("reset {backup_branch}\nfrom {branch_ref}\n\n"));
        }

        br.created = revnum;
        br.commits.push(revnum);
        br.marks.push(mark);

        let mut cmd = BString::from(format!("reset {branch_ref}\nfrom "));
        cmd.extend_from_slice(reset_to);
        cmd.extend_from_slice(
            format!("\n\nprogress SVN r{revnum} branch {branch} = :{mark} # {comment}\n\n")
                .as_bytes(),
        );

        if comment == "delete" {
            self.deleted_branches.extend_from_slice(&backup_cmd);
            self.deleted_branches.extend_from_slice(&cmd);
            self.deleted_branch_names.insert(branch_ref);
        } else {
            self.reset_branches.extend_from_slice(&backup_cmd);
            self.reset_branches.extend_from_slice(&cmd);
            self.reset_branch_names.insert(branch_ref);
        }
        Ok(())
    }

    /// Flushes pending deletions, then pending resets. An annotated tag whose
    /// supporting ref was deleted and not re-created in the same flush is
    /// dropped.
    pub fn commit_pending(&mut self) -> Result<()> {
        if self.deleted_branches.is_empty() && self.reset_branches.is_empty() {
            return Ok(());
        }
        self.start_fast_import()?;
        let deleted = std::mem::take(&mut self.deleted_branches);
        let reset = std::mem::take(&mut self.reset_branches);
        self.fast_import.write(&deleted)?;
        self.fast_import.write(&reset)?;
        for tag_ref in std::mem::take(&mut self.deleted_branch_names) {
            if self.reset_branch_names.contains(&tag_ref) {
                continue;
            }
            let tag_name = tag_ref.strip_prefix("refs/tags/").unwrap_or(&tag_ref);
            if self.annotated_tags.remove(tag_name).is_some() {
                log::debug!("Removing annotated tag {tag_name} for {}", self.name);
            }
        }
        self.reset_branch_names.clear();
        Ok(())
    }

    pub(crate) fn begin_transaction(&mut self, branch: &str) -> Result<()> {
        if !self.branches.contains_key(branch) {
            log::warn!(
                "Transaction: {branch} is not a known branch in repository {}; \
                 going to create it automatically",
                self.name
            );
        }
        self.commit_count += 1;
        if self.options.commit_interval != 0 && self.commit_count % self.options.commit_interval == 0
        {
            self.start_fast_import()?;
            self.fast_import.write(b"checkpoint\n")?;
            log::debug!("checkpoint! marks file flushed for {}", self.name);
        }
        self.outstanding_transactions += 1;
        Ok(())
    }

    pub(crate) fn forget_transaction(&mut self) {
        self.outstanding_transactions -= 1;
        if self.outstanding_transactions == 0 {
            self.marks.reset_blob_marks();
        }
    }

    pub fn create_annotated_tag(
        &mut self,
        ref_name: &str,
        svn_prefix: &str,
        revnum: i64,
        author: &BString,
        datetime: u64,
        log_msg: &BString,
    ) {
        let tag_name = ref_name.strip_prefix("refs/tags/").unwrap_or(ref_name);
        if !self.annotated_tags.contains_key(tag_name) {
            log::info!(
                "Creating annotated tag {tag_name} ({ref_name}) for {}",
                self.name
            );
        } else if self.warned_already.insert(format!("retag {tag_name}")) {
            log::info!("Re-creating annotated tag {tag_name} for {}", self.name);
        }
        self.annotated_tags.insert(
            tag_name.to_owned(),
            AnnotatedTag {
                supporting_ref: ref_name.to_owned(),
                svn_prefix: BString::from(svn_prefix),
                author: author.clone(),
                log: log_msg.clone(),
                datetime,
                revnum,
            },
        );
    }

    pub(crate) fn branch_note(&self, branch: &str) -> Option<&BString> {
        self.branch_notes.get(branch)
    }

    pub(crate) fn set_branch_note(&mut self, branch: &str, note: BString) {
        if self.branches.contains_key(branch) {
            self.branch_notes.insert(branch.to_owned(), note);
        }
    }

    fn write_tag(&mut self, tag_name: &str, tag: &AnnotatedTag) -> Result<()> {
        let mut message = ensure_trailing_newline(tag.log.clone());
        if self.options.add_metadata {
            message.push(b'\n');
            message.extend_from_slice(&format_metadata_message(
                &tag.svn_prefix.to_str_lossy(),
                tag.revnum,
                Some(tag_name),
            ));
        }
        let branch_ref = full_ref(&tag.supporting_ref);
        let mut block = BString::from(format!(
            "progress Creating annotated tag {tag_name} from ref {branch_ref}\n\
             tag {tag_name}\nfrom {branch_ref}\ntagger "
        ));
        block.extend_from_slice(&tag.author);
        block.extend_from_slice(format!(" {} +0000\ndata {}\n", tag.datetime, message.len()).as_bytes());
        block.extend_from_slice(&message);
        block.push(b'\n');
        self.fast_import.write(&block)
    }

    #[cfg(test)]
    pub(crate) fn annotated_tag_names(&self) -> Vec<String> {
        self.annotated_tags.keys().cloned().collect()
    }
}

impl Drop for FastImportRepository {
    fn drop(&mut self) {
        if self.outstanding_transactions != 0 {
            log::error!(
                "{}: {} transactions still outstanding at shutdown",
                self.name,
                self.outstanding_transactions
            );
        }
        if self.fast_import.is_running() {
            let timeout = self.options.fast_import_timeout;
            let _ = self.fast_import.close(timeout);
            self.cache.borrow_mut().remove(&self.name);
        }
    }
}

/// Emits the annotated tags sorted by name, then flushes the delayed notes in
/// stable datetime order. Tag names sort plainly (`release/4.10` before
/// `release/4.9`); a later pass rewrites those tags anyway.
pub fn finalize_tags(handle: &RepoHandle) -> Result<()> {
    let (tags, options) = {
        let repo = handle.borrow();
        let tags: Vec<(String, AnnotatedTag)> = repo
            .annotated_tags
            .iter()
            .map(|(name, tag)| (name.clone(), tag.clone()))
            .collect();
        (tags, repo.options.clone())
    };

    if !tags.is_empty() {
        {
            let mut repo = handle.borrow_mut();
            repo.save_annotated_tags()?;
            log::info!("Finalising annotated tags for {}...", repo.name);
            repo.start_fast_import()?;
        }
        for (tag_name, tag) in &tags {
            handle.borrow_mut().write_tag(tag_name, tag)?;

            // Append the metadata note to the tip of the supporting ref; a
            // note cannot be attached to the tag object itself with
            // fast-import.
            if options.add_metadata_notes {
                handle.borrow_mut().begin_transaction(&tag.supporting_ref)?;
                let mut txn = Transaction::new(
                    handle.clone(),
                    "",
                    &tag.supporting_ref,
                    &tag.svn_prefix.to_str_lossy(),
                    tag.revnum,
                );
                txn.set_author(tag.author.clone());
                txn.set_date_time(tag.datetime);
                let note = format_metadata_message(
                    &tag.svn_prefix.to_str_lossy(),
                    tag.revnum,
                    Some(tag_name),
                );
                txn.commit_note(&note, true, None)?;
            }
        }
    }

    // All notes gathered by the transactions are sorted by committer date so
    // refs/notes/commits keeps monotonically increasing dates.
    let notes = {
        let mut repo = handle.borrow_mut();
        let mut notes = std::mem::take(&mut repo.delayed_notes);
        notes.sort_by_key(|(datetime, _)| *datetime);
        notes
    };
    if !notes.is_empty() {
        let mut repo = handle.borrow_mut();
        repo.start_fast_import()?;
        for (_, note) in &notes {
            repo.fast_import.write(note)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fast_import::ProcessCache;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    pub(crate) fn test_options(dir: &std::path::Path) -> Rc<Options> {
        Rc::new(Options {
            target_dir: dir.to_path_buf(),
            identity_domain: "localhost".to_owned(),
            create_dump: true,
            commit_interval: 25_000,
            ..Default::default()
        })
    }

    pub(crate) fn test_repo(dir: &std::path::Path, name: &str) -> RepoHandle {
        let cache = ProcessCache::new(100);
        let decl = RepoDecl {
            name: name.to_owned(),
            ..Default::default()
        };
        FastImportRepository::create(&decl, test_options(dir), cache).unwrap()
    }

    #[test]
    fn test_mark_from_algebra() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let mut repo = handle.borrow_mut();
        repo.branches.insert(
            "x".to_owned(),
            Branch {
                created: 100,
                commits: vec![100, 105, 110],
                marks: vec![1, 2, 3],
            },
        );
        assert_eq!(repo.mark_from("missing", 100), MarkFrom::UnknownBranch);
        assert_eq!(repo.mark_from("x", 99), MarkFrom::NotYet);
        // Exact hit.
        assert_eq!(
            repo.mark_from("x", 105),
            MarkFrom::Found { mark: 2, closest_rev: 105 }
        );
        // Rounded down to the greatest commit <= rev.
        assert_eq!(
            repo.mark_from("x", 107),
            MarkFrom::Found { mark: 2, closest_rev: 105 }
        );
        assert_eq!(
            repo.mark_from("x", 500),
            MarkFrom::Found { mark: 3, closest_rev: 110 }
        );
    }

    #[test]
    fn test_msg_filter_strips_template() {
        let msg = b"subject\n> Description of fields to fill in above\nbody\n";
        assert_eq!(msg_filter(msg), BString::from("subject\n"));
        assert_eq!(msg_filter(b"keep\nall\n"), BString::from("keep\nall\n"));
        // Trailing empty lines collapse to one LF.
        assert_eq!(msg_filter(b"one\n\n\n"), BString::from("one\n"));
    }

    #[test]
    fn test_format_metadata_message() {
        assert_eq!(
            format_metadata_message("/head/", 7, None),
            BString::from("svn path=/head/; revision=7\n")
        );
        assert_eq!(
            format_metadata_message("/tags/r1/", 7, Some("r1")),
            BString::from("svn path=/tags/r1/; revision=7; tag=r1\n")
        );
    }

    #[test]
    fn test_delete_branch_backs_up_content() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let mut repo = handle.borrow_mut();
        repo.branches.insert(
            "x".to_owned(),
            Branch {
                created: 100,
                commits: vec![100],
                marks: vec![42_000_001],
            },
        );
        repo.delete_branch("x", 200).unwrap();
        let deleted = repo.deleted_branches.to_string();
        assert!(deleted.contains("reset refs/tags/backups/x@200\nfrom refs/heads/x\n"));
        assert!(deleted.contains(&format!("reset refs/heads/x\nfrom {}\n", "0".repeat(40))));
        assert!(deleted.contains("progress SVN r200 branch x = :0 # delete"));
    }

    #[test]
    fn test_commit_pending_drops_deleted_tag() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let mut repo = handle.borrow_mut();
        repo.create_annotated_tag(
            "refs/tags/v1",
            "/tags/v1/",
            5,
            &BString::from("A <a@b>"),
            5,
            &BString::from("tag it"),
        );
        repo.branches.insert(
            "refs/tags/v1".to_owned(),
            Branch {
                created: 5,
                commits: vec![5],
                marks: vec![42_000_001],
            },
        );
        repo.delete_branch("refs/tags/v1", 9).unwrap();
        repo.commit_pending().unwrap();
        assert!(repo.annotated_tag_names().is_empty());
    }

    #[test]
    fn test_setup_incremental_replays_log() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let repo_dir = dir.path().join("one");
        std::fs::create_dir_all(&repo_dir).unwrap();
        std::fs::write(
            repo_dir.join("marks-one"),
            ":42000001 aaaa\n:42000002 bbbb\n",
        )
        .unwrap();
        // create_dump mode logs into one.fi.
        let mut log = std::fs::File::create(dir.path().join("one.fi")).unwrap();
        writeln!(log, "progress SVN r100 branch master = :42000001").unwrap();
        writeln!(log, "progress SVN r101 branch master = :42000002 # merge from :42000001").unwrap();
        log.flush().unwrap();

        let mut cutoff = i64::MAX;
        let next = handle.borrow_mut().setup_incremental(&mut cutoff).unwrap();
        assert_eq!(next, 102);
        let repo = handle.borrow();
        let branch = &repo.branches["master"];
        assert_eq!(branch.commits, vec![100, 101]);
        assert_eq!(branch.marks, vec![42_000_001, 42_000_002]);
        assert_eq!(repo.marks.last_commit_mark(), 42_000_002);
    }

    #[test]
    fn test_setup_incremental_truncates_untrusted_tail() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let repo_dir = dir.path().join("one");
        std::fs::create_dir_all(&repo_dir).unwrap();
        // Only the first mark made it to the marks file.
        std::fs::write(repo_dir.join("marks-one"), ":42000001 aaaa\n").unwrap();
        let log_path = dir.path().join("one.fi");
        std::fs::write(
            &log_path,
            "progress SVN r100 branch master = :42000001\n\
             progress SVN r101 branch master = :42000002\n",
        )
        .unwrap();

        let mut cutoff = i64::MAX;
        let next = handle.borrow_mut().setup_incremental(&mut cutoff).unwrap();
        assert_eq!(cutoff, 101);
        assert_eq!(next, 101);
        // The log was truncated at the untrustworthy entry and backed up.
        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content, "progress SVN r100 branch master = :42000001\n");
        assert!(dir.path().join("one.fi.old").exists());

        // restore_log puts the backup back.
        handle.borrow().restore_log().unwrap();
        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.contains("r101"));
    }

    #[test]
    fn test_annotated_tags_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let options = Rc::new(Options {
            target_dir: dir.path().to_path_buf(),
            // Dump mode would skip persisting; pretend to be a real run but
            // with the repository directory pre-created.
            ..Options::default()
        });
        std::fs::create_dir_all(dir.path().join("one")).unwrap();
        std::fs::write(dir.path().join("one").join("marks-one"), "").unwrap();
        let cache = ProcessCache::new(100);
        let decl = RepoDecl {
            name: "one".to_owned(),
            ..Default::default()
        };
        let handle = FastImportRepository::create(&decl, options, cache).unwrap();
        {
            let mut repo = handle.borrow_mut();
            repo.create_annotated_tag(
                "refs/tags/v1",
                "/tags/v1/",
                5,
                &BString::from("A <a@b>"),
                1234,
                &BString::from("message"),
            );
            repo.save_annotated_tags().unwrap();
            repo.annotated_tags.clear();
            repo.restore_annotated_tags().unwrap();
            assert_eq!(repo.annotated_tag_names(), vec!["v1".to_owned()]);
            assert_eq!(repo.annotated_tags["v1"].datetime, 1234);
        }
    }
}

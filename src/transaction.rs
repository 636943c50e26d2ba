//! An in-progress commit for one `(repository, branch, revision)`.
//!
//! Modifications, deletions, renames and inferred merge parents accumulate
//! here and are emitted as a single fast-import commit block.

use anyhow::Result;
use anyhow::bail;
use bstr::BString;
use bstr::ByteVec as _;

use crate::marks::MAX_MARK;
use crate::marks::Mark;
use crate::repository::FastImportRepository;
use crate::repository::MarkFrom;
use crate::repository::RepoHandle;
use crate::repository::format_metadata_message;
use crate::repository::full_ref;
use crate::repository::msg_filter;
use crate::util::ensure_trailing_newline;

pub struct Transaction {
    repo: RepoHandle,
    /// Forwarding path prefix; empty for direct repositories.
    prefix: String,
    branch: String,
    svn_prefix: String,
    author: BString,
    log: BString,
    datetime: u64,
    revnum: i64,
    /// Keyed by source branch in insertion order, mirroring the svn log
    /// ordering rather than sorting by revision or branch.
    merge_map: Vec<(String, Mark)>,
    merges: Vec<Mark>,
    deleted_files: Vec<String>,
    renamed_files: Vec<(String, String)>,
    modified_files: BString,
    pub(crate) reset_from_tree: BString,
}

impl Transaction {
    pub(crate) fn new(
        repo: RepoHandle,
        prefix: &str,
        branch: &str,
        svn_prefix: &str,
        revnum: i64,
    ) -> Self {
        Transaction {
            repo,
            prefix: prefix.to_owned(),
            branch: branch.to_owned(),
            svn_prefix: svn_prefix.to_owned(),
            author: BString::from(""),
            log: BString::from(""),
            datetime: 0,
            revnum,
            merge_map: Vec::new(),
            merges: Vec::new(),
            deleted_files: Vec::new(),
            renamed_files: Vec::new(),
            modified_files: BString::from(""),
            reset_from_tree: BString::from(""),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn set_author(&mut self, author: BString) {
        self.author = author;
    }

    pub fn set_date_time(&mut self, datetime: u64) {
        self.datetime = datetime;
    }

    pub fn set_log(&mut self, log: BString) {
        self.log = log;
    }

    pub fn delete_file(&mut self, path: &str) {
        let mut full = format!("{}{}", self.prefix, path);
        if full.ends_with('/') {
            full.pop();
        }
        self.deleted_files.push(full);
    }

    /// Renames undo an earlier deletion of the source: rule ordering may have
    /// deleted a path that a later rule wants to move instead.
    pub fn rename_file(&mut self, from: &str, to: &str) {
        let mut from_full = format!("{}{}", self.prefix, from);
        let mut to_full = format!("{}{}", self.prefix, to);
        if from_full.ends_with('/') {
            from_full.pop();
        }
        if to_full.ends_with('/') {
            to_full.pop();
        }
        if let Some(idx) = self.deleted_files.iter().position(|path| *path == from_full) {
            self.deleted_files.remove(idx);
        }
        self.renamed_files.push((from_full, to_full));
    }

    /// Streams one blob and queues the matching `M` line.
    pub fn add_file(&mut self, path: &str, mode: u32, data: &[u8]) -> Result<()> {
        let mut repo = self.repo.borrow_mut();
        let mark = repo.marks.next_blob_mark();
        self.modified_files
            .push_str(format!("M {mode:o} :{mark} {}{path}\n", self.prefix));

        repo.start_fast_import()?;
        // Blob bodies bypass the tee'd log copy.
        repo.fast_import
            .write_no_log(format!("blob\nmark :{mark}\ndata {}\n", data.len()).as_bytes())?;
        repo.fast_import.write_no_log(data)?;
        repo.fast_import.write_no_log(b"\n")?;
        Ok(())
    }

    /// Records a copy source as a potential merge parent.
    ///
    /// If this revision is creating the branch and a higher-marked source
    /// turns up, the pending branch reset is replaced: svn often copies a
    /// tag's top-level directory from an older revision while the file
    /// contents come from newer ones. Otherwise a known source branch is
    /// bumped to the higher mark, or a new merge edge is added.
    pub fn note_copy_from_branch(
        &mut self,
        branch_from: &str,
        branch_rev: i64,
        allow_heuristic: bool,
    ) {
        if !self.reset_from_tree.is_empty() {
            // The branch is being reset from a nameless tree.
            return;
        }
        let mut repo = self.repo.borrow_mut();
        let mut lookup = repo.mark_from(branch_from, branch_rev);

        if lookup == MarkFrom::UnknownBranch && branch_from.ends_with("/dist") {
            // Vendor branches are exported without their /dist suffix.
            let non_dist = &branch_from[..branch_from.rfind("/dist").unwrap()];
            log::warn!(
                "{} is copying from branch {branch_from} but the latter doesn't exist.  \
                 Trying with {non_dist} instead.",
                self.branch
            );
            lookup = repo.mark_from(non_dist, branch_rev);
        }

        let mark = match lookup {
            MarkFrom::UnknownBranch => {
                log::warn!(
                    "{} is copying from branch {branch_from} but the latter doesn't exist.  \
                     Continuing, assuming the files exist.",
                    self.branch
                );
                return;
            }
            MarkFrom::NotYet | MarkFrom::Found { mark: 0, .. } => {
                log::warn!(
                    "Unknown revision r{branch_rev}.  Continuing, assuming the files exist."
                );
                return;
            }
            MarkFrom::Found { mark, .. } => mark,
        };

        let copied_log = format!(
            "repository {} branch {} has some files copied from {branch_from}@{branch_rev}",
            repo.name, self.branch
        );
        if repo.warned_already.insert(copied_log.clone()) {
            log::warn!("{copied_log}");
        }

        let branch_ref = full_ref(&self.branch);
        let creating_this_revision = repo
            .branches
            .get(&self.branch)
            .is_some_and(|br| br.created == self.revnum)
            && repo.reset_branch_names.contains(&branch_ref);
        if creating_this_revision {
            let last_mark = repo
                .branches
                .get(&self.branch)
                .and_then(|br| br.marks.last().copied())
                .unwrap_or(0);
            let reset_mentions_source = repo
                .reset_branches
                .to_string()
                .contains(&format!("from branch {branch_from}"));
            if last_mark < mark && reset_mentions_source {
                if !allow_heuristic {
                    log::debug!(
                        "found branchpoint from lower mark, ignoring due to manual rule override"
                    );
                    return;
                }
                log::debug!(
                    "found branchpoint from lower mark, about to recreate branch from different revision"
                );
                repo.reset_branches.clear();
                if let Err(err) = repo.create_branch(&self.branch, self.revnum, branch_from, branch_rev)
                {
                    log::warn!("Could not recreate branch {}: {err:#}", self.branch);
                }
                return;
            }
        }

        if let Some(entry) = self
            .merge_map
            .iter_mut()
            .find(|(from, _)| from == branch_from)
        {
            let old_mark = entry.1;
            if old_mark < mark {
                log::debug!(
                    "bumping to {branch_from}@{branch_rev} :{mark} from {old_mark} as a merge point"
                );
                if let Some(idx) = self.merges.iter().position(|&m| m == old_mark) {
                    self.merges.remove(idx);
                }
                self.merges.push(mark);
                entry.1 = mark;
            }
        } else {
            self.merges.push(mark);
            self.merge_map.push((branch_from.to_owned(), mark));
            log::debug!("adding {branch_from}@{branch_rev} :{mark} as a merge point");
        }
    }

    /// Queues a metadata note. The note commit is delayed until finalisation
    /// so all notes can be sorted into one refs/notes/commits stream; the
    /// returned bool mirrors whether anything was written now (never).
    pub fn commit_note(
        &mut self,
        note_text: &BString,
        append: bool,
        commit_ref: Option<&str>,
    ) -> Result<bool> {
        let mut repo = self.repo.borrow_mut();
        commit_note_inner(
            &mut repo,
            &self.branch,
            self.datetime,
            note_text,
            append,
            commit_ref,
        )
    }

    /// Emits the commit block. The branch ref already points at the parent
    /// (via an earlier commit or a flushed reset), so no `from` line is
    /// needed; a zero parent mark is a root commit, which is only expected at
    /// revision 1.
    pub fn commit(mut self) -> Result<()> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<()> {
        let mut repo = self.repo.borrow_mut();

        for branch_name in repo.branches.keys() {
            if branch_name.starts_with(&format!("{}/", self.branch))
                || self.branch.starts_with(&format!("{branch_name}/"))
            {
                bail!(
                    "Branch {} conflicts with already existing branch {branch_name} \
                     in repository {}",
                    self.branch,
                    repo.name
                );
            }
        }

        repo.start_fast_import()?;

        // A single SVN revision can modify several branches of one target, so
        // the commit mark counter is separate from the revision number.
        let mark = repo.marks.next_commit_mark();

        let mut message = ensure_trailing_newline(self.log.clone());
        if repo.options.add_metadata {
            message.push(b'\n');
            message.extend_from_slice(&format_metadata_message(&self.svn_prefix, self.revnum, None));
        }
        let message = msg_filter(&message);

        let mut parent_mark: Mark = 0;
        let revnum = self.revnum;
        let repo_name = repo.name.clone();
        let br = repo.branches.entry(self.branch.clone()).or_default();
        if br.created != 0 && br.marks.last().copied().unwrap_or(0) != 0 {
            parent_mark = *br.marks.last().unwrap();
        } else {
            if revnum > 1 {
                // Any branch at revision 1 isn't going to exist, so no need
                // to alarm the user there.
                log::warn!(
                    "Branch {} in repository {repo_name} doesn't exist at revision {revnum} \
                     -- did you resume from the wrong revision?",
                    self.branch
                );
            }
            br.created = revnum;
        }
        br.commits.push(revnum);
        br.marks.push(mark);

        let branch_ref = full_ref(&self.branch);
        let mut block = BString::from(format!("commit {branch_ref}\nmark :{mark}\ncommitter "));
        block.extend_from_slice(&self.author);
        block.push_str(format!(" {} +0000\ndata {}\n", self.datetime, message.len()));
        block.extend_from_slice(&message);
        block.push(b'\n');
        repo.fast_import.write(&block)?;

        let mut merge_desc = String::new();
        for &merge in &self.merges {
            if merge == parent_mark {
                log::debug!(
                    "Skipping marking {merge} as a merge point as it matches the parent"
                );
                continue;
            }
            merge_desc.push_str(&format!(" :{merge}"));
            repo.fast_import.write(format!("merge :{merge}\n").as_bytes())?;
        }

        // A suppressed branchpoint still starts from the previous content:
        // the source tree comes in by hash, without recording a parent.
        if !self.reset_from_tree.is_empty() {
            let reset_from_tree = self.reset_from_tree.clone();
            repo.fast_import.write(&reset_from_tree)?;
        }

        if self.deleted_files.iter().any(|path| path.is_empty()) {
            repo.fast_import.write(b"deleteall\n")?;
        } else {
            for path in &self.deleted_files {
                repo.fast_import.write(format!("D {path}\n").as_bytes())?;
            }
        }

        let modified_files = std::mem::take(&mut self.modified_files);
        repo.fast_import.write(&modified_files)?;

        // Rename fixups run after the modifications so that repo-copies can
        // be undone; a rename into nothing is a post-export delete.
        for (from, to) in &self.renamed_files {
            if to.is_empty() || to == "/dev/null" {
                repo.fast_import.write(format!("D {from}\n").as_bytes())?;
            } else {
                repo.fast_import.write(format!("R {from} {to}\n").as_bytes())?;
            }
        }

        let merge_suffix = if merge_desc.is_empty() {
            String::new()
        } else {
            format!(" # merge from{merge_desc}")
        };
        repo.fast_import.write(
            format!(
                "\nprogress SVN r{revnum} branch {} = :{mark}{merge_suffix}\n\n",
                self.branch
            )
            .as_bytes(),
        )?;

        // Tag refs are all annotated and exported last; noting them here
        // would create duplicate note commits that cannot be sorted into
        // chronological order anymore.
        if repo.options.add_metadata_notes && !self.branch.starts_with("refs/tags/") {
            let note = format_metadata_message(&self.svn_prefix, self.revnum, None);
            commit_note_inner(
                &mut repo,
                &self.branch,
                self.datetime,
                &note,
                false,
                Some(&format!(":{mark}")),
            )?;
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.repo.borrow_mut().forget_transaction();
    }
}

fn commit_note_inner(
    repo: &mut FastImportRepository,
    branch: &str,
    datetime: u64,
    note_text: &BString,
    append: bool,
    commit_ref: Option<&str>,
) -> Result<bool> {
    let branch_ref = full_ref(branch);
    let commit_target = commit_ref.unwrap_or(&branch_ref).to_owned();
    let mut message = format!("Adding Git note for current {branch_ref}\n");
    let mut text = ensure_trailing_newline(note_text.clone());

    let branch_note = repo
        .branch_note(branch)
        .cloned()
        .map(ensure_trailing_newline)
        .unwrap_or_default();
    if append && commit_ref.is_none() && repo.branches.contains_key(branch) && !branch_note.is_empty()
    {
        let without_newline = &branch_note[..branch_note.len() - 1];
        if text.starts_with(without_newline) {
            // The note is already part of the text, keep it unaltered.
        } else {
            let mut combined = branch_note.clone();
            combined.extend_from_slice(&text);
            text = combined;
            message = format!("Appending Git note for current {branch_ref}\n");
        }
    }
    repo.set_branch_note(branch, text.clone());

    let mut note = BString::from(format!(
        "commit refs/notes/commits\nmark :{MAX_MARK}\n\
         committer svn2git <svn2git@localhost> {datetime} +0000\ndata {}\n",
        message.len()
    ));
    note.push_str(&message);
    note.push(b'\n');
    note.push_str(format!("N inline {commit_target}\ndata {}\n", text.len()));
    note.extend_from_slice(&text);
    note.push(b'\n');
    repo.delayed_notes.push((datetime, note));
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Repository;
    use crate::repository::tests::test_repo;
    use pretty_assertions::assert_eq;

    const BLOB_MARK_1: Mark = MAX_MARK - 1;

    fn read_dump(dir: &std::path::Path, name: &str) -> String {
        std::fs::read_to_string(dir.join(format!("{name}.fi"))).unwrap()
    }

    #[test]
    fn test_single_file_add_on_new_branch() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let repo = Repository::Direct(handle.clone());

        let mut txn = repo.new_transaction("master", "/trunk/", 100).unwrap();
        txn.set_author(BString::from("An Author <an@example.com>"));
        txn.set_date_time(1000);
        txn.set_log(BString::from("add a.txt"));
        txn.add_file("a.txt", 0o100644, b"hi\n").unwrap();
        txn.commit().unwrap();
        handle.borrow_mut().close_fast_import().unwrap();

        let expected = format!(
            "blob\nmark :{BLOB_MARK_1}\ndata 3\nhi\n\n\
             commit refs/heads/master\n\
             mark :42000001\n\
             committer An Author <an@example.com> 1000 +0000\n\
             data 10\nadd a.txt\n\n\
             M 100644 :{BLOB_MARK_1} a.txt\n\
             \nprogress SVN r100 branch master = :42000001\n\n"
        );
        assert_eq!(read_dump(dir.path(), "one"), expected);
    }

    #[test]
    fn test_branch_copy_then_modification() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let repo = Repository::Direct(handle.clone());

        let mut txn = repo.new_transaction("master", "/trunk/", 100).unwrap();
        txn.set_author(BString::from("A <a@b>"));
        txn.set_date_time(100);
        txn.set_log(BString::from("r100"));
        txn.add_file("a.txt", 0o100644, b"hi\n").unwrap();
        txn.commit().unwrap();

        // r101 copies /trunk to /branches/x: a reset, no commit.
        repo.create_branch("x", 101, "master", 100).unwrap();
        repo.commit().unwrap();

        // r102 modifies a file on the new branch.
        let mut txn = repo.new_transaction("x", "/branches/x/", 102).unwrap();
        txn.set_author(BString::from("A <a@b>"));
        txn.set_date_time(102);
        txn.set_log(BString::from("r102"));
        txn.add_file("a.txt", 0o100644, b"hi there\n").unwrap();
        txn.commit().unwrap();
        handle.borrow_mut().close_fast_import().unwrap();

        let dump = read_dump(dir.path(), "one");
        assert!(
            dump.contains(
                "reset refs/heads/x\nfrom :42000001\n\n\
                 progress SVN r101 branch x = :42000001 # from branch master at r100\n\n"
            ),
            "{dump}"
        );
        assert!(dump.contains("progress SVN r102 branch x = :42000002\n"), "{dump}");
        // No `from` line on the commit itself; the ref was reset beforehand.
        assert!(!dump.contains("commit refs/heads/x\nfrom"), "{dump}");
    }

    #[test]
    fn test_rename_undoes_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let repo = Repository::Direct(handle.clone());

        let mut txn = repo.new_transaction("master", "/trunk/", 100).unwrap();
        txn.set_author(BString::from("A <a@b>"));
        txn.set_log(BString::from("move"));
        txn.delete_file("a");
        txn.rename_file("a", "b");
        txn.commit().unwrap();
        handle.borrow_mut().close_fast_import().unwrap();

        let dump = read_dump(dir.path(), "one");
        assert!(dump.contains("R a b\n"), "{dump}");
        assert!(!dump.contains("D a\n"), "{dump}");
    }

    #[test]
    fn test_rename_to_dev_null_deletes_after_modifications() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let repo = Repository::Direct(handle.clone());

        let mut txn = repo.new_transaction("master", "/trunk/", 100).unwrap();
        txn.set_author(BString::from("A <a@b>"));
        txn.set_log(BString::from("nuke"));
        txn.rename_file("gone", "/dev/null");
        txn.commit().unwrap();
        handle.borrow_mut().close_fast_import().unwrap();

        assert!(read_dump(dir.path(), "one").contains("D gone\n"));
    }

    #[test]
    fn test_empty_deleted_path_becomes_deleteall() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let repo = Repository::Direct(handle.clone());

        let mut txn = repo.new_transaction("master", "/trunk/", 100).unwrap();
        txn.set_author(BString::from("A <a@b>"));
        txn.set_log(BString::from("replace"));
        txn.delete_file("");
        txn.delete_file("other.txt");
        txn.commit().unwrap();
        handle.borrow_mut().close_fast_import().unwrap();

        let dump = read_dump(dir.path(), "one");
        assert!(dump.contains("deleteall\n"), "{dump}");
        assert!(!dump.contains("D other.txt\n"), "{dump}");
    }

    #[test]
    fn test_note_copy_is_idempotent_and_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let repo = Repository::Direct(handle.clone());

        // Two commits on x so there are two marks to pick from.
        for (rev, content) in [(10, "one\n"), (20, "two\n")] {
            let mut txn = repo.new_transaction("x", "/branches/x/", rev).unwrap();
            txn.set_author(BString::from("A <a@b>"));
            txn.set_log(BString::from("c"));
            txn.add_file("f", 0o100644, content.as_bytes()).unwrap();
            txn.commit().unwrap();
        }

        let mut txn = repo.new_transaction("master", "/trunk/", 30).unwrap();
        txn.note_copy_from_branch("x", 10, true);
        assert_eq!(txn.merges, vec![42_000_001]);
        // A higher mark for the same source replaces, not appends.
        txn.note_copy_from_branch("x", 20, true);
        assert_eq!(txn.merges, vec![42_000_002]);
        // Same arguments again: no change.
        txn.note_copy_from_branch("x", 20, true);
        assert_eq!(txn.merges, vec![42_000_002]);
        // A lower mark does not downgrade.
        txn.note_copy_from_branch("x", 10, true);
        assert_eq!(txn.merges, vec![42_000_002]);

        txn.set_author(BString::from("A <a@b>"));
        txn.set_log(BString::from("merge"));
        txn.commit().unwrap();
        handle.borrow_mut().close_fast_import().unwrap();

        let dump = read_dump(dir.path(), "one");
        assert!(dump.contains("merge :42000002\n"), "{dump}");
        assert!(
            dump.contains("progress SVN r30 branch master = :42000003 # merge from :42000002\n"),
            "{dump}"
        );
    }

    #[test]
    fn test_merge_matching_parent_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let repo = Repository::Direct(handle.clone());

        let mut txn = repo.new_transaction("master", "/trunk/", 10).unwrap();
        txn.set_author(BString::from("A <a@b>"));
        txn.set_log(BString::from("c1"));
        txn.commit().unwrap();

        let mut txn = repo.new_transaction("master", "/trunk/", 20).unwrap();
        txn.note_copy_from_branch("master", 10, true);
        txn.set_author(BString::from("A <a@b>"));
        txn.set_log(BString::from("c2"));
        txn.commit().unwrap();
        handle.borrow_mut().close_fast_import().unwrap();

        let dump = read_dump(dir.path(), "one");
        assert!(!dump.contains("merge :"), "{dump}");
    }

    #[test]
    fn test_conflicting_branch_names_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let repo = Repository::Direct(handle.clone());

        let mut txn = repo.new_transaction("master/sub", "/x/", 10).unwrap();
        txn.set_author(BString::from("A <a@b>"));
        txn.set_log(BString::from("bad"));
        let err = txn.commit().unwrap_err();
        assert!(format!("{err:#}").contains("conflicts"), "{err:#}");
    }

    #[test]
    fn test_forwarded_paths_get_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let repo = Repository::Forwarding {
            name: "view".to_owned(),
            target: handle.clone(),
            prefix: "sub/".to_owned(),
        };

        let mut txn = repo.new_transaction("master", "/trunk/", 100).unwrap();
        txn.set_author(BString::from("A <a@b>"));
        txn.set_log(BString::from("c"));
        txn.add_file("a.txt", 0o100644, b"hi\n").unwrap();
        txn.delete_file("b.txt");
        txn.rename_file("c.txt", "d.txt");
        txn.commit().unwrap();
        handle.borrow_mut().close_fast_import().unwrap();

        let dump = read_dump(dir.path(), "one");
        assert!(dump.contains("M 100644 :18446744073709551614 sub/a.txt\n"), "{dump}");
        assert!(dump.contains("D sub/b.txt\n"), "{dump}");
        assert!(dump.contains("R sub/c.txt sub/d.txt\n"), "{dump}");
    }

    #[test]
    fn test_commit_note_is_delayed_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_repo(dir.path(), "one");
        let repo = Repository::Direct(handle.clone());

        let mut txn = repo.new_transaction("master", "/trunk/", 10).unwrap();
        txn.set_date_time(2000);
        let written = txn
            .commit_note(&BString::from("second note"), false, Some(":42000002"))
            .unwrap();
        assert!(!written);
        drop(txn);

        let mut txn = repo.new_transaction("master", "/trunk/", 11).unwrap();
        txn.set_date_time(1000);
        txn.commit_note(&BString::from("first note"), false, Some(":42000001"))
            .unwrap();
        drop(txn);

        crate::repository::finalize_tags(&handle).unwrap();
        handle.borrow_mut().close_fast_import().unwrap();

        let dump = read_dump(dir.path(), "one");
        let first = dump.find("first note").unwrap();
        let second = dump.find("second note").unwrap();
        assert!(first < second, "notes must be sorted by datetime:\n{dump}");
        assert!(dump.contains(&format!("commit refs/notes/commits\nmark :{MAX_MARK}\n")));
    }
}

//! Walks one SVN revision at a time: enumerates the changed paths in sorted
//! order, matches each against the rule lists, and translates the operations
//! into per-branch transactions. Copy-with-history turns into branch
//! creations or merge edges; the merge-inference engine runs once per
//! revision after the path loop.

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use bstr::BString;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::cli::Options;
use crate::identities::IdentityMap;
use crate::mergeinfo::MergeParse;
use crate::mergeinfo::MergeTables;
use crate::mergeinfo::parse_mergeinfo_diff;
use crate::repository::Repository;
use crate::rules::ANY_RULE;
use crate::rules::MatchRule;
use crate::rules::NO_IGNORE_RULE;
use crate::rules::RuleAction;
use crate::rules::find_match_rule;
use crate::svn::ChangeKind;
use crate::svn::NodeKind;
use crate::svn::PathChange;
use crate::svn::SvnRepo;
use crate::transaction::Transaction;

pub struct RevisionWalker {
    svn: SvnRepo,
    rule_lists: Vec<Vec<MatchRule>>,
    repositories: BTreeMap<String, Repository>,
    identities: IdentityMap,
    tables: MergeTables,
    options: Rc<Options>,
}

/// Everything accumulated while exporting one revision.
struct RevisionState {
    revnum: i64,
    /// Keyed by repository name + branch name.
    transactions: BTreeMap<String, Transaction>,
    to_branches: BTreeSet<String>,
    merge_from_branch: Option<String>,
    merge_from_rev: Option<i64>,
    /// Rule-level deletes, issued once per (repository, branch).
    deletions: BTreeMap<String, BTreeSet<String>>,
    /// Rule-level renames, ditto.
    renames: BTreeMap<String, BTreeMap<String, String>>,
    need_commit: bool,
    mergeinfo_found: bool,
    props: Option<(BString, BString, u64)>,
}

impl RevisionState {
    fn new(revnum: i64) -> Self {
        RevisionState {
            revnum,
            transactions: BTreeMap::new(),
            to_branches: BTreeSet::new(),
            merge_from_branch: None,
            merge_from_rev: None,
            deletions: BTreeMap::new(),
            renames: BTreeMap::new(),
            need_commit: false,
            mergeinfo_found: false,
            props: None,
        }
    }
}

/// The per-rule decomposition of a matched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SplitPath {
    pub svn_prefix: String,
    pub repository: String,
    pub effective_repository: String,
    pub branch: String,
    pub sub_path: String,
}

impl RevisionWalker {
    pub fn new(
        svn: SvnRepo,
        rule_lists: Vec<Vec<MatchRule>>,
        repositories: BTreeMap<String, Repository>,
        identities: IdentityMap,
        tables: MergeTables,
        options: Rc<Options>,
    ) -> Self {
        RevisionWalker {
            svn,
            rule_lists,
            repositories,
            identities,
            tables,
            options,
        }
    }

    pub fn repositories(&self) -> &BTreeMap<String, Repository> {
        &self.repositories
    }

    pub fn svn(&self) -> &SvnRepo {
        &self.svn
    }

    pub fn export_revision(&self, revnum: i64) -> Result<()> {
        log::debug!("Exporting revision {revnum}");
        let mut state = RevisionState::new(revnum);
        self.prepare_transactions(&mut state)
            .with_context(|| format!("While exporting revision {revnum}"))?;
        if !state.need_commit {
            log::debug!("revision {revnum}: nothing to do");
            return Ok(());
        }
        self.commit(&mut state)
            .with_context(|| format!("While committing revision {revnum}"))
    }

    fn prepare_transactions(&self, state: &mut RevisionState) -> Result<()> {
        let changes = self.svn.paths_changed(state.revnum)?;

        for (path, change) in &changes {
            if !state.mergeinfo_found
                && change.prop_mod
                && self.svn.mergeinfo_changed(state.revnum, path)?
            {
                state.mergeinfo_found = true;
            }
            self.export_entry(state, path, change, &changes)?;
        }

        // Rule-level deletes and renames were gathered during matching; issue
        // them once per branch instead of once per matched path.
        let deletions = std::mem::take(&mut state.deletions);
        for (repo_branch, paths) in &deletions {
            let txn = state
                .transactions
                .get_mut(repo_branch)
                .with_context(|| format!("No transaction for rule-level delete on {repo_branch}"))?;
            for path in paths {
                if self.options.debug_rules {
                    log::debug!("delete ({} {path})", txn.branch());
                }
                txn.delete_file(path);
            }
        }
        let renames = std::mem::take(&mut state.renames);
        for (repo_branch, pairs) in &renames {
            let txn = state
                .transactions
                .get_mut(repo_branch)
                .with_context(|| format!("No transaction for rule-level rename on {repo_branch}"))?;
            for (from, to) in pairs {
                if self.options.debug_rules {
                    log::debug!("rename ({} {from} -> {to})", txn.branch());
                }
                txn.rename_file(from, to);
            }
        }

        self.infer_merges(state)
    }

    fn export_entry(
        &self,
        state: &mut RevisionState,
        path: &str,
        change: &PathChange,
        changes: &BTreeMap<String, PathChange>,
    ) -> Result<()> {
        let revnum = state.revnum;
        let mut is_dir = change.is_dir;
        let mut copy_from = change.copy_from.clone();

        if change.kind == ChangeKind::Delete {
            if !is_dir {
                is_dir = self.svn.is_dir(revnum - 1, path)?;
            }
        } else if is_dir
            && change.kind == ChangeKind::Add
            && copy_from.is_none()
            && self.options.empty_dirs
        {
            // The plain SVN directory layout never materialises.
            if path.ends_with("/trunk") || path.ends_with("/branches") || path.ends_with("/tags") {
                log::debug!("Skipping SVN directory layout: {path}");
                return Ok(());
            }
            state.need_commit = true;
        } else if is_dir && copy_from.is_none() && self.options.svn_ignore {
            state.need_commit = true;
        } else if is_dir {
            match change.kind {
                ChangeKind::Modify | ChangeKind::Add => {
                    if copy_from.is_none() {
                        // Freshly added directory or modified properties; Git
                        // doesn't track directories.
                        return Ok(());
                    }
                    let (from_path, from_rev) = copy_from.as_ref().unwrap();
                    log::debug!("{path} was copied from {from_path} rev {from_rev}");
                }
                ChangeKind::Replace => match &copy_from {
                    None => log::debug!("{path} was replaced"),
                    Some((from_path, from_rev)) => {
                        log::debug!("{path} was replaced from {from_path} rev {from_rev}")
                    }
                },
                ChangeKind::Delete => unreachable!("deletes handled above"),
            }
        }

        let mut current = path.to_owned();
        if is_dir {
            current.push('/');
        }

        let mut handled = false;
        for rules in &self.rule_lists {
            if let Some(rule) = find_match_rule(rules, revnum, &current, ANY_RULE) {
                self.export_dispatch(state, path, change, &copy_from, &current, rule, rules, changes)?;
                handled = true;
            } else if is_dir && copy_from.is_some() {
                log::debug!("{current} is a copy-with-history, auto-recursing");
                self.recurse(state, path, change, &copy_from, rules, changes)?;
                handled = true;
            } else if is_dir && change.kind == ChangeKind::Delete {
                log::debug!("{current} deleted, auto-recursing");
                self.recurse(state, path, change, &copy_from, rules, changes)?;
                handled = true;
            }
        }
        if handled {
            return Ok(());
        }
        if self.svn.is_dir(revnum - 1, path)? {
            log::debug!("{current} was a directory; ignoring");
        } else if change.kind == ChangeKind::Delete {
            log::debug!("{current} is being deleted but I don't know anything about it; ignoring");
        } else {
            bail!("{current} did not match any rules; cannot continue");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn export_dispatch(
        &self,
        state: &mut RevisionState,
        path: &str,
        change: &PathChange,
        copy_from: &Option<(String, i64)>,
        current: &str,
        rule: &MatchRule,
        rules: &[MatchRule],
        changes: &BTreeMap<String, PathChange>,
    ) -> Result<()> {
        match rule.action {
            RuleAction::Ignore => {
                if self.options.debug_rules {
                    log::debug!("rev {} {current} matched {}: ignoring", state.revnum, rule.info());
                }
                Ok(())
            }
            RuleAction::Recurse => {
                if self.options.debug_rules {
                    log::debug!("rev {} {current} matched {}: recursing", state.revnum, rule.info());
                }
                self.recurse(state, path, change, copy_from, rules, changes)
            }
            RuleAction::Export => {
                if self.options.debug_rules {
                    log::debug!("rev {} {current} matched {}: exporting", state.revnum, rule.info());
                }
                match self.export_internal(state, path, change, copy_from, current, rule, rules) {
                    Ok(()) => Ok(()),
                    Err(err) if change.kind == ChangeKind::Delete => {
                        // The default action inside recurse is to recurse
                        // further or to ignore, either of which is safe for a
                        // deletion.
                        log::warn!("deleting unknown path {current}; auto-recursing ({err:#})");
                        self.recurse(state, path, change, copy_from, rules, changes)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn export_internal(
        &self,
        state: &mut RevisionState,
        path: &str,
        change: &PathChange,
        copy_from: &Option<(String, i64)>,
        current: &str,
        rule: &MatchRule,
        rules: &[MatchRule],
    ) -> Result<()> {
        let revnum = state.revnum;
        state.need_commit = true;
        let split = self.split_path_name(rule, current);
        state.to_branches.insert(split.branch.clone());

        let Some(repo) = self.repositories.get(&split.repository) else {
            if change.kind != ChangeKind::Delete {
                log::error!(
                    "{} references unknown repository {}",
                    rule.info(),
                    split.repository
                );
            }
            bail!("unknown repository {}", split.repository);
        };

        if change.kind == ChangeKind::Delete
            && current == split.svn_prefix
            && split.sub_path.is_empty()
            && !repo.has_prefix()
        {
            if self.options.debug_rules {
                log::debug!(
                    "repository {} branch {} deleted",
                    split.repository,
                    split.branch
                );
            }
            return repo.delete_branch(&split.branch, revnum);
        }

        // Resolve the copy source through the rules; an uncovered source
        // degrades the copy to a plain modification.
        let mut effective_copy = copy_from.clone();
        let mut previous = String::new();
        let mut prev_split: Option<SplitPath> = None;
        if let Some((from_path, from_rev)) = &effective_copy {
            previous = from_path.clone();
            if self.svn.is_dir(*from_rev, from_path)? {
                previous.push('/');
            }
            match find_match_rule(rules, *from_rev, &previous, NO_IGNORE_RULE) {
                Some(prev_rule) => {
                    prev_split = Some(self.split_path_name(prev_rule, &previous));
                }
                None => {
                    log::warn!(
                        "SVN reports a \"copy from\" @ {revnum} from {from_path} @ {from_rev} \
                         but no matching rules found! Ignoring copy, treating as a modification"
                    );
                    effective_copy = None;
                }
            }
        }

        // current == svn_prefix means the whole branch content is affected.
        if let (Some((_, from_rev)), Some(prev)) = (&effective_copy, &mut prev_split)
            && current == split.svn_prefix
            && split.sub_path.is_empty()
        {
            let from_rev = *from_rev;
            if previous != prev.svn_prefix {
                // Source is not the whole of its branch.
                log::debug!(
                    "{current} is a partial branch of repository {} branch {} subdir {}",
                    prev.repository,
                    prev.branch,
                    prev.sub_path
                );
                // A subdir forked from head into a vendor branch must not
                // record the parent; it would confuse git-subtree.
                if rule.branchpoint.starts_with("none") {
                    log::warn!(
                        "Not recording {current} as branchpoint from {} rev {from_rev}",
                        prev.branch
                    );
                    prev.branch.clear();
                }
            } else if prev.effective_repository != split.effective_repository {
                log::warn!(
                    "{current} rev {revnum} is a cross-repository copy (from repository {} \
                     branch {} path {} rev {from_rev})",
                    prev.repository,
                    prev.branch,
                    prev.sub_path
                );
            } else if split.sub_path != prev.sub_path {
                // Happens when a prefixed vendor branch gets copied to a tag;
                // the tag would end up disconnected.
                log::warn!(
                    "{current} is a branch copy which renames base directory of all contents \
                     {} to {}",
                    prev.sub_path,
                    split.sub_path
                );
                bail!("This must not happen. Vendor tags will be disconnected.");
            } else if !(split.branch.starts_with("vendor") && prev.branch == "master") {
                // A branch creation or a reseat. (Vendor branches forked off
                // head by deleting everything are skipped.)
                if prev.branch == split.branch {
                    log::debug!(
                        "{current} rev {revnum} is reseating branch {} to an earlier revision \
                         {previous} rev {from_rev}",
                        split.branch
                    );
                } else {
                    log::debug!(
                        "{}: branch {} is branching from {}",
                        split.repository,
                        split.branch,
                        prev.branch
                    );
                }

                if !rule.branchpoint.is_empty() {
                    log::warn!(
                        "Not recording {current} as branchpoint from {} rev {from_rev}",
                        prev.branch
                    );
                    let Some((point_branch, point_ref)) = rule.branchpoint.split_once('@') else {
                        bail!(
                            "Please provide none@<treehash> or otherbranch@ref for this sort \
                             of branch creation!"
                        );
                    };
                    let txn = ensure_transaction(state, repo, &split, revnum)?;
                    if point_branch == "none" {
                        repo.create_branch_from_tree(&split.branch, revnum, point_ref, txn)?;
                    } else {
                        let point_rev: i64 = point_ref
                            .parse()
                            .context("branchpoint revision must be numeric")?;
                        repo.create_branch(&split.branch, revnum, point_branch, point_rev)?;
                    }
                } else {
                    repo.create_branch(&split.branch, revnum, &prev.branch, from_rev)?;
                }

                if self.options.svn_branches {
                    let txn = ensure_transaction(state, repo, &split, revnum)?;
                    if self.options.debug_rules {
                        log::debug!(
                            "Create a true SVN copy of branch ({path} -> {} {})",
                            split.branch,
                            split.sub_path
                        );
                    }
                    txn.delete_file(&split.sub_path);
                    let sub_path = split.sub_path.clone();
                    self.dump_dir_into(state, &split, path, &sub_path, revnum, rule, rules)?;
                }
                if rule.annotate {
                    self.fetch_rev_props(state)?;
                    let (author, log_msg, epoch) = state.props.clone().unwrap();
                    repo.create_annotated_tag(
                        &split.branch,
                        &split.svn_prefix,
                        revnum,
                        &author,
                        epoch,
                        &log_msg,
                    );
                }
                return Ok(());
            }
        }

        ensure_transaction(state, repo, &split, revnum)?;

        // A copied path that did not create a branch still hints at history:
        // record a merge edge, subject to the FreeBSD branch-flow filters.
        // Never into stable/releng (cherry-picks only), never from stable
        // (pulls in everything), vendor targets only accept vendor sources,
        // and user branches never merge into head.
        if let Some((_, from_rev)) = &effective_copy
            && let Some(prev) = &prev_split
            && prev.repository == split.repository
            && prev.branch != split.branch
            && (split.branch.starts_with("master")
                || split.branch.starts_with("projects")
                || split.branch.starts_with("user")
                || split.branch.starts_with("vendor")
                || split.branch.starts_with("refs/tags/vendor"))
            && !((split.branch.starts_with("vendor") || split.branch.starts_with("refs/tags/vendor"))
                && prev.branch == "master")
            && !(split.branch.starts_with("master") && prev.branch.starts_with("user"))
            && !prev.branch.is_empty()
            && !prev.branch.starts_with("stable")
        {
            let copy_log = format!(
                "copy from branch {} to branch {} @rev {from_rev}",
                prev.branch, split.branch
            );
            {
                let repo_handle = repo.handle();
                let mut backing = repo_handle.borrow_mut();
                if backing.warned_already.insert(copy_log.clone()) {
                    log::debug!("{copy_log}");
                }
            }
            if rule.branchpoint.starts_with("none") {
                log::warn!(
                    "Not recording {current} as branchpoint from {} rev {from_rev}",
                    prev.branch
                );
            } else {
                state.merge_from_rev = Some(*from_rev);
                state.merge_from_branch = Some(prev.branch.clone());
                let txn = ensure_transaction(state, repo, &split, revnum)?;
                txn.note_copy_from_branch(&prev.branch, *from_rev, true);
            }
        }

        if change.kind == ChangeKind::Replace && effective_copy.is_none() {
            if self.options.debug_rules {
                log::debug!("replaced with empty path ({} {})", split.branch, split.sub_path);
            }
            let txn = ensure_transaction(state, repo, &split, revnum)?;
            txn.delete_file(&split.sub_path);
        }

        if change.kind == ChangeKind::Delete {
            if self.options.debug_rules {
                log::debug!("delete ({} {})", split.branch, split.sub_path);
            }
            let txn = ensure_transaction(state, repo, &split, revnum)?;
            txn.delete_file(&split.sub_path);
        } else if !current.ends_with('/') {
            if self.options.debug_rules {
                log::debug!(
                    "add/change file ({path} -> {} {})",
                    split.branch,
                    split.sub_path
                );
            }
            let txn = ensure_transaction(state, repo, &split, revnum)?;
            self.dump_blob(txn, revnum, path, &split.sub_path)?;
        } else {
            if self.options.debug_rules {
                log::debug!(
                    "add/change dir ({path} -> {} {})",
                    split.branch,
                    split.sub_path
                );
            }

            let props_or_copy = (effective_copy.is_none() && change.prop_mod)
                || (effective_copy.is_some()
                    && matches!(change.kind, ChangeKind::Add | ChangeKind::Replace));

            if props_or_copy && self.options.propcheck {
                if let Err(err) = self.check_unknown_props(revnum, path) {
                    log::warn!("Error checking svn properties ({path}): {err:#}");
                }
            }

            // Don't deleteall the branch when a branchpoint override provides
            // the starting tree.
            if split.sub_path.is_empty() && rule.branchpoint.starts_with("none@") {
                let tree_hash = rule.branchpoint.split_once('@').unwrap().1.to_owned();
                let txn = ensure_transaction(state, repo, &split, revnum)?;
                repo.create_branch_from_tree(&split.branch, revnum, &tree_hash, txn)?;
            } else if split.sub_path.is_empty() && rule.branchpoint == "none" {
                // Keep the previous tree.
            } else {
                let txn = ensure_transaction(state, repo, &split, revnum)?;
                txn.delete_file(&split.sub_path);
            }

            let mut ignore_set = false;
            if props_or_copy && self.options.svn_ignore {
                match self.fetch_ignore_props(revnum, path) {
                    Err(err) => log::warn!("Error fetching svn properties ({path}): {err:#}"),
                    Ok(Some(ignore_content)) => {
                        let txn = ensure_transaction(state, repo, &split, revnum)?;
                        self.add_git_ignore(
                            txn,
                            revnum,
                            path,
                            &split.sub_path,
                            Some(&ignore_content),
                        )?;
                        ignore_set = true;
                    }
                    Ok(None) => {}
                }
            }

            if self.options.empty_dirs && !ignore_set {
                let txn = ensure_transaction(state, repo, &split, revnum)?;
                if self.add_git_ignore(txn, revnum, path, &split.sub_path, None)? {
                    // The directory is empty; the placeholder is all of it.
                    return Ok(());
                }
            }

            let sub_path = split.sub_path.clone();
            self.dump_dir_into(state, &split, path, &sub_path, revnum, rule, rules)?;
        }

        if rule.annotate {
            self.fetch_rev_props(state)?;
            let (author, log_msg, epoch) = state.props.clone().unwrap();
            repo.create_annotated_tag(
                &split.branch,
                &split.svn_prefix,
                revnum,
                &author,
                epoch,
                &log_msg,
            );
        }

        // An explicit branchpoint also records the merge edge. The transaction
        // ignores it silently when it is running from a bare tree, so the
        // none@<hash> form is harmless here.
        if !rule.branchpoint.is_empty() && rule.branchpoint != "none" {
            let Some((point_branch, point_rev)) = rule.branchpoint.split_once('@') else {
                bail!("Please provide branch@<revnum> for this sort of merge record!");
            };
            let point_rev: i64 = point_rev.parse().unwrap_or(0);
            let txn = ensure_transaction(state, repo, &split, revnum)?;
            txn.note_copy_from_branch(point_branch, point_rev, false);
        }

        if !rule.deletes.is_empty() {
            let key = format!("{}{}", split.repository, split.branch);
            state
                .deletions
                .entry(key)
                .or_default()
                .extend(rule.deletes.iter().cloned());
        }
        if !rule.renames.is_empty() {
            let key = format!("{}{}", split.repository, split.branch);
            let pairs = state.renames.entry(key).or_default();
            for (from, to) in &rule.renames {
                pairs.insert(from.clone(), to.clone());
            }
        }

        Ok(())
    }

    fn recurse(
        &self,
        state: &mut RevisionState,
        path: &str,
        change: &PathChange,
        copy_from: &Option<(String, i64)>,
        rules: &[MatchRule],
        changes: &BTreeMap<String, PathChange>,
    ) -> Result<()> {
        let revnum = state.revnum;
        let root_rev = if change.kind == ChangeKind::Delete {
            revnum - 1
        } else {
            revnum
        };
        match self.svn.check_path(root_rev, path)? {
            NodeKind::None => {
                log::warn!("Trying to recurse using a nonexistant path {path}, ignoring");
                return Ok(());
            }
            NodeKind::File => {
                log::warn!("Trying to recurse using a non-directory path {path}, ignoring");
                return Ok(());
            }
            NodeKind::Dir => {}
        }

        for (name, kind) in self.svn.dir_entries(root_rev, path)? {
            let entry = format!("{path}/{name}");
            let entry_from = copy_from
                .as_ref()
                .map(|(from_path, from_rev)| (format!("{from_path}/{name}"), *from_rev));

            if let Some(other) = changes.get(&entry)
                && other.kind == ChangeKind::Add
            {
                log::debug!("{entry} rev {revnum} is in the change-list, deferring to that one");
                continue;
            }

            let mut current = entry.clone();
            if kind == NodeKind::Dir {
                current.push('/');
            }
            match find_match_rule(rules, revnum, &current, ANY_RULE) {
                Some(rule) => {
                    self.export_dispatch(
                        state,
                        &entry,
                        change,
                        &entry_from,
                        &current,
                        rule,
                        rules,
                        changes,
                    )?;
                }
                None if kind == NodeKind::Dir => {
                    log::debug!("{current} rev {revnum} did not match any rules; auto-recursing");
                    self.recurse(state, &entry, change, &entry_from, rules, changes)?;
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Dumps a whole subtree into the transaction of `split`, sorted by entry
    /// name so repeated conversions produce the same commit hashes.
    fn dump_dir_into(
        &self,
        state: &mut RevisionState,
        split: &SplitPath,
        path: &str,
        final_path: &str,
        revnum: i64,
        rule: &MatchRule,
        rules: &[MatchRule],
    ) -> Result<()> {
        let key = format!("{}{}", split.repository, split.branch);
        let txn = state
            .transactions
            .get_mut(&key)
            .expect("transaction created before dumping");
        self.recursive_dump_dir(txn, path, final_path, revnum, rule, rules)
    }

    fn recursive_dump_dir(
        &self,
        txn: &mut Transaction,
        path: &str,
        final_path: &str,
        revnum: i64,
        rule: &MatchRule,
        rules: &[MatchRule],
    ) -> Result<()> {
        if !self.svn.is_dir(revnum, path)? {
            return self.dump_blob(txn, revnum, path, final_path);
        }
        for (name, kind) in self.svn.dir_entries(revnum, path)? {
            let entry_path = format!("{path}/{name}");
            let entry_final = format!("{final_path}{name}");
            match kind {
                NodeKind::Dir => {
                    let entry_current = format!("{entry_path}/");
                    // No match of the parent repository should not happen.
                    let Some(entry_rule) = find_match_rule(rules, revnum, &entry_current, ANY_RULE)
                    else {
                        continue;
                    };
                    if entry_rule.action != RuleAction::Export
                        || entry_rule.repository != rule.repository
                    {
                        if self.options.debug_rules {
                            log::debug!(
                                "recursive dump: {entry_current} skip entry for \
                                 different/ignored repository"
                            );
                        }
                        continue;
                    }
                    self.recursive_dump_dir(
                        txn,
                        &entry_path,
                        &format!("{entry_final}/"),
                        revnum,
                        rule,
                        rules,
                    )?;
                }
                NodeKind::File => self.dump_blob(txn, revnum, &entry_path, &entry_final)?,
                NodeKind::None => {}
            }
        }
        Ok(())
    }

    /// Streams one file into the transaction. `svn:special` blobs beginning
    /// with `link ` become symlinks with the prefix stripped.
    fn dump_blob(
        &self,
        txn: &mut Transaction,
        revnum: i64,
        path: &str,
        final_path: &str,
    ) -> Result<()> {
        let mut mode = if self.svn.node_prop(revnum, path, "svn:executable")?.is_some() {
            0o100755
        } else {
            0o100644
        };
        if self.options.dry_run {
            // A dry run still checks that the file is reachable, without
            // pulling its content through the pipe.
            self.svn.file_length(revnum, path)?;
            return txn.add_file(final_path, mode, b"");
        }
        let mut contents = self.svn.file_contents(revnum, path)?;
        if self.svn.node_prop(revnum, path, "svn:special")?.is_some() {
            match symlink_target(&contents) {
                Some(target) => {
                    mode = 0o120000;
                    contents = target.to_vec();
                }
                None => {
                    // A link that changed into a file within one commit.
                    log::warn!("file {path} is svn:special but not a symlink");
                }
            }
        }
        txn.add_file(final_path, mode, &contents)
    }

    /// Writes a `.gitignore` under `sub_path`. Without content this is the
    /// empty-directory placeholder, refused when the directory has entries;
    /// returns whether the file was added.
    fn add_git_ignore(
        &self,
        txn: &mut Transaction,
        revnum: i64,
        path: &str,
        sub_path: &str,
        content: Option<&str>,
    ) -> Result<bool> {
        if content.is_none() && !self.svn.dir_entries(revnum, path)?.is_empty() {
            return Ok(false);
        }
        let gitignore_path = format!("{sub_path}.gitignore");
        txn.add_file(&gitignore_path, 0o100644, content.unwrap_or("").as_bytes())?;
        Ok(true)
    }

    fn fetch_ignore_props(&self, revnum: i64, path: &str) -> Result<Option<String>> {
        let ignore = self
            .svn
            .node_prop(revnum, path, "svn:ignore")?
            .map(|value| String::from_utf8_lossy(&value).into_owned());
        let global = self
            .svn
            .node_prop(revnum, path, "svn:global-ignores")?
            .map(|value| String::from_utf8_lossy(&value).into_owned());
        Ok(translate_svn_ignore(ignore.as_deref(), global.as_deref()))
    }

    fn check_unknown_props(&self, revnum: i64, path: &str) -> Result<()> {
        for prop in self.svn.node_proplist(revnum, path)? {
            if prop != "svn:ignore" && prop != "svn:global-ignores" && prop != "svn:mergeinfo" {
                let value = self
                    .svn
                    .node_prop(revnum, path, &prop)?
                    .map(|v| String::from_utf8_lossy(&v).into_owned())
                    .unwrap_or_default();
                log::warn!("Unknown svn property {prop} set to {value:?} for {path}");
            }
        }
        Ok(())
    }

    pub(crate) fn split_path_name(&self, rule: &MatchRule, current: &str) -> SplitPath {
        let matched = rule
            .rx
            .find(current)
            .expect("split_path_name requires a matching rule");
        let svn_prefix = &current[..matched.end()];

        let mut repository = rule
            .rx
            .replace(svn_prefix, rule.repository.as_str())
            .into_owned();
        for subst in &rule.repo_substs {
            subst.apply(&mut repository);
        }

        let effective_repository = self
            .repositories
            .get(&repository)
            .map(|repo| repo.effective_name())
            .unwrap_or_else(|| repository.clone());

        let mut branch = rule.rx.replace(svn_prefix, rule.branch.as_str()).into_owned();
        for subst in &rule.branch_substs {
            subst.apply(&mut branch);
        }

        let prefix = rule.rx.replace(svn_prefix, rule.prefix.as_str()).into_owned();
        let mut suffix = &current[matched.end()..];
        if !rule.strip.is_empty() && suffix.starts_with(&rule.strip) {
            suffix = &suffix[rule.strip.len()..];
        }

        SplitPath {
            svn_prefix: svn_prefix.to_owned(),
            repository,
            effective_repository,
            branch,
            sub_path: format!("{prefix}{suffix}"),
        }
    }

    /// Translates an SVN path (with surrounding slashes) to a branch name via
    /// the export/recurse rules; empty when no rule covers it.
    fn match_path_to_branch(&self, path: &str, revnum: i64) -> String {
        let mut branch = String::new();
        for rules in &self.rule_lists {
            if let Some(rule) = find_match_rule(rules, revnum, path, ANY_RULE)
                && rule.action != RuleAction::Ignore
            {
                branch = self.split_path_name(rule, path).branch;
            }
        }
        branch
    }

    fn fetch_rev_props(&self, state: &mut RevisionState) -> Result<()> {
        if state.props.is_some() {
            return Ok(());
        }
        let props = self.svn.rev_props(state.revnum)?;
        let author = self.identities.resolve(props.author.as_deref());
        state.props = Some((author, props.log, props.epoch));
        Ok(())
    }

    fn commit(&self, state: &mut RevisionState) -> Result<()> {
        self.fetch_rev_props(state)?;
        for repo in self.repositories.values() {
            repo.commit()?;
        }
        let (author, log_msg, epoch) = state.props.clone().unwrap();
        for (_, mut txn) in std::mem::take(&mut state.transactions) {
            txn.set_author(author.clone());
            txn.set_date_time(epoch);
            txn.set_log(log_msg.clone());
            txn.commit()?;
        }
        Ok(())
    }

    /// The merge-inference pipeline, run once per revision after rule
    /// dispatch. Forced merges short-circuit everything; otherwise mergeinfo
    /// noise is filtered through the curated tables before the property-diff
    /// parser gets a say.
    fn infer_merges(&self, state: &mut RevisionState) -> Result<()> {
        let revnum = state.revnum;
        if !self.tables.applies(self.svn.path(), revnum) {
            return Ok(());
        }

        let forced = self.tables.forced(revnum);
        if !forced.is_empty() {
            for entry in forced {
                let repo_name = self.tables.repository.clone();
                let txn =
                    self.ensure_transaction_by_name(state, &repo_name, &entry.to, revnum)?;
                txn.note_copy_from_branch(&entry.from, entry.rev, true);
            }
            state.need_commit = true;
            return Ok(());
        }

        if !state.mergeinfo_found {
            return Ok(());
        }
        if self.tables.skip_revisions.contains(&revnum) {
            return Ok(());
        }
        if self.tables.empty_revisions.contains(&revnum) {
            return Ok(());
        }
        // Some form of merge was already recorded during dispatch.
        if state.merge_from_branch.is_some() && state.merge_from_rev.is_some() {
            return Ok(());
        }
        // Stable and releng branches only ever receive cherry-picks.
        let non_stable = state
            .to_branches
            .iter()
            .any(|branch| !branch.starts_with("stable/") && !branch.starts_with("releng/"));
        if !state.to_branches.is_empty() && !non_stable {
            return Ok(());
        }

        let branches: Vec<&str> = state.to_branches.iter().map(String::as_str).collect();
        log::info!(
            "MERGEINFO: rev {revnum} has pure mergeinfo w/o path copies going into {} branches: {}",
            state.to_branches.len(),
            branches.join(" ")
        );
        if state.to_branches.is_empty() {
            log::info!("MONKEYMERGE don't know how to handle empty branches!");
            return Ok(());
        }

        let manual = self.tables.manual(revnum);
        let (parse_ok, mi_list) = if !manual.is_empty() {
            (true, manual.iter().map(|entry| entry.merge_info()).collect())
        } else {
            let raw = self.svn.properties_only_diff(revnum)?;
            match parse_mergeinfo_diff(&raw, &|p| self.match_path_to_branch(p, revnum))? {
                MergeParse::Parsed(list) => (true, list),
                MergeParse::Unparsed(list) => {
                    self.write_mergeinfo_dump(revnum, &raw, &list)?;
                    (false, Vec::new())
                }
            }
        };
        if parse_ok && mi_list.is_empty() {
            // All empty, or a rollback.
            return Ok(());
        }

        if state.transactions.len() != 1 {
            log::info!(
                "MONKEYMERGE not sure how to handle {} transactions over {} branches!",
                state.transactions.len(),
                state.to_branches.len()
            );
            return Ok(());
        }
        if state.to_branches.len() != 1 {
            log::info!(
                "MONKEYMERGE don't know how to handle multiple branches: {}",
                branches.join(" ")
            );
            return Ok(());
        }
        let to = state.to_branches.iter().next().unwrap().clone();
        if to != "master"
            && !to.starts_with("projects/")
            && !to.starts_with("user/")
            && !to.starts_with("vendor/")
            && !to.starts_with("vendor-sys/")
            && !self.tables.allowed_tag_targets.contains(&to)
        {
            log::info!("MONKEYMERGE ignoring merge into {to}");
            return Ok(());
        }
        if !parse_ok {
            log::info!("Couldn't parse mergeinfo!");
            return Ok(());
        }

        log::debug!("Ended up with {mi_list:?}");
        for mi in &mi_list {
            // User branches are full of MFCs and pointless back-and-forth
            // merges; never merge from them.
            if mi.from.starts_with("user") {
                log::info!(
                    "MONKEYMERGE not merging from user, please inspect me: {}",
                    mi.from
                );
                continue;
            }
            log::info!("MONKEYMERGE IS HAPPENING!");
            let key = format!("{}{}", self.tables.repository, mi.to);
            let txn = if state.transactions.contains_key(&key) {
                state.transactions.get_mut(&key).unwrap()
            } else {
                // Exactly one transaction exists at this point.
                state.transactions.values_mut().next().unwrap()
            };
            txn.note_copy_from_branch(&mi.from, mi.rev, true);
        }
        Ok(())
    }

    fn ensure_transaction_by_name<'a>(
        &self,
        state: &'a mut RevisionState,
        repo_name: &str,
        branch: &str,
        revnum: i64,
    ) -> Result<&'a mut Transaction> {
        let key = format!("{repo_name}{branch}");
        if !state.transactions.contains_key(&key) {
            let repo = self
                .repositories
                .get(repo_name)
                .with_context(|| format!("Merge tables reference unknown repository {repo_name}"))?;
            let txn = repo.new_transaction(branch, "", revnum)?;
            state.transactions.insert(key.clone(), txn);
        }
        Ok(state.transactions.get_mut(&key).unwrap())
    }

    fn write_mergeinfo_dump(
        &self,
        revnum: i64,
        raw: &str,
        mi_list: &[crate::mergeinfo::MergeInfo],
    ) -> Result<()> {
        let dir = self.options.target_dir.join("mi");
        std::fs::create_dir_all(&dir)?;
        let svn_log = self.svn.verbose_log(revnum).unwrap_or_default();
        let mut content = String::new();
        content.push_str(raw);
        content.push('\n');
        content.push_str(&svn_log);
        for mi in mi_list {
            content.push_str(&format!(
                "\n {{ {revnum}, {{ {}, {}, {} }} }},",
                mi.from, mi.rev, mi.to
            ));
        }
        content.push('\n');
        std::fs::write(dir.join(format!("r{revnum}.txt")), content)?;
        Ok(())
    }
}

/// Creates (or finds) the transaction for the split's repository and branch.
fn ensure_transaction<'a>(
    state: &'a mut RevisionState,
    repo: &Repository,
    split: &SplitPath,
    revnum: i64,
) -> Result<&'a mut Transaction> {
    let key = format!("{}{}", split.repository, split.branch);
    if !state.transactions.contains_key(&key) {
        let txn = repo.new_transaction(&split.branch, &split.svn_prefix, revnum)?;
        state.transactions.insert(key.clone(), txn);
    }
    Ok(state.transactions.get_mut(&key).unwrap())
}

/// svn:special blobs encode symlinks as `link TARGET`; the 5-byte prefix is
/// stripped and the remainder becomes the blob of a mode-120000 entry.
fn symlink_target(contents: &[u8]) -> Option<&[u8]> {
    contents.strip_prefix(b"link ")
}

/// Turns svn:ignore and svn:global-ignores values into .gitignore content.
/// Patterns with slashes never matched anything in Subversion but would in
/// Git, so they are dropped; plain svn:ignore patterns only apply to direct
/// children and get a leading `/`; runs of asterisks collapse to one.
fn translate_svn_ignore(ignore: Option<&str>, global: Option<&str>) -> Option<String> {
    if ignore.is_none() && global.is_none() {
        return None;
    }
    let mut lines: Vec<String> = Vec::new();
    for line in ignore.unwrap_or("").lines() {
        if line.contains('/') || line.contains('\\') {
            continue;
        }
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            continue;
        }
        lines.push(format!("/{trimmed}"));
    }
    for line in global.unwrap_or("").lines() {
        if line.contains('/') || line.contains('\\') {
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        lines.push(line.to_owned());
    }
    let mut content = lines.join("\n");
    while content.contains("**") {
        content = content.replace("**", "*");
    }
    Some(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::tests::test_repo;
    use crate::rules::Substitution;
    use pretty_assertions::assert_eq;
    use regex::Regex;

    fn export_rule(pattern: &str, repository: &str, branch: &str) -> MatchRule {
        MatchRule {
            lineno: 1,
            min_revision: 0,
            max_revision: -1,
            rx: Regex::new(&format!("^(?:{pattern})")).unwrap(),
            action: RuleAction::Export,
            repository: repository.to_owned(),
            branch: branch.to_owned(),
            prefix: String::new(),
            strip: String::new(),
            repo_substs: Vec::new(),
            branch_substs: Vec::new(),
            annotate: false,
            branchpoint: String::new(),
            deletes: Vec::new(),
            renames: Vec::new(),
        }
    }

    fn test_walker(dir: &std::path::Path, rules: Vec<MatchRule>) -> RevisionWalker {
        let handle = test_repo(dir, "one.git");
        let mut repositories = BTreeMap::new();
        repositories.insert("one.git".to_owned(), Repository::Direct(handle));
        // No real SVN repository behind the walker; the tests below only use
        // the pure helpers.
        let svn_dir = dir.join("svn");
        std::fs::create_dir_all(&svn_dir).unwrap();
        std::fs::write(svn_dir.join("format"), "5\n").unwrap();
        RevisionWalker::new(
            SvnRepo::open(&svn_dir).unwrap(),
            vec![rules],
            repositories,
            IdentityMap::new("localhost"),
            MergeTables::default(),
            Rc::new(Options {
                target_dir: dir.to_path_buf(),
                create_dump: true,
                commit_interval: 25_000,
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_split_path_name_with_captures() {
        let dir = tempfile::tempdir().unwrap();
        let rule = export_rule(r"/stable/(\d+)/", "one.git", "stable/$1");
        let walker = test_walker(dir.path(), vec![rule.clone()]);

        let split = walker.split_path_name(&rule, "/stable/9/lib/libc/gen.c");
        assert_eq!(
            split,
            SplitPath {
                svn_prefix: "/stable/9/".to_owned(),
                repository: "one.git".to_owned(),
                effective_repository: "one.git".to_owned(),
                branch: "stable/9".to_owned(),
                sub_path: "lib/libc/gen.c".to_owned(),
            }
        );
    }

    #[test]
    fn test_split_path_name_prefix_and_strip() {
        let dir = tempfile::tempdir().unwrap();
        let mut rule = export_rule(r"/vendor/foo/", "one.git", "vendor/foo");
        rule.prefix = "contrib/foo/".to_owned();
        rule.strip = "dist/".to_owned();
        let walker = test_walker(dir.path(), vec![rule.clone()]);

        let split = walker.split_path_name(&rule, "/vendor/foo/dist/a.c");
        assert_eq!(split.sub_path, "contrib/foo/a.c");
        // Paths outside the strip prefix keep their layout.
        let split = walker.split_path_name(&rule, "/vendor/foo/other/a.c");
        assert_eq!(split.sub_path, "contrib/foo/other/a.c");
    }

    #[test]
    fn test_split_path_name_substitutions() {
        let dir = tempfile::tempdir().unwrap();
        let mut rule = export_rule(r"/projects/([^/]+)/", "one.git", "projects/$1");
        rule.branch_substs = vec![Substitution::parse("s/%20/ /").unwrap()];
        let walker = test_walker(dir.path(), vec![rule.clone()]);

        let split = walker.split_path_name(&rule, "/projects/foo%20bar/x");
        assert_eq!(split.branch, "projects/foo bar");
    }

    #[test]
    fn test_match_path_to_branch() {
        let dir = tempfile::tempdir().unwrap();
        let rules = vec![
            export_rule(r"/trunk/", "one.git", "master"),
            export_rule(r"/branches/([^/]+)/", "one.git", "$1"),
        ];
        let walker = test_walker(dir.path(), rules);
        assert_eq!(walker.match_path_to_branch("/trunk/", 10), "master");
        assert_eq!(walker.match_path_to_branch("/branches/x/", 10), "x");
        assert_eq!(walker.match_path_to_branch("/elsewhere/", 10), "");
    }

    #[test]
    fn test_symlink_target_strips_the_link_prefix() {
        assert_eq!(
            symlink_target(b"link target/path"),
            Some(b"target/path".as_slice())
        );
        // A svn:special file that is not a symlink stays a plain blob.
        assert_eq!(symlink_target(b"not a link"), None);
        assert_eq!(symlink_target(b"linkage"), None);
    }

    #[test]
    fn test_translate_svn_ignore() {
        assert_eq!(translate_svn_ignore(None, None), None);
        assert_eq!(
            translate_svn_ignore(Some("*.o\nbuild/out\n*.so"), None),
            Some("/*.o\n/*.so".to_owned())
        );
        assert_eq!(
            translate_svn_ignore(None, Some("*.rej\nsub/dir")),
            Some("*.rej".to_owned())
        );
        // Subversion's multi-asterisk patterns mean the same as one asterisk.
        assert_eq!(
            translate_svn_ignore(Some("***.tmp"), None),
            Some("/*.tmp".to_owned())
        );
        assert_eq!(
            translate_svn_ignore(Some("*.o"), Some("*.rej")),
            Some("/*.o\n*.rej".to_owned())
        );
    }
}

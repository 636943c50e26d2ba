//! Derives Git merge parents from svn:mergeinfo property diffs, reconciled
//! with curated override tables.
//!
//! The tables (forced merges, revisions to skip, known-empty mergeinfo and
//! manual patch-ups) are calibration data, loaded from a TOML file rather
//! than compiled in.

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

/// A candidate Git merge parent: `to` gains a parent edge from `from` at
/// `rev`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Deserialize)]
pub struct MergeInfo {
    pub from: String,
    pub rev: i64,
    pub to: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CuratedMerge {
    pub revnum: i64,
    pub from: String,
    pub rev: i64,
    pub to: String,
}

impl CuratedMerge {
    pub fn merge_info(&self) -> MergeInfo {
        MergeInfo {
            from: self.from.clone(),
            rev: self.rev,
            to: self.to.clone(),
        }
    }
}

/// The curated override tables plus the predicate that enables merge
/// inference at all. Without a tables file the predicate is always true and
/// every table is empty.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct MergeTables {
    /// Repository the curated entries apply to; used to find the transaction
    /// of a forced merge.
    pub repository: String,
    /// Only infer merges when the SVN repository path ends with this suffix.
    pub path_suffix: Option<String>,
    /// Only infer merges from this revision onwards.
    pub min_revnum: i64,
    /// Exact tag refs accepted as merge targets besides the branch
    /// namespaces.
    pub allowed_tag_targets: Vec<String>,
    /// Mergeinfo too complex or irrelevant to translate.
    pub skip_revisions: HashSet<i64>,
    /// Mergeinfo known to consist of `-0,0 +0,0` changes only; hardcoded so
    /// the svn child is not forked for them.
    pub empty_revisions: HashSet<i64>,
    /// Merges svn never recorded properly.
    pub force_merges: Vec<CuratedMerge>,
    /// Replacements for mergeinfo the parser cannot be trusted with.
    pub manual_merges: Vec<CuratedMerge>,
}

impl MergeTables {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read merge tables {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Bad merge tables file {}", path.display()))
    }

    /// The enabling predicate for the whole engine.
    pub fn applies(&self, svn_repo_path: &Path, revnum: i64) -> bool {
        if revnum < self.min_revnum {
            return false;
        }
        match &self.path_suffix {
            Some(suffix) => svn_repo_path
                .to_string_lossy()
                .trim_end_matches('/')
                .ends_with(suffix),
            None => true,
        }
    }

    pub fn forced(&self, revnum: i64) -> Vec<&CuratedMerge> {
        self.force_merges
            .iter()
            .filter(|entry| entry.revnum == revnum)
            .collect()
    }

    pub fn manual(&self, revnum: i64) -> Vec<&CuratedMerge> {
        self.manual_merges
            .iter()
            .filter(|entry| entry.revnum == revnum)
            .collect()
    }
}

/// Outcome of the mergeinfo-diff parse.
#[derive(Debug, PartialEq, Eq)]
pub enum MergeParse {
    /// The whole diff was understood; the candidate list may be empty
    /// (empty mergeinfo or an SVN rollback).
    Parsed(Vec<MergeInfo>),
    /// Ambiguous leftovers; the caller dumps the revision for manual triage.
    Unparsed(Vec<MergeInfo>),
}

lazy_static! {
    static ref DEL_MI_RE: Regex = Regex::new(r"(?m)^Deleted: svn:mergeinfo$").unwrap();
    static ref ADD_MI_RE: Regex = Regex::new(r"(?m)^Added: svn:mergeinfo$").unwrap();
    static ref MOD_MI_RE: Regex = Regex::new(r"(?m)^Modified: svn:mergeinfo$").unwrap();
    static ref DEL_MI_EMPTY_RE: Regex =
        Regex::new(r"(?m)^Deleted: svn:mergeinfo\n## -0,0 \+0,0 ##$").unwrap();
    static ref ADD_MI_EMPTY_RE: Regex =
        Regex::new(r"(?m)^Added: svn:mergeinfo\n## -0,0 \+0,0 ##$").unwrap();
    static ref MOD_MI_EMPTY_RE: Regex =
        Regex::new(r"(?m)^Modified: svn:mergeinfo\n## -0,0 \+0,0 ##$").unwrap();
    static ref INDEX_RE: Regex = Regex::new(r"(?m)^Index: ").unwrap();
    static ref PROPERTY_PATH_RE: Regex =
        Regex::new(r"(?m)^Property changes on: (\S+)$").unwrap();
    static ref SECTION_HEADER_RE: Regex =
        Regex::new(r"^(Added|Deleted|Modified): (\S+)$").unwrap();
    static ref HUNK_RE: Regex = Regex::new(r"^## -([0-9,]+) \+([0-9,]+) ##$").unwrap();
    /// Properties whose changes are noise for merge tracking.
    static ref NOISE_PROP_RE: Regex =
        Regex::new(r"^(fbsd|svn):(executable|n?o?keywords|notbinary|eol-style|mime-type)$")
            .unwrap();
    static ref MERGED_RE: Regex =
        Regex::new(r"^   (Merged|Reverse-merged) ([^:]+):r(?:[0-9]+[-,])*([0-9]+)$").unwrap();
}

/// Parses `svn diff --properties-only` output into merge candidates.
///
/// `resolve_branch` translates an SVN path (with surrounding slashes) into a
/// branch name through the rule files; an empty result means the path is not
/// covered by any export rule.
pub fn parse_mergeinfo_diff(
    raw: &str,
    resolve_branch: &dyn Fn(&str) -> String,
) -> Result<MergeParse> {
    let result = raw.replace("\\ No newline at end of property\n", "");

    let del_mi = DEL_MI_RE.find_iter(&result).count();
    let add_mi = ADD_MI_RE.find_iter(&result).count();
    let mod_mi = MOD_MI_RE.find_iter(&result).count();
    let del_mi_empty = DEL_MI_EMPTY_RE.find_iter(&result).count();
    let add_mi_empty = ADD_MI_EMPTY_RE.find_iter(&result).count();
    let mod_mi_empty = MOD_MI_EMPTY_RE.find_iter(&result).count();

    if del_mi + add_mi + mod_mi == 0 {
        bail!("Something went wrong parsing the mergeinfo!");
    }
    if del_mi == del_mi_empty && add_mi == add_mi_empty && mod_mi == mod_mi_empty {
        log::debug!("Skipping fully empty mergeinfo");
        return Ok(MergeParse::Parsed(Vec::new()));
    }
    if del_mi > 0 && add_mi == 0 && mod_mi == 0 {
        log::debug!("Skipping delete-only ({del_mi}) mergeinfo");
        return Ok(MergeParse::Parsed(Vec::new()));
    }

    let mut mi_list: Vec<MergeInfo> = Vec::new();
    let mut unparsed = false;

    let block_starts: Vec<usize> = INDEX_RE.find_iter(&result).map(|m| m.start()).collect();
    if block_starts.is_empty() || !result[..block_starts[0]].trim().is_empty() {
        unparsed = true;
    }
    for (idx, &start) in block_starts.iter().enumerate() {
        let end = block_starts
            .get(idx + 1)
            .copied()
            .unwrap_or(result.len());
        let block = &result[start..end];
        match classify_block(block) {
            BlockKind::Ignorable => {}
            BlockKind::Merges(found) => {
                for (direction, from_path, rev) in found {
                    if direction == "Reverse-merged" {
                        log::debug!("Ignoring SVN rollback via mergeinfo");
                        continue;
                    }
                    let block_path = PROPERTY_PATH_RE
                        .captures(block)
                        .map(|caps| caps[1].to_owned())
                        .unwrap_or_default();
                    let to_path = format!("/{block_path}/");
                    let from_with_slash = format!("{from_path}/");
                    let mi = MergeInfo {
                        from: resolve_branch(&from_with_slash),
                        rev,
                        to: resolve_branch(&to_path),
                    };
                    if mi.from.is_empty() || mi.to.is_empty() {
                        log::debug!(
                            "Couldn't parse mergeinfo via rules file for {from_with_slash} or {to_path}"
                        );
                        unparsed = true;
                        continue;
                    }
                    log::debug!("mergeinfo {} {} -> {}", mi.from, mi.rev, mi.to);
                    merge_highest_rev(&mut mi_list, mi);
                }
            }
            BlockKind::Unparsed => unparsed = true,
        }
    }

    mi_list.sort();
    if !unparsed {
        if mi_list.len() <= 1 {
            // An empty but fully understood parse is an SVN rollback.
            return Ok(MergeParse::Parsed(mi_list));
        }
        // Set-merges are only trusted when all targets agree: either
        // everything goes into master (vendor suite imports) or everything
        // goes into a clang import branch.
        let all_master = mi_list.iter().all(|mi| mi.to == "master");
        let all_clang_import = mi_list
            .iter()
            .all(|mi| mi.to.starts_with("projects/clang") && mi.to.ends_with("-import"));
        if all_master || all_clang_import {
            return Ok(MergeParse::Parsed(mi_list));
        }
    }
    if mi_list.len() > 1 {
        log::debug!("Got {} different matches: {mi_list:?}", mi_list.len());
    }
    Ok(MergeParse::Unparsed(mi_list))
}

/// Sometimes multiple pairs of from/to arrive with different revisions; the
/// highest revision wins.
fn merge_highest_rev(mi_list: &mut Vec<MergeInfo>, mi: MergeInfo) {
    for existing in mi_list.iter_mut() {
        if existing.from == mi.from && existing.to == mi.to {
            if existing.rev < mi.rev {
                existing.rev = mi.rev;
            }
            return;
        }
    }
    mi_list.push(mi);
}

enum BlockKind {
    Ignorable,
    Merges(Vec<(String, String, i64)>),
    Unparsed,
}

/// Classifies one `Index:` block of the property diff. A block is ignorable
/// when every property section is either a noise property change or an empty
/// mergeinfo add/delete; mergeinfo sections with exactly one
/// Merged/Reverse-merged line become candidates. Anything else makes the
/// block unparsed.
fn classify_block(block: &str) -> BlockKind {
    let mut lines = block.lines().peekable();

    // Header: Index, separator, ---, +++, blank, "Property changes on:",
    // underscore separator.
    if lines.next().is_none_or(|line| !line.starts_with("Index: ")) {
        return BlockKind::Unparsed;
    }
    if lines.next().is_none_or(|line| !line.starts_with("===")) {
        return BlockKind::Unparsed;
    }
    for marker in ["--- ", "+++ "] {
        if lines.next().is_none_or(|line| !line.starts_with(marker)) {
            return BlockKind::Unparsed;
        }
    }
    loop {
        match lines.peek() {
            Some(line) if line.trim().is_empty() => {
                lines.next();
            }
            _ => break,
        }
    }
    if lines
        .next()
        .is_none_or(|line| !line.starts_with("Property changes on: "))
    {
        return BlockKind::Unparsed;
    }
    if lines.next().is_none_or(|line| !line.starts_with("___")) {
        return BlockKind::Unparsed;
    }

    let mut merges = Vec::new();
    let mut all_understood = true;

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }
        let Some(header) = SECTION_HEADER_RE.captures(line) else {
            all_understood = false;
            continue;
        };
        let kind = header[1].to_owned();
        let prop = header[2].to_owned();
        let Some(hunk) = lines.next().and_then(|line| HUNK_RE.captures(line)) else {
            all_understood = false;
            continue;
        };
        let hunk_old = hunk[1].to_owned();
        let hunk_new = hunk[2].to_owned();

        let mut values: Vec<&str> = Vec::new();
        while let Some(next) = lines.peek() {
            if next.trim().is_empty() || SECTION_HEADER_RE.is_match(next) {
                break;
            }
            values.push(lines.next().unwrap());
        }

        if NOISE_PROP_RE.is_match(&prop) {
            let plain_diff_lines = !values.is_empty()
                && values.len() <= 2
                && values
                    .iter()
                    .all(|value| value.starts_with('+') || value.starts_with('-'));
            if plain_diff_lines {
                continue;
            }
            all_understood = false;
        } else if prop == "svn:mergeinfo" {
            if (kind == "Added" || kind == "Deleted")
                && hunk_old == "0,0"
                && hunk_new == "0,0"
                && values.is_empty()
            {
                // Empty mergeinfo records appear and disappear with local
                // copies; nothing to translate.
                continue;
            }
            let simple_hunk = matches!(hunk_old.as_str(), "0,0" | "0,1")
                && matches!(hunk_new.as_str(), "0,0" | "0,1");
            if (kind == "Modified" || kind == "Added") && simple_hunk && values.len() == 1 {
                if let Some(caps) = MERGED_RE.captures(values[0]) {
                    merges.push((
                        caps[1].to_owned(),
                        caps[2].to_owned(),
                        caps[3].parse().unwrap_or(0),
                    ));
                    continue;
                }
            }
            all_understood = false;
        } else {
            all_understood = false;
        }
    }

    if !all_understood {
        BlockKind::Unparsed
    } else if merges.is_empty() {
        BlockKind::Ignorable
    } else {
        BlockKind::Merges(merges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn resolver(path: &str) -> String {
        match path {
            "/trunk/" => "master".to_owned(),
            "/branches/x/" => "x".to_owned(),
            "/vendor/foo/dist/" => "vendor/foo/dist".to_owned(),
            _ => String::new(),
        }
    }

    fn block(path: &str, section: &str) -> String {
        format!(
            "Index: {path}\n\
             ===================================================================\n\
             --- {path}\t(revision 199)\n\
             +++ {path}\t(revision 200)\n\
             \n\
             Property changes on: {path}\n\
             ___________________________________________________________________\n\
             {section}\n"
        )
    }

    #[test]
    fn test_single_merged_block() {
        let diff = block(
            "trunk",
            "Modified: svn:mergeinfo\n## -0,0 +0,1 ##\n   Merged /branches/x:r101",
        );
        let parsed = parse_mergeinfo_diff(&diff, &resolver).unwrap();
        assert_eq!(
            parsed,
            MergeParse::Parsed(vec![MergeInfo {
                from: "x".to_owned(),
                rev: 101,
                to: "master".to_owned(),
            }])
        );
    }

    #[test]
    fn test_merged_revision_ranges_use_the_last() {
        let diff = block(
            "trunk",
            "Modified: svn:mergeinfo\n## -0,1 +0,1 ##\n   Merged /branches/x:r90-95,101",
        );
        let MergeParse::Parsed(list) = parse_mergeinfo_diff(&diff, &resolver).unwrap() else {
            panic!("expected a clean parse");
        };
        assert_eq!(list[0].rev, 101);
    }

    #[test]
    fn test_reverse_merged_is_a_rollback() {
        let diff = block(
            "trunk",
            "Modified: svn:mergeinfo\n## -0,1 +0,1 ##\n   Reverse-merged /branches/x:r101",
        );
        assert_eq!(
            parse_mergeinfo_diff(&diff, &resolver).unwrap(),
            MergeParse::Parsed(vec![])
        );
    }

    #[test]
    fn test_noise_properties_are_stripped() {
        let noise = block(
            "trunk/foo.c",
            "Deleted: svn:keywords\n## -1 +0,0 ##\n- FreeBSD=%H",
        );
        let merged = block(
            "trunk",
            "Modified: svn:mergeinfo\n## -0,0 +0,1 ##\n   Merged /branches/x:r101",
        );
        let diff = format!("{noise}{merged}");
        let MergeParse::Parsed(list) = parse_mergeinfo_diff(&diff, &resolver).unwrap() else {
            panic!("expected a clean parse");
        };
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_fully_empty_mergeinfo() {
        let diff = block("trunk", "Added: svn:mergeinfo\n## -0,0 +0,0 ##");
        assert_eq!(
            parse_mergeinfo_diff(&diff, &resolver).unwrap(),
            MergeParse::Parsed(vec![])
        );
    }

    #[test]
    fn test_delete_only_mergeinfo() {
        let diff = block("trunk", "Deleted: svn:mergeinfo\n## -0,1 +0,0 ##\n   Merged /branches/x:r5");
        assert_eq!(
            parse_mergeinfo_diff(&diff, &resolver).unwrap(),
            MergeParse::Parsed(vec![])
        );
    }

    #[test]
    fn test_no_mergeinfo_headers_is_an_error() {
        assert!(parse_mergeinfo_diff("random text\n", &resolver).is_err());
    }

    #[test]
    fn test_unresolvable_path_fails_the_parse() {
        let diff = block(
            "unknown/place",
            "Modified: svn:mergeinfo\n## -0,0 +0,1 ##\n   Merged /branches/x:r101",
        );
        let MergeParse::Unparsed(list) = parse_mergeinfo_diff(&diff, &resolver).unwrap() else {
            panic!("expected an unparsed result");
        };
        assert!(list.is_empty());
    }

    #[test]
    fn test_duplicate_edges_keep_the_higher_revision() {
        let first = block(
            "trunk",
            "Modified: svn:mergeinfo\n## -0,1 +0,1 ##\n   Merged /branches/x:r90",
        );
        let second = block(
            "trunk",
            "Modified: svn:mergeinfo\n## -0,1 +0,1 ##\n   Merged /branches/x:r101",
        );
        let diff = format!("{first}{second}");
        let MergeParse::Parsed(list) = parse_mergeinfo_diff(&diff, &resolver).unwrap() else {
            panic!("expected a clean parse");
        };
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].rev, 101);
    }

    #[test]
    fn test_multiple_targets_must_agree() {
        let to_master = block(
            "trunk",
            "Modified: svn:mergeinfo\n## -0,1 +0,1 ##\n   Merged /vendor/foo/dist:r90",
        );
        let to_x = block(
            "branches/x",
            "Modified: svn:mergeinfo\n## -0,1 +0,1 ##\n   Merged /trunk:r95",
        );
        let diff = format!("{to_master}{to_x}");
        let MergeParse::Unparsed(list) = parse_mergeinfo_diff(&diff, &resolver).unwrap() else {
            panic!("expected an unparsed result");
        };
        assert_eq!(list.len(), 2);

        // Both into master is acceptable.
        let other = block(
            "trunk",
            "Modified: svn:mergeinfo\n## -0,1 +0,1 ##\n   Merged /branches/x:r95",
        );
        let diff = format!("{to_master}{other}");
        let MergeParse::Parsed(list) = parse_mergeinfo_diff(&diff, &resolver).unwrap() else {
            panic!("expected a clean parse");
        };
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_tables_load_and_apply() {
        let toml_text = r#"
repository = "freebsd-base.git"
path-suffix = "base"
min-revnum = 179447
allowed-tag-targets = ["refs/tags/release/9.0.0"]
skip-revisions = [196075, 179468]
empty-revisions = [179566]

[[force-merges]]
revnum = 264691
from = "vendor/openssh/dist"
rev = 264690
to = "master"

[[manual-merges]]
revnum = 181413
from = "vendor/tzdata/dist"
rev = 181403
to = "master"
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merges.toml");
        std::fs::write(&path, toml_text).unwrap();
        let tables = MergeTables::load(&path).unwrap();

        assert!(tables.applies(Path::new("/svn/base"), 200_000));
        assert!(!tables.applies(Path::new("/svn/base"), 100));
        assert!(!tables.applies(Path::new("/svn/doc"), 200_000));
        assert!(tables.skip_revisions.contains(&196_075));
        assert_eq!(tables.forced(264_691).len(), 1);
        assert_eq!(tables.forced(1).len(), 0);
        assert_eq!(tables.manual(181_413)[0].rev, 181_403);

        // No tables file at all: engine enabled, everything empty.
        let default = MergeTables::default();
        assert!(default.applies(Path::new("/anything"), 1));
        assert!(default.forced(264_691).is_empty());
    }
}

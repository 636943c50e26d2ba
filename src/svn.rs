//! Read access to a local Subversion repository through the standard
//! `svnlook` and `svn` binaries.
//!
//! Paths are kept in the SVN filesystem convention with a leading `/` and no
//! trailing slash; the trailing-slash markers of `svnlook` output are turned
//! into an explicit directory flag.

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use bstr::BString;
use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use crate::util::CommandExtension as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    None,
    File,
    Dir,
}

/// One entry of the per-revision change list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub kind: ChangeKind,
    pub prop_mod: bool,
    pub is_dir: bool,
    /// `(source path, source revision)` when the path was copied.
    pub copy_from: Option<(String, i64)>,
}

/// Revision properties needed for a commit.
#[derive(Debug, Clone)]
pub struct RevProps {
    pub author: Option<String>,
    pub log: BString,
    pub epoch: u64,
}

#[derive(Debug)]
pub struct SvnRepo {
    path: PathBuf,
    url: String,
}

impl SvnRepo {
    pub fn open(path: &Path) -> Result<Self> {
        let path = std::path::absolute(path)
            .with_context(|| format!("Bad repository path {}", path.display()))?;
        if !path.join("format").is_file() {
            bail!("{} does not look like a Subversion repository", path.display());
        }
        let url = format!("file://{}", path.display());
        Ok(SvnRepo { path, url })
    }

    /// `file://` URL of the repository root, for the `svn` commands that do
    /// not take a repository path.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn svnlook(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut cmd = Command::new("svnlook");
        cmd.args(args).arg(&self.path);
        Ok(cmd.checked_output()?.stdout)
    }

    fn svnlook_path(&self, args: &[&str], path: &str) -> Result<Vec<u8>> {
        let mut cmd = Command::new("svnlook");
        cmd.args(args).arg(&self.path).arg(in_repo_path(path));
        Ok(cmd.checked_output()?.stdout)
    }

    pub fn youngest_revision(&self) -> Result<i64> {
        let out = self.svnlook(&["youngest"])?;
        String::from_utf8_lossy(&out)
            .trim()
            .parse()
            .context("Could not parse `svnlook youngest` output")
    }

    /// The paths changed in `revnum`, with copy sources, sorted
    /// lexicographically by path.
    pub fn paths_changed(&self, revnum: i64) -> Result<BTreeMap<String, PathChange>> {
        let out = self.svnlook(&["changed", "--copy-info", "-r", &revnum.to_string()])?;
        parse_changed_output(&String::from_utf8_lossy(&out))
            .with_context(|| format!("Bad `svnlook changed` output for r{revnum}"))
    }

    pub fn rev_props(&self, revnum: i64) -> Result<RevProps> {
        let author = self.rev_prop(revnum, "svn:author")?.map(|value| {
            let text = String::from_utf8_lossy(&value);
            crate::util::trim_newline_suffix(&text).to_owned()
        });
        let log = BString::from(self.rev_prop(revnum, "svn:log")?.unwrap_or_default());
        let epoch = match self.rev_prop(revnum, "svn:date")? {
            Some(date) => parse_svn_date(String::from_utf8_lossy(&date).trim())?,
            None => 0,
        };
        Ok(RevProps { author, log, epoch })
    }

    fn rev_prop(&self, revnum: i64, name: &str) -> Result<Option<Vec<u8>>> {
        let output = Command::new("svnlook")
            .args(["propget", "--revprop", "-r", &revnum.to_string()])
            .arg(&self.path)
            .arg(name)
            .output()
            .context("Failed to run svnlook propget")?;
        if output.status.success() {
            Ok(Some(output.stdout))
        } else {
            // svnlook fails when the property is not set on the revision.
            Ok(None)
        }
    }

    /// A node property at `revnum`, or None when unset or the path is gone.
    pub fn node_prop(&self, revnum: i64, path: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let output = Command::new("svnlook")
            .args(["propget", "-r", &revnum.to_string()])
            .arg(&self.path)
            .arg(name)
            .arg(in_repo_path(path))
            .output()
            .context("Failed to run svnlook propget")?;
        if output.status.success() {
            Ok(Some(output.stdout))
        } else {
            Ok(None)
        }
    }

    pub fn node_proplist(&self, revnum: i64, path: &str) -> Result<Vec<String>> {
        let out = self.svnlook_path(&["proplist", "-r", &revnum.to_string()], path)?;
        Ok(String::from_utf8_lossy(&out)
            .lines()
            .map(|line| line.trim().to_owned())
            .filter(|line| !line.is_empty())
            .collect())
    }

    pub fn check_path(&self, revnum: i64, path: &str) -> Result<NodeKind> {
        let output = Command::new("svnlook")
            .args(["tree", "--non-recursive", "-r", &revnum.to_string()])
            .arg(&self.path)
            .arg(in_repo_path(path))
            .output()
            .context("Failed to run svnlook tree")?;
        if !output.status.success() {
            return Ok(NodeKind::None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().next() {
            Some(first) if first.ends_with('/') => Ok(NodeKind::Dir),
            Some(_) => Ok(NodeKind::File),
            None => Ok(NodeKind::None),
        }
    }

    pub fn is_dir(&self, revnum: i64, path: &str) -> Result<bool> {
        Ok(self.check_path(revnum, path)? == NodeKind::Dir)
    }

    /// Direct children of a directory, sorted by name.
    pub fn dir_entries(&self, revnum: i64, path: &str) -> Result<Vec<(String, NodeKind)>> {
        let out = self.svnlook_path(&["tree", "--non-recursive", "-r", &revnum.to_string()], path)?;
        Ok(parse_tree_entries(&String::from_utf8_lossy(&out)))
    }

    pub fn file_length(&self, revnum: i64, path: &str) -> Result<u64> {
        let out = self.svnlook_path(&["filesize", "-r", &revnum.to_string()], path)?;
        String::from_utf8_lossy(&out)
            .trim()
            .parse()
            .with_context(|| format!("Could not parse `svnlook filesize` for {path}"))
    }

    pub fn file_contents(&self, revnum: i64, path: &str) -> Result<Vec<u8>> {
        self.svnlook_path(&["cat", "-r", &revnum.to_string()], path)
    }

    /// True when the svn:mergeinfo property of `path` differs between
    /// `revnum - 1` and `revnum`.
    pub fn mergeinfo_changed(&self, revnum: i64, path: &str) -> Result<bool> {
        let before = self.node_prop(revnum - 1, path, "svn:mergeinfo")?;
        let after = self.node_prop(revnum, path, "svn:mergeinfo")?;
        Ok(before != after)
    }

    /// `svn diff -c REV --properties-only` over the whole repository.
    pub fn properties_only_diff(&self, revnum: i64) -> Result<String> {
        let out = Command::new("svn")
            .args([
                "diff",
                "-c",
                &revnum.to_string(),
                "--properties-only",
                "--non-interactive",
                &self.url,
            ])
            .checked_output()?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// `svn log -vc REV`, used for the mergeinfo triage dumps.
    pub fn verbose_log(&self, revnum: i64) -> Result<String> {
        let out = Command::new("svn")
            .args([
                "log",
                "-vc",
                &revnum.to_string(),
                "--non-interactive",
                &self.url,
            ])
            .checked_output()?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// svnlook wants repository paths without the leading slash.
fn in_repo_path(path: &str) -> &str {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

/// Parses `svnlook changed --copy-info` output. Lines carry a three-column
/// status (`A`/`D`/`U`/`R`/`_`, property flag, copy flag) and indented
/// `(from PATH:rREV)` continuation lines attach the copy source to the
/// preceding path.
fn parse_changed_output(output: &str) -> Result<BTreeMap<String, PathChange>> {
    let mut map: BTreeMap<String, PathChange> = BTreeMap::new();
    let mut last_path: Option<String> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(rest) = line.trim_start().strip_prefix("(from ") {
            let rest = rest
                .strip_suffix(')')
                .with_context(|| format!("Bad copy-info line {line:?}"))?;
            let (path, rev) = rest
                .rsplit_once(":r")
                .with_context(|| format!("Bad copy-info line {line:?}"))?;
            let source = format!("/{}", path.trim_end_matches('/'));
            let rev: i64 = rev
                .parse()
                .with_context(|| format!("Bad copy-info revision in {line:?}"))?;
            let target = last_path
                .as_ref()
                .with_context(|| format!("Copy-info line {line:?} without a change line"))?;
            map.get_mut(target)
                .expect("change recorded for preceding line")
                .copy_from = Some((source, rev));
            continue;
        }
        if line.len() < 5 {
            bail!("Short change line {line:?}");
        }
        let status: Vec<char> = line[..4].chars().collect();
        let raw_path = &line[4..];
        let kind = match status[0] {
            'A' => ChangeKind::Add,
            'D' => ChangeKind::Delete,
            'R' => ChangeKind::Replace,
            'U' | '_' => ChangeKind::Modify,
            other => bail!("Unknown change action {other:?} in {line:?}"),
        };
        let change = PathChange {
            kind,
            prop_mod: status[1] == 'U',
            is_dir: raw_path.ends_with('/'),
            copy_from: None,
        };
        let path = format!("/{}", raw_path.trim_end_matches('/'));
        last_path = Some(path.clone());
        if map.insert(path, change).is_some() {
            // If the same path is deleted and added we would have to order the
            // deletion first; this has never been observed from svnlook.
            bail!("Duplicate path {raw_path:?} in change list");
        }
    }
    Ok(map)
}

/// Parses one level of `svnlook tree --non-recursive` output into child
/// entries sorted by name.
fn parse_tree_entries(output: &str) -> Vec<(String, NodeKind)> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let name = line.trim_start();
            if name.is_empty() {
                return None;
            }
            if let Some(dir) = name.strip_suffix('/') {
                Some((dir.to_owned(), NodeKind::Dir))
            } else {
                Some((name.to_owned(), NodeKind::File))
            }
        })
        .collect()
}

/// Parses an `svn:date` value (ISO-8601, UTC) into epoch seconds.
pub fn parse_svn_date(date: &str) -> Result<u64> {
    let naive = chrono::NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S%.fZ")
        .with_context(|| format!("Bad svn:date value {date:?}"))?;
    let epoch = naive.and_utc().timestamp();
    Ok(epoch.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_changed_output() {
        let output = "\
U   trunk/a.txt
_U  trunk/props.txt
UU  trunk/both.txt
A + branches/x/
    (from trunk/:r100)
D   old.txt
A   trunk/new/
";
        let map = parse_changed_output(output).unwrap();
        assert_eq!(map.len(), 6);
        assert_eq!(
            map["/trunk/a.txt"],
            PathChange {
                kind: ChangeKind::Modify,
                prop_mod: false,
                is_dir: false,
                copy_from: None,
            }
        );
        assert!(map["/trunk/props.txt"].prop_mod);
        assert!(map["/trunk/both.txt"].prop_mod);
        assert_eq!(
            map["/branches/x"],
            PathChange {
                kind: ChangeKind::Add,
                prop_mod: false,
                is_dir: true,
                copy_from: Some(("/trunk".to_owned(), 100)),
            }
        );
        assert_eq!(map["/old.txt"].kind, ChangeKind::Delete);
        assert!(map["/trunk/new"].is_dir);
        // BTreeMap iteration is sorted by path.
        let paths: Vec<&String> = map.keys().collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn test_parse_changed_rejects_duplicates() {
        let output = "U   trunk/a.txt\nU   trunk/a.txt\n";
        assert!(parse_changed_output(output).is_err());
    }

    #[test]
    fn test_parse_tree_entries() {
        let output = "\
trunk/
 sub/
 README
 a.txt
";
        assert_eq!(
            parse_tree_entries(output),
            vec![
                ("sub".to_owned(), NodeKind::Dir),
                ("README".to_owned(), NodeKind::File),
                ("a.txt".to_owned(), NodeKind::File),
            ]
        );
    }

    #[rstest::rstest]
    #[case("1970-01-01T00:01:00.000000Z", 60)]
    #[case("2007-05-06T12:00:00.123456Z", 1_178_452_800)]
    #[case("2007-05-06T12:00:00Z", 1_178_452_800)]
    fn test_parse_svn_date(#[case] date: &str, #[case] expected: u64) {
        assert_eq!(parse_svn_date(date).unwrap(), expected);
    }

    #[test]
    fn test_parse_svn_date_rejects_garbage() {
        assert!(parse_svn_date("yesterday").is_err());
    }
}

//! Rule files map SVN paths and revision windows to target repositories,
//! branches and on-branch subpaths.
//!
//! A file holds `create repository` blocks declaring the targets and ordered
//! `match` blocks. The first match wins; capture groups of the match pattern
//! may be referenced as `$1`, `$2`, ... in the `repository`, `branch` and
//! `prefix` templates.

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use regex::Regex;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Export,
    Ignore,
    Recurse,
}

/// A `s/PATTERN/REPLACEMENT/` command applied to an expanded template.
#[derive(Debug, Clone)]
pub struct Substitution {
    pattern: Regex,
    replacement: String,
}

impl Substitution {
    pub fn parse(spec: &str) -> Result<Self> {
        let rest = spec
            .strip_prefix("s/")
            .with_context(|| format!("Substitution {spec:?} must look like s/PATTERN/REPL/"))?;
        let rest = rest
            .strip_suffix('/')
            .with_context(|| format!("Substitution {spec:?} must end with /"))?;
        let Some((pattern, replacement)) = rest.split_once('/') else {
            bail!("Substitution {spec:?} must look like s/PATTERN/REPL/");
        };
        Ok(Substitution {
            pattern: Regex::new(pattern)
                .with_context(|| format!("Bad substitution pattern {pattern:?}"))?,
            replacement: replacement.to_owned(),
        })
    }

    pub fn apply(&self, value: &mut String) {
        *value = self
            .pattern
            .replace(value, self.replacement.as_str())
            .into_owned();
    }
}

#[derive(Debug, Clone)]
pub struct MatchRule {
    /// 1-based line of the `match` keyword, for diagnostics.
    pub lineno: usize,
    pub min_revision: i64,
    /// -1 means unbounded.
    pub max_revision: i64,
    /// Anchored at the start of the SVN path.
    pub rx: Regex,
    pub action: RuleAction,
    pub repository: String,
    pub branch: String,
    pub prefix: String,
    pub strip: String,
    pub repo_substs: Vec<Substitution>,
    pub branch_substs: Vec<Substitution>,
    pub annotate: bool,
    /// Branch-parent override DSL: empty, `none`, `none@<treehash>` or
    /// `<branch>@<revnum>`.
    pub branchpoint: String,
    pub deletes: Vec<String>,
    pub renames: Vec<(String, String)>,
}

impl MatchRule {
    pub fn info(&self) -> String {
        format!("rule {} (line {})", self.rx.as_str(), self.lineno)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RepoDecl {
    pub name: String,
    /// Non-empty makes this repository a forwarding view of another target.
    pub forward_to: String,
    /// Path prefix applied by the forwarding view.
    pub prefix: String,
    pub description: String,
    /// Branches known to exist up front; commits may still create others.
    pub branches: Vec<String>,
}

/// One parsed rule file: repository declarations plus an ordered match list.
#[derive(Debug, Default)]
pub struct Rules {
    pub repositories: Vec<RepoDecl>,
    pub matches: Vec<MatchRule>,
}

/// Masks for [`find_match_rule`], used when the caller must not resolve to an
/// Ignore or Recurse rule (e.g. looking up the source of a copy).
pub const ANY_RULE: u8 = 0;
pub const NO_IGNORE_RULE: u8 = 0x01;
pub const NO_RECURSE_RULE: u8 = 0x02;

/// Returns the first rule matching `current` at `revnum`, honoring the rule
/// order of the file.
pub fn find_match_rule<'a>(
    rules: &'a [MatchRule],
    revnum: i64,
    current: &str,
    rule_mask: u8,
) -> Option<&'a MatchRule> {
    rules.iter().find(|rule| {
        if rule.min_revision > revnum {
            return false;
        }
        if rule.max_revision != -1 && rule.max_revision < revnum {
            return false;
        }
        if rule.action == RuleAction::Ignore && rule_mask & NO_IGNORE_RULE != 0 {
            return false;
        }
        if rule.action == RuleAction::Recurse && rule_mask & NO_RECURSE_RULE != 0 {
            return false;
        }
        rule.rx.find(current).is_some_and(|m| m.start() == 0)
    })
}

pub fn load(path: &Path) -> Result<Rules> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read rule file {}", path.display()))?;
    parse(&content).with_context(|| format!("In rule file {}", path.display()))
}

fn parse(content: &str) -> Result<Rules> {
    let mut rules = Rules::default();
    let mut lines = content.lines().enumerate().peekable();

    while let Some((lineno, raw)) = lines.next() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix("create repository ") {
            let mut decl = RepoDecl {
                name: name.trim().to_owned(),
                ..Default::default()
            };
            parse_repository_block(&mut lines, &mut decl)
                .with_context(|| format!("In repository block at line {}", lineno + 1))?;
            rules.repositories.push(decl);
        } else if let Some(pattern) = line.strip_prefix("match ") {
            let rule = parse_match_block(&mut lines, lineno + 1, pattern.trim())
                .with_context(|| format!("In match block at line {}", lineno + 1))?;
            rules.matches.push(rule);
        } else {
            bail!("line {}: unexpected {:?}", lineno + 1, line);
        }
    }
    Ok(rules)
}

fn parse_repository_block<'a>(
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
    decl: &mut RepoDecl,
) -> Result<()> {
    for (lineno, raw) in lines {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "end repository" {
            return Ok(());
        }
        if let Some(value) = line.strip_prefix("forward-to ") {
            decl.forward_to = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("prefix ") {
            decl.prefix = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("description ") {
            decl.description = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("branch ") {
            decl.branches.push(value.trim().to_owned());
        } else {
            bail!("line {}: unexpected {:?} in repository block", lineno + 1, line);
        }
    }
    bail!("missing \"end repository\"");
}

fn parse_match_block<'a>(
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
    start_lineno: usize,
    pattern: &str,
) -> Result<MatchRule> {
    // Anchor the pattern without disturbing the capture group numbering.
    let rx = Regex::new(&format!("^(?:{pattern})"))
        .with_context(|| format!("Bad match pattern {pattern:?}"))?;
    let mut rule = MatchRule {
        lineno: start_lineno,
        min_revision: 0,
        max_revision: -1,
        rx,
        action: RuleAction::Export,
        repository: String::new(),
        branch: String::new(),
        prefix: String::new(),
        strip: String::new(),
        repo_substs: Vec::new(),
        branch_substs: Vec::new(),
        annotate: false,
        branchpoint: String::new(),
        deletes: Vec::new(),
        renames: Vec::new(),
    };
    let mut action_seen = false;

    for (lineno, raw) in lines {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "end match" {
            if !action_seen && rule.repository.is_empty() {
                bail!("match block needs a repository or an explicit action");
            }
            if rule.action == RuleAction::Export
                && (rule.repository.is_empty() || rule.branch.is_empty())
            {
                bail!("export rules need both a repository and a branch");
            }
            return Ok(rule);
        }
        if let Some(value) = line.strip_prefix("min revision ") {
            rule.min_revision = value.trim().parse().context("Bad min revision")?;
        } else if let Some(value) = line.strip_prefix("max revision ") {
            rule.max_revision = value.trim().parse().context("Bad max revision")?;
        } else if let Some(value) = line.strip_prefix("repository ") {
            rule.repository = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("branch ") {
            rule.branch = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("prefix ") {
            rule.prefix = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("strip ") {
            rule.strip = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("substitute repository ") {
            rule.repo_substs.push(Substitution::parse(value.trim())?);
        } else if let Some(value) = line.strip_prefix("substitute branch ") {
            rule.branch_substs.push(Substitution::parse(value.trim())?);
        } else if let Some(value) = line.strip_prefix("action ") {
            action_seen = true;
            rule.action = match value.trim() {
                "export" => RuleAction::Export,
                "ignore" => RuleAction::Ignore,
                "recurse" => RuleAction::Recurse,
                other => bail!("line {}: unknown action {:?}", lineno + 1, other),
            };
        } else if let Some(value) = line.strip_prefix("annotated ") {
            rule.annotate = value.trim() == "true";
        } else if let Some(value) = line.strip_prefix("branchpoint ") {
            rule.branchpoint = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("delete ") {
            rule.deletes.push(value.trim().to_owned());
        } else if let Some(value) = line.strip_prefix("rename ") {
            let Some((from, to)) = value.trim().split_once(' ') else {
                bail!("line {}: rename needs FROM and TO", lineno + 1);
            };
            rule.renames.push((from.to_owned(), to.trim().to_owned()));
        } else {
            bail!("line {}: unexpected {:?} in match block", lineno + 1, line);
        }
    }
    bail!("missing \"end match\"");
}

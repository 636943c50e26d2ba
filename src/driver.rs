//! The outer conversion loop: build the targets from the rule files,
//! negotiate the resume point, replay every revision, then finalise tags and
//! shut the fast-import children down.

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::rc::Rc;

use crate::cli::Cli;
use crate::cli::Options;
use crate::exporter::RevisionWalker;
use crate::fast_import::MAX_SIMULTANEOUS_PROCESSES;
use crate::fast_import::ProcessCache;
use crate::fast_import::ProcessCacheHandle;
use crate::identities::IdentityMap;
use crate::mergeinfo::MergeTables;
use crate::repository::FastImportRepository;
use crate::repository::Repository;
use crate::rules;
use crate::rules::RepoDecl;
use crate::svn::SvnRepo;

pub fn run(cli: &Cli) -> Result<()> {
    let options = Options::from_cli(cli);

    let mut rule_lists = Vec::new();
    let mut decls: Vec<RepoDecl> = Vec::new();
    for path in &cli.rules {
        let rules = rules::load(path)?;
        for decl in rules.repositories {
            if decls.iter().any(|existing| existing.name == decl.name) {
                bail!("Repository {} is declared more than once", decl.name);
            }
            decls.push(decl);
        }
        rule_lists.push(rules.matches);
    }
    if decls.is_empty() {
        bail!("No repositories declared in the rule files");
    }

    let svn = SvnRepo::open(&cli.svn_repo)?;

    let identities = match &cli.identity_map {
        Some(path) => IdentityMap::load(path, &cli.identity_domain)?,
        None => IdentityMap::new(&cli.identity_domain),
    };
    let tables = match &cli.merge_tables {
        Some(path) => MergeTables::load(path)?,
        None => MergeTables::default(),
    };

    let cache = ProcessCache::new(MAX_SIMULTANEOUS_PROCESSES);

    // Negotiate the resume point. A corrupt log tail in one target lowers the
    // cutoff for everyone; in that case all logs are restored from their .old
    // backups and the scan repeats until every target agrees.
    let mut cutoff = cli.resume_from.unwrap_or(i64::MAX);
    let (repositories, start) = loop {
        let repositories = build_repositories(&decls, &options, &cache)?;
        let cutoff_before = cutoff;
        let mut start: i64 = 1;
        for repo in repositories.values() {
            let next = repo
                .setup_incremental(&mut cutoff)
                .with_context(|| format!("While resuming {}", repo.name()))?;
            start = start.max(next);
        }
        if cutoff == cutoff_before {
            break (repositories, start.min(cutoff));
        }
        log::warn!("Resume state disagrees between repositories; rewinding to r{cutoff}");
        for repo in repositories.values() {
            repo.restore_log()?;
        }
    };
    for repo in repositories.values() {
        repo.restore_state()?;
    }

    let youngest = svn.youngest_revision()?;
    let max_rev = cli.max_rev.unwrap_or(youngest).min(youngest);
    if start > max_rev {
        log::info!("Nothing to do: already converted up to r{}", start - 1);
    } else {
        log::info!("Converting revisions r{start}..r{max_rev}");
    }

    let walker = RevisionWalker::new(svn, rule_lists, repositories, identities, tables, options);

    let bar = ProgressBar::new(max_rev.saturating_sub(start - 1).max(0) as u64);
    bar.set_style(
        ProgressStyle::with_template("{wide_bar} r{human_pos}/{human_len} {eta}")
            .expect("valid progress template"),
    );
    let mut result = Ok(());
    for revnum in start..=max_rev {
        if let Err(err) = walker.export_revision(revnum) {
            result = Err(err);
            break;
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    if let Err(err) = result {
        // Leave the on-disk state as it was before this run so the next
        // attempt resumes from the last contiguous revision.
        for repo in walker.repositories().values() {
            if let Err(restore_err) = repo.restore_log() {
                log::warn!("Could not restore log of {}: {restore_err:#}", repo.name());
            }
        }
        return Err(err);
    }

    for repo in walker.repositories().values() {
        repo.commit()?;
        repo.finalize_tags()?;
        repo.save_branch_notes()?;
    }
    for repo in walker.repositories().values() {
        repo.close()?;
    }
    log::info!("Conversion finished at r{max_rev}");
    Ok(())
}

fn build_repositories(
    decls: &[RepoDecl],
    options: &Rc<Options>,
    cache: &ProcessCacheHandle,
) -> Result<BTreeMap<String, Repository>> {
    let mut repositories = BTreeMap::new();
    for decl in decls.iter().filter(|decl| decl.forward_to.is_empty()) {
        let handle = FastImportRepository::create(decl, options.clone(), cache.clone())?;
        repositories.insert(decl.name.clone(), Repository::Direct(handle));
    }
    for decl in decls.iter().filter(|decl| !decl.forward_to.is_empty()) {
        let (target_name, prefix) = resolve_forward(decls, decl)?;
        let target = repositories
            .get(&target_name)
            .with_context(|| {
                format!(
                    "No repository with name {target_name} found for forwarding {}",
                    decl.name
                )
            })?
            .handle()
            .clone();
        repositories.insert(
            decl.name.clone(),
            Repository::Forwarding {
                name: decl.name.clone(),
                target,
                prefix,
            },
        );
    }
    Ok(repositories)
}

/// Follows a forward-to chain to its backing repository, accumulating the
/// path prefixes of every hop. Cycles are configuration errors and detected
/// here rather than at dispatch time.
fn resolve_forward(decls: &[RepoDecl], decl: &RepoDecl) -> Result<(String, String)> {
    let mut visited = HashSet::new();
    visited.insert(decl.name.clone());
    let mut prefix = decl.prefix.clone();
    let mut target = decl.forward_to.clone();
    loop {
        let Some(next) = decls.iter().find(|candidate| candidate.name == target) else {
            bail!(
                "No repository with name {target} found (forwarded from {})",
                decl.name
            );
        };
        if next.forward_to.is_empty() {
            return Ok((target, prefix));
        }
        if !visited.insert(next.name.clone()) {
            bail!("Repository forwarding cycle through {}", next.name);
        }
        prefix = format!("{}{prefix}", next.prefix);
        target = next.forward_to.clone();
    }
}

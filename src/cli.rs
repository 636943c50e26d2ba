//! Command line argument definition.
//!
//! All recognized options are packaged into a plain [`Options`] record that
//! is passed into each component instead of consulting a global parser.

use anyhow::Result;
use clap::Args;
use clap::Parser;
use itertools::Itertools;
use std::path::PathBuf;
use std::rc::Rc;

const ABOUT: &str = "svn2git converts a Subversion repository into one or more Git repositories.

A rule file maps SVN paths and revisions to target repositories, branches and
on-branch subpaths; the conversion is deterministic and resumable.\
";

#[derive(Parser, Debug)]
#[command(about = ABOUT)]
pub struct Cli {
    /// Path to the Subversion repository to convert.
    pub svn_repo: PathBuf,

    /// Rule file mapping SVN paths to repositories and branches. May be
    /// repeated; each file forms an independent ordered rule list.
    #[arg(long = "rules", required = true)]
    pub rules: Vec<PathBuf>,

    /// File of "login = Full Name <email>" lines mapping SVN authors.
    #[arg(long)]
    pub identity_map: Option<PathBuf>,

    /// Domain appended to SVN logins that are missing from the identity map.
    #[arg(long, default_value = "localhost")]
    pub identity_domain: String,

    /// Directory in which the target repositories are created.
    #[arg(long, default_value = ".")]
    pub target_dir: PathBuf,

    /// TOML file with the curated merge override tables.
    #[arg(long)]
    pub merge_tables: Option<PathBuf>,

    /// First revision to convert, overriding the on-disk resume state.
    #[arg(long)]
    pub resume_from: Option<i64>,

    /// Last revision to convert; defaults to the youngest revision.
    #[arg(long)]
    pub max_rev: Option<i64>,

    /// Skip all process spawning and file writes.
    #[arg(long)]
    pub dry_run: bool,

    /// Write the fast-import stream to a <repository>.fi file instead of
    /// feeding a git-fast-import child.
    #[arg(long)]
    pub create_dump: bool,

    /// Seconds to wait for git-fast-import to finish on shutdown; 0 waits
    /// forever.
    #[arg(long, default_value_t = 30)]
    pub fast_import_timeout: u64,

    /// Number of transactions between fast-import checkpoints.
    #[arg(long, default_value_t = 25_000)]
    pub commit_interval: usize,

    /// Append "svn path=...; revision=..." to every commit message.
    #[arg(long)]
    pub add_metadata: bool,

    /// Record the SVN origin of every commit as a note on refs/notes/commits.
    #[arg(long)]
    pub add_metadata_notes: bool,

    /// Materialise the copied subtree when a branch is created by an SVN copy,
    /// making the branch-creation commit content-complete.
    #[arg(long)]
    pub svn_branches: bool,

    /// Translate svn:ignore and svn:global-ignores properties to .gitignore.
    #[arg(long)]
    pub svn_ignore: bool,

    /// Keep empty directories alive with .gitignore placeholder files.
    #[arg(long)]
    pub empty_dirs: bool,

    /// Warn about unrecognised SVN properties.
    #[arg(long)]
    pub propcheck: bool,

    /// Trace every rule-matching decision.
    #[arg(long)]
    pub debug_rules: bool,

    #[clap(flatten)]
    pub log_level: LogLevelArg,
}

const DEFAULT_LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

#[derive(Args, Debug)]
#[group(multiple = false)]
pub struct LogLevelArg {
    /// Use `-v` for debug or `-vv` for trace log messages.
    #[arg(long, short = 'v', global=true, default_value = "0", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use `-q` to hide info, `-qq` to hide warnings or `-qqq` to also hide
    /// error messages.
    #[arg(long, short = 'q', global=true, default_value = "0", action = clap::ArgAction::Count)]
    quiet: u8,
}

impl LogLevelArg {
    /// Get the log level based on the verbosity and quietness.
    pub fn value(&self) -> Result<log::LevelFilter> {
        let levels = log::LevelFilter::iter().collect_vec();
        let mut level_i16 = levels
            .iter()
            .find_position(|level| *level == &DEFAULT_LOG_LEVEL)
            .expect("Default log level must be valid")
            .0 as i16;
        level_i16 += self.verbose as i16;
        level_i16 -= self.quiet as i16;
        if level_i16 < 0 {
            anyhow::bail!(
                "Too quiet log level, {} below {}",
                -level_i16,
                levels.first().unwrap().as_str()
            );
        } else if level_i16 as usize >= levels.len() {
            anyhow::bail!(
                "Too verbose log level, {} above {}",
                level_i16 as usize - levels.len() + 1,
                levels.last().unwrap().as_str()
            );
        } else {
            Ok(levels[level_i16 as usize])
        }
    }
}

/// The recognized options, resolved once at startup and shared by the
/// repositories, transactions and the revision walker.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub target_dir: PathBuf,
    pub identity_domain: String,
    pub dry_run: bool,
    pub create_dump: bool,
    pub fast_import_timeout: u64,
    pub commit_interval: usize,
    pub add_metadata: bool,
    pub add_metadata_notes: bool,
    pub svn_branches: bool,
    pub svn_ignore: bool,
    pub empty_dirs: bool,
    pub propcheck: bool,
    pub debug_rules: bool,
}

impl Options {
    pub fn from_cli(cli: &Cli) -> Rc<Self> {
        Rc::new(Options {
            target_dir: cli.target_dir.clone(),
            identity_domain: cli.identity_domain.clone(),
            dry_run: cli.dry_run,
            create_dump: cli.create_dump,
            fast_import_timeout: cli.fast_import_timeout,
            commit_interval: cli.commit_interval,
            add_metadata: cli.add_metadata,
            add_metadata_notes: cli.add_metadata_notes,
            svn_branches: cli.svn_branches,
            svn_ignore: cli.svn_ignore,
            empty_dirs: cli.empty_dirs,
            propcheck: cli.propcheck,
            debug_rules: cli.debug_rules,
        })
    }

    /// True when no fast-import children are spawned and no repository
    /// directories are created.
    pub fn no_repo_setup(&self) -> bool {
        self.dry_run || self.create_dump
    }
}

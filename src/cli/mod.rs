use crate::bootloader::BootVars;
use crate::config::Settings;
use crate::feed::fs::FsFeed;
use crate::feed::{BlobStore, RevisionFeed};
use crate::manifest::{CurrentSystem, RevisionId};
use crate::package::{self, Packager};
use crate::update::Updater;
use crate::watcher::RunMode;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const KERNEL_CMDLINE: &str = "/proc/cmdline";

#[derive(Parser, Debug)]
#[clap(version, about, author)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an update package for the newest acceptable revision
    #[clap(name = "build", aliases = &["b"])]
    Build(BuildArgs),

    /// Show the embedded issue and the entries of an update package
    #[clap(name = "inspect", aliases = &["i"])]
    Inspect {
        /// Package to read
        #[clap(value_parser)]
        archive: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Issue file of the installed system (bare issue or full revision record)
    #[clap(value_parser)]
    issue: PathBuf,

    /// Revision or revision root to follow (defaults to the issue's lineage)
    #[clap(value_parser)]
    pointer: Option<String>,

    /// Where to write the update package [default: update.tar]
    #[clap(long, short, env = "TREOS_OUTPUT")]
    output: Option<PathBuf>,

    /// Staging directory for the package being written [default: system temp dir]
    #[clap(long, env = "TREOS_TMPDIR")]
    tmpdir: Option<PathBuf>,

    /// Settle period in milliseconds before a new head is packaged [default: 3000]
    #[clap(long, short, env = "TREOS_WAIT", value_name = "MS")]
    wait: Option<u64>,

    /// Directory holding the installed images [default: /boot]
    #[clap(long, env = "TREOS_BOOT_DIR")]
    boot_dir: Option<PathBuf>,

    /// Variables for bootloader option placeholders, as "KEY1=VALUE1 KEY2=VALUE2"
    /// [default: contents of /proc/cmdline]
    #[clap(long, env = "TREOS_BOOT_VARS")]
    boot_vars: Option<String>,

    /// Local mirror of the revision feed
    #[clap(long, env = "TREOS_FEED_DIR")]
    feed_dir: Option<PathBuf>,

    /// Feed polling interval in milliseconds [default: 1000]
    #[clap(long, env = "TREOS_POLL_INTERVAL", value_name = "MS")]
    poll_interval: Option<u64>,

    /// Keep following the lineage and repackage on every new head
    #[clap(long)]
    live: bool,

    /// Settings file supplying defaults
    #[clap(long, short, env = "TREOS_CONFIG")]
    config: Option<PathBuf>,
}

impl BuildArgs {
    /// Settings file values, overridden by whatever was given on the command line.
    fn settings(&self) -> Result<Settings, String> {
        let mut settings = match &self.config {
            Some(path) => Settings::load_from_file(path)?,
            None => Settings::default(),
        };
        if let Some(output) = &self.output {
            settings.output.clone_from(output);
        }
        if let Some(tmpdir) = &self.tmpdir {
            settings.tmpdir.clone_from(tmpdir);
        }
        if let Some(wait) = self.wait {
            settings.wait = wait;
        }
        if let Some(boot_dir) = &self.boot_dir {
            settings.boot_dir.clone_from(boot_dir);
        }
        if self.feed_dir.is_some() {
            settings.feed_dir.clone_from(&self.feed_dir);
        }
        if let Some(poll_interval) = self.poll_interval {
            settings.poll_interval = poll_interval;
        }
        settings.live |= self.live;
        Ok(settings)
    }

    fn boot_vars(&self) -> BootVars {
        if let Some(vars) = &self.boot_vars {
            return BootVars::parse(vars);
        }
        match std::fs::read_to_string(KERNEL_CMDLINE) {
            Ok(cmdline) => BootVars::parse(&cmdline),
            Err(e) => {
                tracing::warn!("Failed to read {KERNEL_CMDLINE}: {e}");
                BootVars::default()
            }
        }
    }
}

/// The pointer to follow: as given, else derived from the installed system.
fn resolve_pointer(
    given: Option<&str>,
    current: &CurrentSystem,
    issue: &Path,
) -> Result<RevisionId, String> {
    let pointer = given.or_else(|| current.default_pointer()).ok_or_else(|| {
        format!(
            "No revision given and {} declares neither a revisionRoot nor a key",
            issue.display()
        )
    })?;
    pointer.parse().map_err(|e: crate::error::UpdateError| e.to_string())
}

impl Cli {
    pub async fn run(self) -> Result<(), String> {
        tracing::trace!("Running command: {:?}", self.command);
        match self.command {
            Commands::Build(args) => build(args).await,
            Commands::Inspect { archive } => inspect(&archive),
        }
    }
}

#[tracing::instrument(skip_all)]
async fn build(args: BuildArgs) -> Result<(), String> {
    let settings = args.settings()?;
    let current = CurrentSystem::load(&args.issue, &settings.output).map_err(|e| e.to_string())?;
    let pointer = resolve_pointer(args.pointer.as_deref(), &current, &args.issue)?;
    let vars = args.boot_vars();
    if vars.is_empty() {
        tracing::debug!("No boot variables set, option placeholders stay as they are");
    }

    let feed_dir = settings
        .feed_dir
        .clone()
        .ok_or("No feed directory given, use --feed-dir or set feed-dir in the settings file")?;
    if !feed_dir.is_dir() {
        return Err(format!("{} is not a directory", feed_dir.display()));
    }
    let feed = Arc::new(FsFeed::new(feed_dir, settings.poll_interval()));

    let packager = Packager {
        staging_dir: settings.tmpdir.clone(),
        output: settings.output.clone(),
        boot_dir: settings.boot_dir.clone(),
    };
    let updater = Updater::new(
        Arc::clone(&feed) as Arc<dyn RevisionFeed>,
        feed as Arc<dyn BlobStore>,
        current,
        vars,
        packager,
    );
    let mode = if settings.live {
        RunMode::Live
    } else {
        RunMode::OneShot
    };

    tracing::info!("Following {pointer}");
    let outcome = updater
        .run(pointer, settings.settle(), mode)
        .await
        .map_err(|e| e.to_string())?;
    tracing::info!("{outcome}");
    Ok(())
}

fn inspect(archive: &Path) -> Result<(), String> {
    let issue = package::read_issue(archive).map_err(|e| e.to_string())?;
    let current = CurrentSystem::from_json(&issue).map_err(|e| e.to_string())?;
    if let Some(key) = &current.key {
        println!("Revision: {key}");
    }
    if let Some(root) = &current.issue.revision_root {
        println!("Root:     {root}");
    }
    if let Some(branch) = &current.issue.revision_branch {
        println!("Branch:   {branch}");
    }
    println!();
    for entry in package::list_entries(archive).map_err(|e| e.to_string())? {
        println!("{:>12}  {}", crate::util::human_size(entry.size), entry.name);
    }
    Ok(())
}

//! Update cycles
//!
//! Follows a pointer on the feed and turns every converged head into an update
//! package relative to the installed system.
use crate::bootloader::BootVars;
use crate::diff;
use crate::error::UpdateError;
use crate::feed::{BlobStore, RevisionFeed};
use crate::manifest::{CurrentSystem, RevisionHead, RevisionId};
use crate::package::Packager;
use crate::retrieve;
use crate::watcher::{Convergence, RunMode, Watcher};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

/// How a run or a single cycle ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The installed system already is the target revision.
    UpToDate,
    /// The target revision changes nothing that needs packaging.
    NothingToDo,
    /// A package was written to the given path.
    Packaged(PathBuf),
    /// The requested revision is older than the installed one.
    DowngradeRejected(String),
    /// The feed ended without offering an acceptable candidate.
    NoCandidate,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => write!(f, "We are up to date."),
            Self::NothingToDo => write!(f, "Nothing to do."),
            Self::Packaged(path) => write!(f, "Update package written to {}", path.display()),
            Self::DowngradeRejected(key) => write!(f, "Prevented downgrading to {key}"),
            Self::NoCandidate => write!(f, "No update candidate found."),
        }
    }
}

pub struct Updater {
    feed: Arc<dyn RevisionFeed>,
    blobs: Arc<dyn BlobStore>,
    current: CurrentSystem,
    vars: BootVars,
    packager: Packager,
}

impl Updater {
    pub fn new(
        feed: Arc<dyn RevisionFeed>,
        blobs: Arc<dyn BlobStore>,
        current: CurrentSystem,
        vars: BootVars,
        packager: Packager,
    ) -> Self {
        Self {
            feed,
            blobs,
            current,
            vars,
            packager,
        }
    }

    /// Follows `pointer` until a package is written (one-shot) or the feed ends (live).
    ///
    /// Every package is built against the system loaded at startup, so a later package
    /// replaces an earlier one rather than stacking on it.
    pub async fn run(
        &self,
        pointer: RevisionId,
        settle: Duration,
        mode: RunMode,
    ) -> Result<Outcome, UpdateError> {
        let mut watcher = Watcher::new(
            Arc::clone(&self.feed),
            pointer,
            &self.current,
            settle,
            mode,
        );
        let mut last = None;
        loop {
            match watcher.next_converged().await? {
                Convergence::Converged(head) => {
                    let outcome = self.package(head, Ulid::new()).await?;
                    if mode == RunMode::OneShot {
                        return Ok(outcome);
                    }
                    tracing::info!("{outcome}");
                    last = Some(outcome);
                }
                Convergence::UpToDate => return Ok(Outcome::UpToDate),
                Convergence::Downgrade(key) => return Ok(Outcome::DowngradeRejected(key)),
                Convergence::Exhausted => return Ok(last.unwrap_or(Outcome::NoCandidate)),
            }
        }
    }

    /// Builds and commits the package that moves the installed system to `head`.
    #[tracing::instrument(skip_all, fields(cycle = %cycle, revision = %head.key()))]
    pub async fn package(&self, head: RevisionHead, cycle: Ulid) -> Result<Outcome, UpdateError> {
        let items = diff::plan(&self.current.issue, head.issue(), &self.vars)?;
        if items.is_empty() {
            tracing::info!("No files changed, nothing to do");
            return Ok(Outcome::NothingToDo);
        }
        tracing::info!("{} entries to pack", items.len());

        retrieve::prefetch(self.blobs.as_ref(), &items).await?;

        let packager = self.packager.clone();
        let blobs = Arc::clone(&self.blobs);
        tokio::task::spawn_blocking(move || packager.write(&head, &items, blobs.as_ref(), cycle))
            .await
            .map_err(|e| {
                UpdateError::packaging(&self.packager.output, std::io::Error::other(e))
            })??;

        Ok(Outcome::Packaged(self.packager.output.clone()))
    }
}

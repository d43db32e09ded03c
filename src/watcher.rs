//! Revision convergence watcher
//!
//! Follows the heads of a revision lineage until one has settled. Every candidate
//! passes the downgrade guard first; accepted candidates restart the settle timer,
//! and only a candidate that survives a full quiet period converges. Heads flap while
//! the feed replicates, so earlier candidates of the same quiet period are dropped.
use crate::error::FeedError;
use crate::feed::{HeadStream, HeadsOptions, RevisionFeed};
use crate::manifest::{CurrentSystem, RevisionHead, RevisionId};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of checking one candidate against the installed system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// The candidate is the installed revision.
    UpToDate,
    /// The candidate is an ancestor of, or unrelated to, the installed revision.
    Downgrade,
}

/// Result of waiting for a converged head.
#[derive(Debug, Clone, PartialEq)]
pub enum Convergence {
    Converged(RevisionHead),
    /// The pointer resolved to the installed revision (one-shot mode only).
    UpToDate,
    /// The pointer names a revision older than the installed one.
    Downgrade(String),
    /// No more candidates will arrive.
    Exhausted,
}

/// Decides whether a candidate revision may replace the installed one.
pub struct DowngradeGuard {
    feed: Arc<dyn RevisionFeed>,
    key: Option<String>,
    revision_root: Option<String>,
    revision_branch: Option<String>,
}

impl DowngradeGuard {
    pub fn new(feed: Arc<dyn RevisionFeed>, current: &CurrentSystem) -> Self {
        Self {
            feed,
            key: current.key.clone(),
            revision_root: current.issue.revision_root.clone(),
            revision_branch: current.issue.revision_branch.clone(),
        }
    }

    pub async fn check(&self, candidate: &RevisionHead) -> Result<Verdict, FeedError> {
        // Switching to another lineage is always intentional.
        if self
            .revision_root
            .as_deref()
            .is_some_and(|root| root != candidate.revision_root())
        {
            tracing::debug!(candidate = candidate.key(), "Candidate switches lineage");
            return Ok(Verdict::Accept);
        }
        if self.key.as_deref() == Some(candidate.key()) {
            return Ok(Verdict::UpToDate);
        }
        let Some(branch) = &self.revision_branch else {
            return Ok(Verdict::Accept);
        };
        if branch == candidate.key() {
            return Ok(Verdict::Downgrade);
        }
        let Ok(root) = candidate.revision_root().parse::<RevisionId>() else {
            tracing::warn!("{} names a malformed revision root", candidate.key());
            return Ok(Verdict::Downgrade);
        };
        let history = self.feed.history_of(&root).await?;
        if descends_from(candidate, branch, &history) {
            Ok(Verdict::Accept)
        } else {
            Ok(Verdict::Downgrade)
        }
    }
}

/// Follows `revisionBranch` links from `candidate` back through `history` and reports
/// whether the chain reaches `ancestor`.
fn descends_from(candidate: &RevisionHead, ancestor: &str, history: &[RevisionHead]) -> bool {
    let by_key: HashMap<&str, &RevisionHead> =
        history.iter().map(|head| (head.key(), head)).collect();
    let mut seen = HashSet::new();
    let mut next = candidate.issue().revision_branch.as_deref();
    while let Some(key) = next {
        if key == ancestor {
            return true;
        }
        if !seen.insert(key) {
            tracing::warn!("Revision chain of {} loops at {key}", candidate.key());
            return false;
        }
        next = by_key
            .get(key)
            .and_then(|head| head.issue().revision_branch.as_deref());
    }
    false
}

/// Whether the watcher stops after the first converged head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    OneShot,
    Live,
}

pub struct Watcher {
    feed: Arc<dyn RevisionFeed>,
    pointer: RevisionId,
    guard: DowngradeGuard,
    settle: Duration,
    mode: RunMode,
    stream: Option<HeadStream>,
    /// Set once the pointer turned out to name a fixed revision that was already reported
    exhausted: bool,
    last_converged: Option<String>,
}

impl Watcher {
    pub fn new(
        feed: Arc<dyn RevisionFeed>,
        pointer: RevisionId,
        current: &CurrentSystem,
        settle: Duration,
        mode: RunMode,
    ) -> Self {
        let guard = DowngradeGuard::new(Arc::clone(&feed), current);
        Self {
            feed,
            pointer,
            guard,
            settle,
            mode,
            stream: None,
            exhausted: false,
            last_converged: None,
        }
    }

    /// Subscribes on first use. A pointer naming one specific revision never moves,
    /// so it is checked once and reported without a settle period.
    async fn open(&mut self) -> Result<Option<Convergence>, FeedError> {
        let resolved = self.feed.resolve(&self.pointer).await?;
        if resolved.original {
            tracing::debug!(pointer = %self.pointer, "Watching revision root");
            self.stream = Some(self.feed.heads_of(&self.pointer, HeadsOptions::default()));
            return Ok(None);
        }

        tracing::debug!(pointer = %self.pointer, "Pointer names a specific revision");
        self.exhausted = true;
        let head = resolved.value;
        Ok(Some(match self.guard.check(&head).await? {
            Verdict::Accept => {
                tracing::info!("Found update {}", head.key());
                self.last_converged = Some(head.key().to_owned());
                Convergence::Converged(head)
            }
            Verdict::UpToDate => {
                tracing::info!("We are up to date.");
                Convergence::UpToDate
            }
            Verdict::Downgrade => {
                tracing::warn!("Prevented downgrading to {}", head.key());
                Convergence::Downgrade(head.key().to_owned())
            }
        }))
    }

    /// Waits for the next settled head.
    #[tracing::instrument(skip_all, fields(pointer = %self.pointer))]
    pub async fn next_converged(&mut self) -> Result<Convergence, FeedError> {
        if self.exhausted {
            return Ok(Convergence::Exhausted);
        }
        if self.stream.is_none() {
            if let Some(convergence) = self.open().await? {
                return Ok(convergence);
            }
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Convergence::Exhausted);
        };

        let mut pending: Option<(RevisionHead, Instant)> = None;
        loop {
            // Far enough away to never fire; the branch is disabled without a candidate anyway.
            let deadline = pending
                .as_ref()
                .map_or_else(|| Instant::now() + Duration::from_secs(86_400), |(_, at)| *at);

            tokio::select! {
                biased;

                update = stream.next() => {
                    let update = match update {
                        Some(update) => update?,
                        None => {
                            tracing::debug!("Head stream ended");
                            self.exhausted = true;
                            return Ok(match pending {
                                Some((head, _)) => Convergence::Converged(head),
                                None => Convergence::Exhausted,
                            });
                        }
                    };
                    let Some(head) = update.heads.into_iter().next() else {
                        continue;
                    };
                    if self.last_converged.as_deref() == Some(head.key()) {
                        tracing::debug!("{} was already handled", head.key());
                        pending = None;
                        continue;
                    }
                    match self.guard.check(&head).await? {
                        Verdict::Accept => {
                            tracing::info!("Found update {}", head.key());
                            if !update.meta.is_latest_live {
                                self.last_converged = Some(head.key().to_owned());
                                return Ok(Convergence::Converged(head));
                            }
                            pending = Some((head, Instant::now() + self.settle));
                        }
                        Verdict::UpToDate => {
                            tracing::info!("We are up to date.");
                            if self.mode == RunMode::OneShot {
                                return Ok(Convergence::UpToDate);
                            }
                            pending = None;
                        }
                        Verdict::Downgrade => {
                            tracing::warn!("Prevented downgrading to {}", head.key());
                        }
                    }
                }

                () = tokio::time::sleep_until(deadline), if pending.is_some() => {
                    if let Some((head, _)) = pending.take() {
                        tracing::info!("{} has settled", head.key());
                        self.last_converged = Some(head.key().to_owned());
                        return Ok(Convergence::Converged(head));
                    }
                }
            }
        }
    }
}

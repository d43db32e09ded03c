//! Directory-backed feed
//!
//! Reads a local mirror of the replicated feed:
//!
//! ```text
//! <root>/
//!   revisions/**/*.json     one revision record per file
//!   blobs/sha256/<hex>      blob content, named by the hex sha256 digest
//! ```
//!
//! The mirror is never written here. Live head streams and blob requests poll the
//! directory until something changes.
use super::{BlobStore, HeadMeta, HeadStream, HeadUpdate, HeadsOptions, Resolved, RevisionFeed};
use crate::error::FeedError;
use crate::manifest::{BlobRef, RevisionHead, RevisionId};
use async_trait::async_trait;
use futures::StreamExt;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct FsFeed {
    root: PathBuf,
    poll_interval: Duration,
}

impl FsFeed {
    const REVISIONS_DIR: &'static str = "revisions";
    const BLOBS_DIR: &'static str = "blobs/sha256";

    pub fn new(root: PathBuf, poll_interval: Duration) -> Self {
        Self {
            root,
            poll_interval,
        }
    }

    fn revisions_path(&self) -> PathBuf {
        self.root.join(Self::REVISIONS_DIR)
    }

    fn blob_path(&self, blob: &BlobRef) -> Result<PathBuf, FeedError> {
        let hex = blob.hex().map_err(FeedError::InvalidBlob)?;
        Ok(self.root.join(Self::BLOBS_DIR).join(hex))
    }
}

fn read_record(path: &Path) -> Result<RevisionHead, FeedError> {
    let content = std::fs::read(path).map_err(|source| FeedError::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_slice(&content).map_err(|source| FeedError::Malformed {
        path: path.to_owned(),
        source,
    })
}

/// Reads every revision record below `dir`. Unreadable records are skipped, since the
/// mirror may be written to while we read it.
fn scan_revisions(dir: &Path) -> Vec<RevisionHead> {
    if !dir.is_dir() {
        return Vec::new();
    }
    jwalk::WalkDir::new(dir)
        .sort(true)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.path()),
            Err(e) => {
                tracing::warn!("Failed to walk {}: {}", dir.display(), e);
                None
            }
        })
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .filter_map(|path| match read_record(&path) {
            Ok(head) => Some(head),
            Err(e) => {
                tracing::warn!("Skipping revision record: {e}");
                None
            }
        })
        .collect()
}

async fn load_revisions(dir: PathBuf) -> Result<Vec<RevisionHead>, FeedError> {
    tokio::task::spawn_blocking(move || scan_revisions(&dir))
        .await
        .map_err(|e| FeedError::Closed(format!("revision scan aborted: {e}")))
}

/// Oldest first; records without a timestamp sort before any that have one.
fn by_age(a: &RevisionHead, b: &RevisionHead) -> Ordering {
    a.timestamp()
        .partial_cmp(&b.timestamp())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.key().cmp(b.key()))
}

/// All revisions of the lineage rooted at `root`, oldest first.
fn lineage(revisions: Vec<RevisionHead>, root: &str) -> Vec<RevisionHead> {
    let mut lineage: Vec<_> = revisions
        .into_iter()
        .filter(|head| head.revision_root() == root)
        .collect();
    lineage.sort_by(by_age);
    lineage
}

/// Revisions no other revision was built from, newest first.
fn heads(lineage: &[RevisionHead]) -> Vec<RevisionHead> {
    let superseded: HashSet<&str> = lineage
        .iter()
        .filter_map(|head| head.issue().revision_branch.as_deref())
        .collect();
    let mut heads: Vec<_> = lineage
        .iter()
        .filter(|head| !superseded.contains(head.key()))
        .cloned()
        .collect();
    heads.sort_by(|a, b| by_age(b, a));
    heads
}

/// Polling state behind [`FsFeed::heads_of`].
struct HeadPoll {
    revisions: PathBuf,
    root: String,
    options: HeadsOptions,
    interval: Duration,
    last: Option<Vec<String>>,
    done: bool,
}

impl HeadPoll {
    async fn next(mut self) -> Option<(Result<HeadUpdate, FeedError>, Self)> {
        if self.done {
            return None;
        }
        loop {
            let revisions = match load_revisions(self.revisions.clone()).await {
                Ok(revisions) => revisions,
                Err(e) => {
                    self.done = true;
                    return Some((Err(e), self));
                }
            };
            let mut current = heads(&lineage(revisions, &self.root));
            current.truncate(self.options.max_heads);
            let keys: Vec<String> = current.iter().map(|h| h.key().to_owned()).collect();

            if !current.is_empty() && self.last.as_ref() != Some(&keys) {
                tracing::debug!(root = %self.root, heads = ?keys, "Lineage heads changed");
                self.last = Some(keys);
                self.done = !self.options.live;
                let update = HeadUpdate {
                    meta: HeadMeta {
                        is_latest_live: true,
                    },
                    heads: current,
                };
                return Some((Ok(update), self));
            }
            if !self.options.live {
                return None;
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[async_trait]
impl RevisionFeed for FsFeed {
    async fn resolve(&self, pointer: &RevisionId) -> Result<Resolved, FeedError> {
        loop {
            let revisions = load_revisions(self.revisions_path()).await?;
            if let Some(value) = revisions.into_iter().find(|head| pointer == head.key()) {
                let original = value.issue().revision_root.is_none();
                return Ok(Resolved { original, value });
            }
            tracing::debug!("Waiting for {pointer} to arrive");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn heads_of(&self, pointer: &RevisionId, options: HeadsOptions) -> HeadStream {
        let poll = HeadPoll {
            revisions: self.revisions_path(),
            root: pointer.to_string(),
            options,
            interval: self.poll_interval,
            last: None,
            done: false,
        };
        futures::stream::unfold(poll, HeadPoll::next).boxed()
    }

    async fn history_of(&self, pointer: &RevisionId) -> Result<Vec<RevisionHead>, FeedError> {
        let revisions = load_revisions(self.revisions_path()).await?;
        Ok(lineage(revisions, pointer.as_str()))
    }
}

#[async_trait]
impl BlobStore for FsFeed {
    async fn has(&self, blob: &BlobRef) -> Result<bool, FeedError> {
        let path = self.blob_path(blob)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| FeedError::Io { path, source })
    }

    async fn want(&self, blob: &BlobRef) -> Result<(), FeedError> {
        while !self.has(blob).await? {
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(())
    }

    fn get(&self, blob: &BlobRef) -> Result<Box<dyn Read + Send>, FeedError> {
        let path = self.blob_path(blob)?;
        match std::fs::File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FeedError::BlobNotFound(blob.to_string()))
            }
            Err(source) => Err(FeedError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ContentId;
    use crate::testutil::digest_of;
    use crate::testutil::{record, revision_id};
    use tempfile::TempDir;

    fn write_record(dir: &Path, head: &RevisionHead) {
        let revisions = dir.join("revisions");
        std::fs::create_dir_all(&revisions).unwrap();
        let name = hex::encode(head.key().as_bytes());
        std::fs::write(
            revisions.join(format!("{name}.json")),
            head.to_pretty_json().unwrap(),
        )
        .unwrap();
    }

    fn feed(dir: &TempDir) -> FsFeed {
        FsFeed::new(dir.path().to_owned(), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_resolve_root_and_revision() {
        let dir = TempDir::new().unwrap();
        let root = revision_id(1);
        let rev = revision_id(2);
        write_record(dir.path(), &record(&root, None, None, 1));
        write_record(dir.path(), &record(&rev, Some(&root), Some(&root), 2));
        let feed = feed(&dir);

        let resolved = feed.resolve(&root.parse().unwrap()).await.unwrap();
        assert!(resolved.original);
        let resolved = feed.resolve(&rev.parse().unwrap()).await.unwrap();
        assert!(!resolved.original);
        assert_eq!(resolved.value.key(), rev);
    }

    #[tokio::test]
    async fn test_heads_and_history() {
        let dir = TempDir::new().unwrap();
        let root = revision_id(1);
        let second = revision_id(2);
        let third = revision_id(3);
        let other = revision_id(9);
        write_record(dir.path(), &record(&root, None, None, 1));
        write_record(dir.path(), &record(&second, Some(&root), Some(&root), 2));
        write_record(dir.path(), &record(&third, Some(&root), Some(&second), 3));
        write_record(dir.path(), &record(&other, None, None, 4));
        std::fs::write(dir.path().join("revisions/garbage.json"), "{").unwrap();
        let feed = feed(&dir);
        let pointer: RevisionId = root.parse().unwrap();

        let options = HeadsOptions {
            live: false,
            max_heads: 1,
        };
        let updates: Vec<_> = feed.heads_of(&pointer, options).collect().await;
        assert_eq!(updates.len(), 1);
        let update = updates.into_iter().next().unwrap().unwrap();
        assert_eq!(update.heads.len(), 1);
        assert_eq!(update.heads[0].key(), third);

        let history = feed.history_of(&pointer).await.unwrap();
        let keys: Vec<_> = history.iter().map(RevisionHead::key).collect();
        assert_eq!(keys, [root.as_str(), second.as_str(), third.as_str()]);
    }

    #[tokio::test]
    async fn test_live_heads_follow_new_revisions() {
        let dir = TempDir::new().unwrap();
        let root = revision_id(1);
        let next = revision_id(2);
        write_record(dir.path(), &record(&root, None, None, 1));
        let feed = feed(&dir);

        let mut stream = feed.heads_of(&root.parse().unwrap(), HeadsOptions::default());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.heads[0].key(), root);

        write_record(dir.path(), &record(&next, Some(&root), Some(&root), 2));
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.heads[0].key(), next);
        assert!(second.meta.is_latest_live);
    }

    #[tokio::test]
    async fn test_blobs() {
        let dir = TempDir::new().unwrap();
        let feed = feed(&dir);
        let digest = digest_of(b"kernel");
        let blob = ContentId::parse(&format!("{digest}.sha256"), 6).unwrap().blob();

        assert!(!feed.has(&blob).await.unwrap());
        assert!(matches!(feed.get(&blob), Err(FeedError::BlobNotFound(_))));

        let blob_dir = dir.path().join("blobs/sha256");
        std::fs::create_dir_all(&blob_dir).unwrap();
        let path = blob_dir.join(blob.hex().unwrap());
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            std::fs::write(path, b"kernel").unwrap();
        });
        feed.want(&blob).await.unwrap();
        writer.await.unwrap();

        let mut content = String::new();
        feed.get(&blob).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "kernel");
    }
}

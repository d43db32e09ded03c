//! In-memory feed for testing.
//!
//! Heads are pushed by the test through the sender returned from [`MemoryFeed::new`];
//! blobs registered as remote only become available once they are wanted.
use super::{BlobStore, HeadMeta, HeadStream, HeadUpdate, HeadsOptions, Resolved, RevisionFeed};
use crate::error::FeedError;
use crate::testutil::digest_of;
use crate::manifest::{BlobRef, RevisionHead, RevisionId};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

pub struct MemoryFeed {
    revisions: Mutex<Vec<RevisionHead>>,
    heads: Mutex<Option<mpsc::UnboundedReceiver<HeadUpdate>>>,
    local: Mutex<HashMap<String, Vec<u8>>>,
    remote: Mutex<HashMap<String, Vec<u8>>>,
    pub wanted: Mutex<Vec<String>>,
    pub history_calls: AtomicUsize,
    pub blob_reads: AtomicUsize,
}

impl MemoryFeed {
    pub fn new() -> (Self, mpsc::UnboundedSender<HeadUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Self {
            revisions: Mutex::new(Vec::new()),
            heads: Mutex::new(Some(rx)),
            local: Mutex::new(HashMap::new()),
            remote: Mutex::new(HashMap::new()),
            wanted: Mutex::new(Vec::new()),
            history_calls: AtomicUsize::new(0),
            blob_reads: AtomicUsize::new(0),
        };
        (feed, tx)
    }

    pub fn add_revision(&self, head: RevisionHead) {
        self.revisions.lock().unwrap().push(head);
    }

    /// Stores a blob under its own digest, available immediately.
    pub fn add_local_blob(&self, data: &[u8]) {
        self.local.lock().unwrap().insert(digest_of(data), data.to_vec());
    }

    /// Stores a blob under its own digest, available once wanted.
    pub fn add_remote_blob(&self, data: &[u8]) {
        self.remote.lock().unwrap().insert(digest_of(data), data.to_vec());
    }

    /// Stores arbitrary bytes under `digest`, e.g. to simulate corruption.
    pub fn add_blob_as(&self, digest: &str, data: &[u8]) {
        self.local.lock().unwrap().insert(digest.to_owned(), data.to_vec());
    }
}

/// A live head update carrying a single head.
pub fn live(head: RevisionHead) -> HeadUpdate {
    HeadUpdate {
        meta: HeadMeta {
            is_latest_live: true,
        },
        heads: vec![head],
    }
}

#[async_trait]
impl RevisionFeed for MemoryFeed {
    async fn resolve(&self, pointer: &RevisionId) -> Result<Resolved, FeedError> {
        let revisions = self.revisions.lock().unwrap();
        let value = revisions
            .iter()
            .find(|head| pointer == head.key())
            .cloned()
            .ok_or_else(|| FeedError::RevisionNotFound(pointer.to_string()))?;
        let original = value.issue().revision_root.is_none();
        Ok(Resolved { original, value })
    }

    fn heads_of(&self, _pointer: &RevisionId, _options: HeadsOptions) -> HeadStream {
        match self.heads.lock().unwrap().take() {
            Some(rx) => futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|update| (Ok(update), rx))
            })
            .boxed(),
            None => futures::stream::empty().boxed(),
        }
    }

    async fn history_of(&self, pointer: &RevisionId) -> Result<Vec<RevisionHead>, FeedError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .revisions
            .lock()
            .unwrap()
            .iter()
            .filter(|head| pointer == head.revision_root())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BlobStore for MemoryFeed {
    async fn has(&self, blob: &BlobRef) -> Result<bool, FeedError> {
        Ok(self.local.lock().unwrap().contains_key(blob.digest()))
    }

    async fn want(&self, blob: &BlobRef) -> Result<(), FeedError> {
        self.wanted.lock().unwrap().push(blob.to_string());
        let data = self
            .remote
            .lock()
            .unwrap()
            .remove(blob.digest())
            .ok_or_else(|| FeedError::BlobNotFound(blob.to_string()))?;
        self.local
            .lock()
            .unwrap()
            .insert(blob.digest().to_owned(), data);
        Ok(())
    }

    fn get(&self, blob: &BlobRef) -> Result<Box<dyn Read + Send>, FeedError> {
        self.blob_reads.fetch_add(1, Ordering::SeqCst);
        let data = self
            .local
            .lock()
            .unwrap()
            .get(blob.digest())
            .cloned()
            .ok_or_else(|| FeedError::BlobNotFound(blob.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }
}

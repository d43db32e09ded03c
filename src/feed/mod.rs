//! Revision feed and blob store interfaces
//!
//! Revision history and blob content are replicated by an external client. This
//! module only describes what the update pipeline needs from it:
//!
//! - [`RevisionFeed`]: resolve pointers, watch lineage heads, list lineage history
//! - [`BlobStore`]: check, request and read content-addressed blobs
//!
//! [`fs::FsFeed`] implements both on top of a local mirror directory.
pub mod fs;
#[cfg(test)]
pub mod memory;

use crate::error::FeedError;
use crate::manifest::{BlobRef, RevisionHead, RevisionId};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::io::Read;

/// Stream-level metadata of a head update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadMeta {
    /// Whether the pointer names a lineage whose head may still move. When false the
    /// update is final.
    pub is_latest_live: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeadUpdate {
    pub meta: HeadMeta,
    pub heads: Vec<RevisionHead>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadsOptions {
    pub live: bool,
    pub max_heads: usize,
}

impl Default for HeadsOptions {
    fn default() -> Self {
        Self {
            live: true,
            max_heads: 1,
        }
    }
}

/// What a pointer resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// True if the pointer is the original message of a lineage, i.e. a revision root.
    pub original: bool,
    pub value: RevisionHead,
}

pub type HeadStream = BoxStream<'static, Result<HeadUpdate, FeedError>>;

#[async_trait]
pub trait RevisionFeed: Send + Sync {
    /// Looks up the message a pointer names, waiting for it to arrive if necessary.
    async fn resolve(&self, pointer: &RevisionId) -> Result<Resolved, FeedError>;

    /// Heads of the lineage rooted at `pointer`. Live streams keep emitting as the
    /// head moves.
    fn heads_of(&self, pointer: &RevisionId, options: HeadsOptions) -> HeadStream;

    /// Every known revision of the lineage rooted at `pointer`.
    async fn history_of(&self, pointer: &RevisionId) -> Result<Vec<RevisionHead>, FeedError>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn has(&self, blob: &BlobRef) -> Result<bool, FeedError>;

    /// Requests a blob from peers and returns once it is available locally.
    ///
    /// There is no deadline: a blob nobody serves blocks forever.
    async fn want(&self, blob: &BlobRef) -> Result<(), FeedError>;

    /// Opens a locally available blob.
    fn get(&self, blob: &BlobRef) -> Result<Box<dyn Read + Send>, FeedError>;
}

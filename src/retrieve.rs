//! Verified content retrieval
//!
//! Package content is hashed while it streams into the archive and checked against
//! the declared checksum once the stream ends. Local files are verified as strictly
//! as blobs: a local mismatch means the boot partition or the issue is corrupt.
use crate::diff::DiffItem;
use crate::error::UpdateError;
use crate::feed::BlobStore;
use crate::manifest::checksum::encode_digest;
use crate::manifest::{BlobRef, ContentId};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::io::{self, IsTerminal, Read, Take};
use std::path::Path;

/// Receives cumulative byte counts while content streams.
pub trait TransferProgress: Send {
    fn update(&mut self, filename: &str, transferred: u64, total: u64);
}

/// Progress for one file: a bar on an interactive terminal, log events otherwise.
pub fn progress_for(filename: &str, total: u64) -> Box<dyn TransferProgress> {
    if io::stderr().is_terminal() {
        Box::new(BarProgress::new(filename, total))
    } else {
        Box::new(LogProgress::default())
    }
}

/// Terminal progress bar showing bytes against the declared size.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(filename: &str, total: u64) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(bar_style());
        bar.set_message(filename.to_owned());
        Self { bar }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] \
             {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
        )
        .map_or_else(
            |_| ProgressStyle::default_bar(),
            |style| style.progress_chars("#>-"),
        )
}

impl TransferProgress for BarProgress {
    fn update(&mut self, _filename: &str, transferred: u64, total: u64) {
        self.bar.set_position(transferred);
        if transferred >= total {
            self.bar.finish();
        }
    }
}

impl Drop for BarProgress {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }
}

/// Logs progress at debug level about every tenth of a file.
#[derive(Debug, Default)]
pub struct LogProgress {
    reported: u64,
}

impl TransferProgress for LogProgress {
    fn update(&mut self, filename: &str, transferred: u64, total: u64) {
        let step = (total / 10).max(1);
        let due = transferred >= self.reported + step || transferred == total;
        if due || transferred < self.reported {
            tracing::debug!(filename, transferred, total, "{transferred} / {total}");
            self.reported = transferred;
        }
    }
}

/// Hashes and counts everything read through it, up to the declared size.
pub struct VerifyingReader<'p, R> {
    inner: Take<R>,
    filename: String,
    hasher: Sha256,
    transferred: u64,
    total: u64,
    progress: Option<&'p mut dyn TransferProgress>,
}

impl<'p, R: Read> VerifyingReader<'p, R> {
    pub fn new(inner: R, filename: &str, total: u64) -> Self {
        Self {
            inner: inner.take(total),
            filename: filename.to_owned(),
            hasher: Sha256::new(),
            transferred: 0,
            total,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: &'p mut dyn TransferProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Checks length and digest of what was read against `expected`.
    pub fn verify(self, expected: &ContentId) -> Result<u64, UpdateError> {
        let transferred = self.transferred;
        let digest = encode_digest(self.hasher);
        if transferred != expected.size {
            return Err(UpdateError::Integrity {
                filename: self.filename,
                expected: format!("{} bytes", expected.size),
                actual: format!("{transferred} bytes"),
            });
        }
        if digest != expected.digest {
            return Err(UpdateError::Integrity {
                filename: self.filename,
                expected: expected.digest.clone(),
                actual: digest,
            });
        }
        tracing::info!("{} checksum matches", self.filename);
        Ok(transferred)
    }
}

impl<R: Read> Read for VerifyingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.transferred += n as u64;
        if let Some(progress) = self.progress.as_deref_mut() {
            progress.update(&self.filename, self.transferred, self.total);
        }
        Ok(n)
    }
}

/// Makes sure a blob is available locally, requesting it from peers if needed.
#[tracing::instrument(skip_all, fields(blob = %blob))]
pub async fn ensure_local(blobs: &dyn BlobStore, blob: &BlobRef) -> Result<(), UpdateError> {
    let has = blobs.has(blob).await?;
    tracing::info!("Blob {} present locally", if has { "is" } else { "is not yet" });
    if !has {
        tracing::info!("Requesting blob ...");
        blobs.want(blob).await?;
        tracing::info!("Received blob");
    }
    Ok(())
}

/// Ensures every blob the package needs is local. Requests run concurrently.
pub async fn prefetch(blobs: &dyn BlobStore, items: &[DiffItem]) -> Result<(), UpdateError> {
    let wanted: Vec<BlobRef> = items
        .iter()
        .filter_map(|item| match item {
            DiffItem::Fetch { checksum, .. } => Some(checksum.blob()),
            DiffItem::Reuse { .. } | DiffItem::Generated { .. } => None,
        })
        .collect();
    futures::future::try_join_all(wanted.iter().map(|blob| ensure_local(blobs, blob))).await?;
    Ok(())
}

/// Opens the content source of a file item. Generated items carry their content and
/// have no source.
pub fn open_source(
    item: &DiffItem,
    boot_dir: &Path,
    blobs: &dyn BlobStore,
) -> Result<Option<Box<dyn Read + Send>>, UpdateError> {
    match item {
        DiffItem::Reuse { source, .. } => {
            let path = boot_dir.join(source);
            tracing::info!("Reading from {}", path.display());
            let file = std::fs::File::open(&path)
                .map_err(|source| UpdateError::LocalRead { path, source })?;
            Ok(Some(Box::new(file)))
        }
        DiffItem::Fetch { checksum, .. } => {
            let blob = checksum.blob();
            tracing::info!("Loading from blob {blob}");
            Ok(Some(blobs.get(&blob)?))
        }
        DiffItem::Generated { .. } => Ok(None),
    }
}

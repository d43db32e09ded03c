//! Update package writer
//!
//! A package is a ustar archive. Its first entry is [`ISSUE_FILE_NAME`], the target
//! revision record as pretty-printed JSON, followed by one entry per [`DiffItem`] in
//! diff order. Headers carry fixed metadata (mode 0644, uid/gid 0, mtime 0) so the
//! same inputs always produce the same bytes.
//!
//! The archive is staged in a temporary file and only renamed onto the output path
//! once every entry has been written and verified. The output path is never opened
//! for writing.
#[cfg(test)]
mod tests;

use crate::diff::DiffItem;
use crate::error::UpdateError;
use crate::feed::BlobStore;
use crate::manifest::{ISSUE_FILE_NAME, RevisionHead};
use crate::retrieve::{self, VerifyingReader};
use crate::util::{fsync_dir, human_size, parent_dir};
use std::fs::{File, Permissions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use ulid::Ulid;

const ENTRY_MODE: u32 = 0o644;

/// Where packages are staged, where they end up, and where reused content is read.
#[derive(Debug, Clone)]
pub struct Packager {
    pub staging_dir: PathBuf,
    pub output: PathBuf,
    pub boot_dir: PathBuf,
}

impl Packager {
    /// Writes the package for `head` and moves it onto the output path.
    ///
    /// Blobs must already be local. This blocks on file I/O and belongs on a
    /// blocking thread.
    #[tracing::instrument(skip_all, fields(cycle = %cycle))]
    pub fn write(
        &self,
        head: &RevisionHead,
        items: &[DiffItem],
        blobs: &dyn BlobStore,
        cycle: Ulid,
    ) -> Result<(), UpdateError> {
        let staged = tempfile::Builder::new()
            .prefix(&format!(".treos-update-{cycle}-"))
            .suffix(".tar")
            .tempfile_in(&self.staging_dir)
            .map_err(|e| UpdateError::packaging(&self.staging_dir, e))?;
        let staged_path = staged.path().to_owned();
        tracing::debug!("Staging package in {}", staged_path.display());

        let mut builder = tar::Builder::new(BufWriter::new(staged));
        let issue = head
            .to_pretty_json()
            .map_err(|e| UpdateError::packaging(&staged_path, e.into()))?;
        append_entry(&mut builder, ISSUE_FILE_NAME, issue.len() as u64, issue.as_bytes())
            .map_err(|e| UpdateError::packaging(&staged_path, e))?;

        for item in items {
            self.append_item(&mut builder, item, blobs, &staged_path)?;
        }

        let staged = builder
            .into_inner()
            .and_then(|writer| writer.into_inner().map_err(io::IntoInnerError::into_error))
            .map_err(|e| UpdateError::packaging(&staged_path, e))?;
        staged
            .as_file()
            .set_permissions(Permissions::from_mode(ENTRY_MODE))
            .and_then(|()| staged.as_file().sync_all())
            .map_err(|e| UpdateError::packaging(&staged_path, e))?;
        let size = staged.as_file().metadata().map(|m| m.len()).unwrap_or(0);
        tracing::info!(
            "Written {} ({}), moving to {}",
            staged_path.display(),
            human_size(size),
            self.output.display()
        );

        commit(staged, &self.output)
    }

    fn append_item<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        item: &DiffItem,
        blobs: &dyn BlobStore,
        staged_path: &Path,
    ) -> Result<(), UpdateError> {
        let filename = item.filename();
        match (item, retrieve::open_source(item, &self.boot_dir, blobs)?) {
            (DiffItem::Generated { content, .. }, _) => {
                tracing::info!("Writing generated {filename}");
                append_entry(builder, filename, item.size(), content.as_bytes())
                    .map_err(|e| UpdateError::packaging(staged_path, e))
            }
            (DiffItem::Reuse { checksum, .. } | DiffItem::Fetch { checksum, .. }, Some(source)) => {
                let mut progress = retrieve::progress_for(filename, checksum.size);
                let mut reader = VerifyingReader::new(source, filename, checksum.size)
                    .with_progress(progress.as_mut());
                append_entry(builder, filename, checksum.size, &mut reader)
                    .map_err(|e| UpdateError::packaging(staged_path, e))?;
                reader.verify(checksum)?;
                Ok(())
            }
            (_, None) => Err(UpdateError::Manifest(format!("no content source for {filename}"))),
        }
    }
}

fn header(name: &str, size: u64) -> io::Result<tar::Header> {
    let mut header = tar::Header::new_ustar();
    header.set_path(name)?;
    header.set_size(size);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(ENTRY_MODE);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    Ok(header)
}

fn append_entry<W: Write, R: Read>(
    builder: &mut tar::Builder<W>,
    name: &str,
    size: u64,
    data: R,
) -> io::Result<()> {
    builder.append(&header(name, size)?, data)
}

/// Moves a synced staging file onto `output`, then syncs the output directory.
fn commit(staged: NamedTempFile, output: &Path) -> Result<(), UpdateError> {
    let staged = match staged.persist(output) {
        Ok(_) => None,
        Err(e) if e.error.kind() == io::ErrorKind::CrossesDevices => Some(e.file),
        Err(e) => return Err(UpdateError::packaging(output, e.error)),
    };
    if let Some(staged) = staged {
        tracing::debug!("Staging directory is on another filesystem, copying");
        copy_across(staged, output)?;
    }
    fsync_dir(parent_dir(output)).map_err(|e| UpdateError::packaging(parent_dir(output), e))
}

/// Copies into a sibling of `output` so the final step is still a rename.
fn copy_across(mut staged: NamedTempFile, output: &Path) -> Result<(), UpdateError> {
    let dir = parent_dir(output);
    let mut sibling = tempfile::Builder::new()
        .prefix(".treos-update-")
        .suffix(".tar")
        .tempfile_in(dir)
        .map_err(|e| UpdateError::packaging(dir, e))?;
    let sibling_path = sibling.path().to_owned();
    staged
        .seek(SeekFrom::Start(0))
        .and_then(|_| io::copy(&mut staged, &mut sibling))
        .and_then(|_| sibling.as_file().set_permissions(Permissions::from_mode(ENTRY_MODE)))
        .and_then(|()| sibling.as_file().sync_all())
        .map_err(|e| UpdateError::packaging(&sibling_path, e))?;
    sibling
        .persist(output)
        .map_err(|e| UpdateError::packaging(output, e.error))?;
    Ok(())
}

fn open_archive(path: &Path) -> Result<tar::Archive<File>, UpdateError> {
    let file = File::open(path).map_err(|source| UpdateError::LocalRead {
        path: path.to_owned(),
        source,
    })?;
    Ok(tar::Archive::new(file))
}

fn read_error(path: &Path) -> impl FnOnce(io::Error) -> UpdateError + '_ {
    move |source| UpdateError::LocalRead {
        path: path.to_owned(),
        source,
    }
}

/// Reads the embedded issue of an existing package.
pub fn read_issue(path: &Path) -> Result<Vec<u8>, UpdateError> {
    let mut archive = open_archive(path)?;
    for entry in archive.entries().map_err(read_error(path))? {
        let mut entry = entry.map_err(read_error(path))?;
        if entry.path().map_err(read_error(path))?.as_os_str() == ISSUE_FILE_NAME {
            let mut content = Vec::new();
            entry.read_to_end(&mut content).map_err(read_error(path))?;
            return Ok(content);
        }
    }
    Err(UpdateError::Manifest(format!(
        "No entry for {ISSUE_FILE_NAME} found in tar"
    )))
}

/// One entry of an existing package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    pub name: String,
    pub size: u64,
}

/// Lists the entries of an existing package in archive order.
pub fn list_entries(path: &Path) -> Result<Vec<PackageEntry>, UpdateError> {
    let mut archive = open_archive(path)?;
    let mut entries = Vec::new();
    for entry in archive.entries().map_err(read_error(path))? {
        let entry = entry.map_err(read_error(path))?;
        let name = entry.path().map_err(read_error(path))?.display().to_string();
        entries.push(PackageEntry {
            name,
            size: entry.size(),
        });
    }
    Ok(entries)
}

//! Computes what an update package must contain.
use crate::bootloader::{self, BootVars};
use crate::error::UpdateError;
use crate::manifest::{ChecksumIndex, ContentId, Issue};

/// One entry of an update package, besides the issue itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffItem {
    /// The content already exists locally under another name.
    Reuse {
        filename: String,
        checksum: ContentId,
        source: String,
    },
    /// The content must come from the blob store.
    Fetch {
        filename: String,
        checksum: ContentId,
    },
    /// A regenerated bootloader file.
    Generated { filename: String, content: String },
}

impl DiffItem {
    pub fn filename(&self) -> &str {
        match self {
            Self::Reuse { filename, .. }
            | Self::Fetch { filename, .. }
            | Self::Generated { filename, .. } => filename,
        }
    }

    /// Byte length of the packed entry.
    pub fn size(&self) -> u64 {
        match self {
            Self::Reuse { checksum, .. } | Self::Fetch { checksum, .. } => checksum.size,
            Self::Generated { content, .. } => content.len() as u64,
        }
    }
}

/// Files of `target` whose checksum differs from the same name in `current`, in the
/// target's declared order. Content found under another local name is reused.
pub fn diff_files(current: &ChecksumIndex, target: &ChecksumIndex) -> Vec<DiffItem> {
    target
        .iter()
        .filter(|(filename, checksum)| {
            if current.get(filename.as_str()) == Some(*checksum) {
                tracing::info!("{filename} is up to date");
                return false;
            }
            tracing::info!("{filename} needs update");
            true
        })
        .map(|(filename, checksum)| {
            let local = current
                .iter()
                .find(|(_, local_checksum)| *local_checksum == checksum);
            match local {
                Some((source, _)) => DiffItem::Reuse {
                    filename: filename.clone(),
                    checksum: checksum.clone(),
                    source: source.clone(),
                },
                None => DiffItem::Fetch {
                    filename: filename.clone(),
                    checksum: checksum.clone(),
                },
            }
        })
        .collect()
}

/// Full package contents for moving from `current` to `target`: changed files, then
/// regenerated loader files if the bootloader configuration changed.
pub fn plan(
    current: &Issue,
    target: &Issue,
    vars: &BootVars,
) -> Result<Vec<DiffItem>, UpdateError> {
    let mut items = diff_files(&current.checksums()?, &target.checksums()?);

    if bootloader::config_changed(&current.bootloader, &target.bootloader) {
        tracing::info!("Bootloader config has changed");
        items.extend(
            bootloader::generate(&target.bootloader, vars)
                .into_iter()
                .map(|(filename, content)| DiffItem::Generated { filename, content }),
        );
    } else {
        tracing::info!("Bootloader config is identical");
    }

    Ok(items)
}

//! Issue manifests
//!
//! An issue describes one point-in-time system state: which kernels, initcpios and
//! disk images are installed, with their checksums and sizes, and how the bootloader
//! is configured. The device's current issue is loaded once at startup; candidate
//! issues arrive embedded in revision records from the feed.
pub mod checksum;
mod revision_ref;

pub use checksum::{BlobRef, ContentId};
pub use revision_ref::RevisionId;

use crate::bootloader::BootloaderConfig;
use crate::error::UpdateError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Component, Path};

/// Name of the issue entry at the head of every update package.
pub const ISSUE_FILE_NAME: &str = "treos-issue.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Kernel,
    Initcpio,
    DiskImage,
}

impl FileCategory {
    /// Categories in the order their files are diffed and packed.
    pub const ALL: [Self; 3] = [Self::Kernel, Self::Initcpio, Self::DiskImage];

    /// The issue key holding files of this category.
    pub const fn key(self) -> &'static str {
        match self {
            Self::Kernel => "kernels",
            Self::Initcpio => "initcpios",
            Self::DiskImage => "diskImages",
        }
    }
}

/// One file as written in an issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileSpec {
    #[serde(default)]
    pub path: String,
    pub checksum: String,
    pub size: u64,
}

/// A validated file of an issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub category: FileCategory,
    pub path: String,
    pub checksum: ContentId,
}

/// File name to checksum, in declared order, one entry per name.
pub type ChecksumIndex = IndexMap<String, ContentId>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    #[serde(default)]
    pub kernels: IndexMap<String, FileSpec>,
    #[serde(default)]
    pub initcpios: IndexMap<String, FileSpec>,
    #[serde(default)]
    pub disk_images: IndexMap<String, FileSpec>,
    #[serde(default)]
    pub bootloader: BootloaderConfig,
    /// Root of the revision lineage this issue belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_root: Option<String>,
    /// The revision this issue was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_branch: Option<String>,
}

impl Issue {
    fn category(&self, category: FileCategory) -> &IndexMap<String, FileSpec> {
        match category {
            FileCategory::Kernel => &self.kernels,
            FileCategory::Initcpio => &self.initcpios,
            FileCategory::DiskImage => &self.disk_images,
        }
    }

    /// All files, kernels first, then initcpios, then disk images.
    pub fn files(&self) -> Result<Vec<FileEntry>, UpdateError> {
        let mut files = Vec::new();
        for category in FileCategory::ALL {
            for (name, spec) in self.category(category) {
                check_file_name(name)?;
                let checksum = ContentId::parse(&spec.checksum, spec.size)
                    .map_err(|e| UpdateError::Manifest(format!("{name}: {e}")))?;
                files.push(FileEntry {
                    name: name.clone(),
                    category,
                    path: spec.path.clone(),
                    checksum,
                });
            }
        }
        Ok(files)
    }

    /// Builds the checksum index. A name listed in more than one category keeps its
    /// first position and its last checksum.
    pub fn checksums(&self) -> Result<ChecksumIndex, UpdateError> {
        Ok(self
            .files()?
            .into_iter()
            .map(|file| (file.name, file.checksum))
            .collect())
    }
}

/// File names become archive entry names and paths under the boot directory.
fn check_file_name(name: &str) -> Result<(), UpdateError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == name => Ok(()),
        _ => Err(UpdateError::Manifest(format!(
            "file name '{name}' must be a plain file name"
        ))),
    }
}

/// A revision record as published on the feed: `{key, value: {content: <issue>, ...}}`.
///
/// The raw record is kept so it can be re-emitted exactly as received,
/// including fields this crate does not interpret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct RevisionHead {
    key: String,
    issue: Issue,
    raw: Value,
}

impl RevisionHead {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn issue(&self) -> &Issue {
        &self.issue
    }

    /// Root of this revision's lineage: the declared `revisionRoot`, else the key itself.
    pub fn revision_root(&self) -> &str {
        self.issue.revision_root.as_deref().unwrap_or(&self.key)
    }

    /// Publication timestamp, if the record carries one.
    pub fn timestamp(&self) -> Option<f64> {
        self.raw.pointer("/value/timestamp").and_then(Value::as_f64)
    }

    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.raw)
    }
}

impl TryFrom<Value> for RevisionHead {
    type Error = String;

    fn try_from(raw: Value) -> Result<Self, Self::Error> {
        let key = raw
            .get("key")
            .and_then(Value::as_str)
            .ok_or("revision record has no key")?
            .to_owned();
        let content = raw
            .pointer("/value/content")
            .ok_or_else(|| format!("revision {key} has no content"))?;
        let issue = Issue::deserialize(content)
            .map_err(|e| format!("revision {key} carries an invalid issue: {e}"))?;
        Ok(Self { key, issue, raw })
    }
}

impl From<RevisionHead> for Value {
    fn from(head: RevisionHead) -> Self {
        head.raw
    }
}

/// The system currently installed on the device.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentSystem {
    /// Key of the revision the system was installed from, when the issue file is a full record
    pub key: Option<String>,
    pub issue: Issue,
}

impl CurrentSystem {
    /// Parses an issue file holding either a full revision record or a bare issue.
    pub fn from_json(content: &[u8]) -> Result<Self, UpdateError> {
        let value: Value = serde_json::from_slice(content)
            .map_err(|e| UpdateError::Manifest(format!("failed to parse issue: {e}")))?;
        if value.get("key").is_some() && value.get("value").is_some() {
            let head = RevisionHead::try_from(value).map_err(UpdateError::Manifest)?;
            return Ok(Self {
                key: Some(head.key),
                issue: head.issue,
            });
        }
        let issue = Issue::deserialize(&value)
            .map_err(|e| UpdateError::Manifest(format!("failed to parse issue: {e}")))?;
        Ok(Self { key: None, issue })
    }

    pub fn from_file(path: &Path) -> Result<Self, UpdateError> {
        tracing::info!("Reading {}", path.display());
        let content = std::fs::read(path).map_err(|e| {
            UpdateError::Usage(format!("Failed to read issue file {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    /// Loads the current system. A pending update package at `output` wins over the
    /// issue file, so a new package builds on top of the one not yet applied.
    pub fn load(issue_file: &Path, output: &Path) -> Result<Self, UpdateError> {
        if output.exists() {
            tracing::info!(
                "Output file {} exists. Reading packed {ISSUE_FILE_NAME}",
                output.display()
            );
            let content = crate::package::read_issue(output)?;
            return Self::from_json(&content);
        }
        Self::from_file(issue_file)
    }

    /// Pointer to follow when none is given: the lineage root, else the system's own revision.
    pub fn default_pointer(&self) -> Option<&str> {
        self.issue
            .revision_root
            .as_deref()
            .or(self.key.as_deref())
    }
}

//! Fixtures shared by the unit tests.
use crate::manifest::RevisionHead;
use crate::manifest::checksum::encode_digest;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// A well-formed message reference unique to `n`.
pub fn revision_id(n: u8) -> String {
    format!("%{}.sha256", STANDARD.encode([n; 32]))
}

/// Base64 sha256 digest of `data`, as issues declare it.
pub fn digest_of(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    encode_digest(hasher)
}

/// Issue file entry for `content`.
pub fn file_for(content: &[u8]) -> Value {
    json!({
        "path": "",
        "checksum": format!("{}.sha256", digest_of(content)),
        "size": content.len(),
    })
}

/// A revision record around `issue`.
pub fn record_with_issue(
    key: &str,
    mut issue: Value,
    root: Option<&str>,
    branch: Option<&str>,
    timestamp: u64,
) -> RevisionHead {
    if let Some(root) = root {
        issue["revisionRoot"] = json!(root);
    }
    if let Some(branch) = branch {
        issue["revisionBranch"] = json!(branch);
    }
    RevisionHead::try_from(json!({
        "key": key,
        "value": {"author": "@publisher", "timestamp": timestamp, "content": issue},
    }))
    .unwrap()
}

/// A revision record with a small fixed issue.
pub fn record(key: &str, root: Option<&str>, branch: Option<&str>, timestamp: u64) -> RevisionHead {
    record_with_issue(
        key,
        json!({"kernels": {"bzImage": file_for(key.as_bytes())}}),
        root,
        branch,
        timestamp,
    )
}

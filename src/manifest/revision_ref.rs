use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;

use crate::error::UpdateError;

/// A message reference naming either one revision or the root of a revision lineage.
///
/// Well-formed references look like `%<base64 sha256>.sha256`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionId(String);

impl RevisionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for RevisionId {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_message_ref(s) {
            Ok(Self(s.to_owned()))
        } else {
            Err(UpdateError::InvalidReference(s.to_owned()))
        }
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq<str> for RevisionId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

fn is_message_ref(s: &str) -> bool {
    s.strip_prefix('%')
        .and_then(|rest| rest.strip_suffix(".sha256"))
        .and_then(|digest| STANDARD.decode(digest).ok())
        .is_some_and(|bytes| bytes.len() == 32)
}

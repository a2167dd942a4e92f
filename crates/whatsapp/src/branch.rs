use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Prefix of each branch's credential directory under the sessions root.
pub const SESSION_DIR_PREFIX: &str = "session_";

const MAX_LEN: usize = 64;

/// Store branch identifier: the partition key of every session.
///
/// Restricted to ASCII alphanumerics, `-` and `_` so it can be embedded in a
/// directory name as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchId(String);

impl BranchId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(id))
        } else {
            Err(Error::InvalidBranch(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `session_<id>`
    pub fn dir_name(&self) -> String {
        format!("{SESSION_DIR_PREFIX}{}", self.0)
    }

    /// Inverse of [`BranchId::dir_name`]; `None` for unrelated directory names.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        name.strip_prefix(SESSION_DIR_PREFIX)
            .and_then(|id| Self::new(id).ok())
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BranchId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for BranchId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<BranchId> for String {
    fn from(id: BranchId) -> Self {
        id.0
    }
}

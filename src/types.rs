//! Shared types for git-janitor

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Error type for parsing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("repository name cannot be empty")]
    Empty,
    #[error("repository name cannot contain '.' or '..' segments: {0}")]
    RelativeSegment(String),
    #[error("invalid character in repository name: {0:?}")]
    InvalidCharacter(char),
}

/// A normalized logical repository name, e.g. `github.com/gorilla/mux`.
///
/// Normalization:
/// - Surrounding whitespace and slashes are trimmed
/// - A trailing `.git` is stripped
/// - Names hosted on `github.com/` are lower-cased (GitHub is case-insensitive)
///
/// Names read back from disk go through [`RepoName::normalized`], which applies
/// the same rules without validation. Names coming from users go through
/// [`FromStr`], which also rejects traversal segments and control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RepoName(String);

impl RepoName {
    /// Builds a name from an already trusted string, applying normalization only.
    pub fn normalized(s: &str) -> Self {
        let mut name = s.trim().trim_matches('/');
        if let Some(stripped) = name.strip_suffix(".git") {
            name = stripped.trim_end_matches('/');
        }

        if name.len() >= "github.com/".len()
            && name[.."github.com/".len()].eq_ignore_ascii_case("github.com/")
        {
            return RepoName(name.to_ascii_lowercase());
        }

        RepoName(name.to_string())
    }

    /// Returns the name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the slash separated components of the name.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }
}

impl FromStr for RepoName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = RepoName::normalized(s);
        if name.0.is_empty() {
            return Err(ParseError::Empty);
        }

        for c in name.0.chars() {
            if c.is_control() || c == '\\' {
                return Err(ParseError::InvalidCharacter(c));
            }
        }

        if name.0.split('/').any(|seg| seg == "." || seg == "..") {
            return Err(ParseError::RelativeSegment(name.0));
        }

        Ok(name)
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

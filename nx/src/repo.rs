//! Repository identity and commit hash types

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating a repository identity
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepoError {
    #[error("invalid repo '{0}', need 'owner/name' using only letters, digits, '.', '_' or '-'")]
    InvalidRepository(String),

    #[error("invalid branch '{0}'")]
    InvalidBranch(String),
}

/// Opaque commit identifier as advertised by the remote
///
/// Any non-empty token without whitespace or NUL is accepted; no length or
/// hex encoding is assumed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitHash(String);

impl CommitHash {
    /// Wrap a token, rejecting empty input and embedded whitespace/NUL
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        if token.is_empty() || token.chars().any(|c| c.is_whitespace() || c == '\0') {
            return None;
        }
        Some(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `n` characters, for log lines
    pub fn short(&self, n: usize) -> &str {
        match self.0.char_indices().nth(n) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The `(owner, name, branch)` triple being deployed from
///
/// Constructed once at startup through [`RepositoryIdentity::new`], which is
/// the only place the owner/name charset is enforced. Everything downstream
/// (remote command quoting, flake locator) relies on that validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryIdentity {
    owner: String,
    name: String,
    branch: String,
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl RepositoryIdentity {
    /// Parse `owner/name` and pair it with a branch
    pub fn new(repo: &str, branch: &str) -> Result<Self, RepoError> {
        let (owner, name) = repo
            .split_once('/')
            .ok_or_else(|| RepoError::InvalidRepository(repo.to_string()))?;

        if !is_valid_segment(owner) || !is_valid_segment(name) {
            return Err(RepoError::InvalidRepository(repo.to_string()));
        }

        if branch.is_empty() || branch.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(RepoError::InvalidBranch(branch.to_string()));
        }

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
            branch: branch.to_string(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Repository path on the remote host (`owner/name`)
    pub fn path(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepositoryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.name, self.branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_hash_accepts_tokens() {
        let hash = CommitHash::new("aaa111").unwrap();
        assert_eq!(hash.as_str(), "aaa111");
        assert_eq!(hash.to_string(), "aaa111");
    }

    #[test]
    fn test_commit_hash_rejects_empty_and_whitespace() {
        assert!(CommitHash::new("").is_none());
        assert!(CommitHash::new("abc def").is_none());
        assert!(CommitHash::new("abc\n").is_none());
        assert!(CommitHash::new("abc\0").is_none());
    }

    #[test]
    fn test_commit_hash_short() {
        let hash = CommitHash::new("0123456789abcdef").unwrap();
        assert_eq!(hash.short(7), "0123456");
        assert_eq!(hash.short(64), "0123456789abcdef");
    }

    #[test]
    fn test_repository_identity_parses_owner_and_name() {
        let repo = RepositoryIdentity::new("mamaart/nix-config", "main").unwrap();
        assert_eq!(repo.owner(), "mamaart");
        assert_eq!(repo.name(), "nix-config");
        assert_eq!(repo.branch(), "main");
        assert_eq!(repo.path(), "mamaart/nix-config");
        assert_eq!(repo.to_string(), "mamaart/nix-config@main");
    }

    #[test]
    fn test_repository_identity_allows_dots_and_underscores() {
        assert!(RepositoryIdentity::new("some.user/my_repo.v2", "release-1.0").is_ok());
    }

    #[test]
    fn test_repository_identity_rejects_bad_shapes() {
        for bad in ["", "owner", "owner/", "/name", "a/b/c", "owner/na me"] {
            assert_eq!(
                RepositoryIdentity::new(bad, "main"),
                Err(RepoError::InvalidRepository(bad.to_string())),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_repository_identity_rejects_injection() {
        assert!(RepositoryIdentity::new("owner/name'; rm -rf /", "main").is_err());
        assert!(RepositoryIdentity::new("owner/$(id)", "main").is_err());
        assert!(RepositoryIdentity::new("owner/name`id`", "main").is_err());
    }

    #[test]
    fn test_repository_identity_rejects_bad_branch() {
        assert_eq!(
            RepositoryIdentity::new("owner/name", ""),
            Err(RepoError::InvalidBranch(String::new()))
        );
        assert!(RepositoryIdentity::new("owner/name", "feature branch").is_err());
    }
}

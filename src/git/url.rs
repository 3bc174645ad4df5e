//! Repository identity normalization.
//!
//! Parses repository locations into a canonical host/owner/repo triple so that
//! the same repository referenced through different URL syntaxes maps to one
//! store.

use std::fmt;

use super::GionError;

/// Canonical identity of a remote repository.
///
/// # Accepted location formats
///
/// - `git@<host>:<owner>/<repo>.git`
/// - `https://<host>/<owner>/<repo>(.git)`
/// - `file:///<any>/<host>/<owner>/<repo>(.git)`: the last three path segments
///   are taken as host, owner and repo
///
/// Shorthand without a scheme (`owner/repo`, `host/owner/repo`) is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoIdentity {
    host: String,
    owner: String,
    repo: String,
}

impl RepoIdentity {
    /// Parse a repository location.
    pub fn parse(location: &str) -> Result<Self, GionError> {
        let trimmed = location.trim();
        let invalid = |reason: &str| GionError::InvalidLocation {
            location: location.to_string(),
            reason: reason.to_string(),
        };
        if trimmed.is_empty() {
            return Err(invalid("location is empty"));
        }

        let (host, path) = if let Some(rest) = trimmed.strip_prefix("git@") {
            // git@github.com:owner/repo.git
            let (host, path) = rest
                .split_once(':')
                .ok_or_else(|| invalid("ssh location must look like git@host:owner/repo"))?;
            (host.to_string(), path.to_string())
        } else if let Some(rest) = trimmed.strip_prefix("https://") {
            // https://github.com/owner/repo(.git), userinfo and port are dropped
            let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
            let host = authority.rsplit('@').next().unwrap_or(authority);
            let host = host.split(':').next().unwrap_or(host);
            let path = path.split(['?', '#']).next().unwrap_or(path);
            (host.to_string(), path.to_string())
        } else if let Some(rest) = trimmed.strip_prefix("file://") {
            // file:///srv/mirrors/github.com/owner/repo.git
            let path = match rest.find('/') {
                Some(idx) => &rest[idx..],
                None => "",
            };
            let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
            let [.., host, owner, repo] = parts.as_slice() else {
                return Err(invalid("file location must end with <host>/<owner>/<repo>"));
            };
            (host.to_string(), format!("{owner}/{repo}"))
        } else {
            return Err(invalid("location must be ssh (git@), https:// or file://"));
        };

        let (owner, repo) = split_owner_repo(&path).map_err(|reason| invalid(reason))?;
        if host.is_empty() {
            return Err(invalid("host is required"));
        }

        Ok(Self {
            host,
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }

    /// Rebuild an identity from its `host/owner/repo` key.
    pub fn from_key(key: &str) -> Result<Self, GionError> {
        let invalid = |reason: &str| GionError::InvalidLocation {
            location: key.to_string(),
            reason: reason.to_string(),
        };
        let mut parts = key.trim().trim_matches('/').split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(owner), Some(repo), None)
                if !host.is_empty() && !owner.is_empty() && !repo.is_empty() =>
            {
                Ok(Self {
                    host: host.to_string(),
                    owner: owner.to_string(),
                    repo: repo.strip_suffix(".git").unwrap_or(repo).to_string(),
                })
            }
            _ => Err(invalid("key must be <host>/<owner>/<repo>")),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The repository name without `.git` suffix; also the default alias.
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Stable key in `host/owner/repo` form.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.host, self.owner, self.repo)
    }

    /// Conventional ssh location for this identity.
    pub fn ssh_location(&self) -> String {
        format!("git@{}:{}/{}.git", self.host, self.owner, self.repo)
    }
}

impl fmt::Display for RepoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.host, self.owner, self.repo)
    }
}

/// Resolve something a plan may name a repository by: a full location is
/// returned as-is, a bare `host/owner/repo` key becomes its ssh location.
pub fn resolve_location(input: &str) -> Result<String, GionError> {
    let trimmed = input.trim();
    match RepoIdentity::parse(trimmed) {
        Ok(_) => Ok(trimmed.to_string()),
        Err(parse_err) => match RepoIdentity::from_key(trimmed) {
            // A key looks like shorthand, so only accept it when it has a dotted host.
            Ok(identity) if identity.host().contains('.') => Ok(identity.ssh_location()),
            _ => Err(parse_err),
        },
    }
}

fn split_owner_repo(path: &str) -> Result<(&str, &str), &'static str> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err("repo path is empty");
    }
    let mut parts = trimmed.split('/');
    let (Some(owner), Some(repo), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err("repo path must be <owner>/<repo>");
    };
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if owner.is_empty() || repo.is_empty() {
        return Err("owner/repo cannot be empty");
    }
    Ok((owner, repo))
}

//! Repository metadata: tracked files, remote URL and the repository identity key.

use anyhow::{bail, Context};
use std::path::Path;
use std::process::Command;

/// Supplies version-control facts about a repository. Both calls may fail;
/// callers degrade instead of propagating.
pub trait RepoMetadata: Send + Sync {
    /// Tracked file paths relative to `repo_root`, `/`-separated.
    fn list_tracked_files(&self, repo_root: &Path) -> anyhow::Result<Vec<String>>;

    fn remote_url(&self, repo_root: &Path) -> anyhow::Result<Option<String>>;
}

/// Reads metadata from the `git` CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitMetadata;

impl RepoMetadata for GitMetadata {
    fn list_tracked_files(&self, repo_root: &Path) -> anyhow::Result<Vec<String>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo_root)
            .args(["ls-files", "-z"])
            .output()
            .context("failed to spawn git ls-files")?;
        if !output.status.success() {
            bail!(
                "git ls-files exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output
            .stdout
            .split(|b| *b == 0)
            .filter(|entry| !entry.is_empty())
            .map(|entry| String::from_utf8_lossy(entry).into_owned())
            .collect())
    }

    fn remote_url(&self, repo_root: &Path) -> anyhow::Result<Option<String>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo_root)
            .args(["config", "--get", "remote.origin.url"])
            .output()
            .context("failed to spawn git config")?;
        // exit code 1 means "key not set"
        if !output.status.success() {
            return Ok(None);
        }
        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!url.is_empty()).then_some(url))
    }
}

/// For plain directories: listing always fails (forcing the filesystem scan)
/// and there is no remote.
#[derive(Debug, Default, Clone, Copy)]
pub struct UntrackedMetadata;

impl RepoMetadata for UntrackedMetadata {
    fn list_tracked_files(&self, repo_root: &Path) -> anyhow::Result<Vec<String>> {
        bail!("{} is not under version control", repo_root.display())
    }

    fn remote_url(&self, _repo_root: &Path) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Drop credentials (`user@`, `user:token@`) that precede the host.
#[must_use]
pub fn sanitize_remote_url(url: &str) -> String {
    let url = url.trim();
    if let Some((scheme, rest)) = url.split_once("://") {
        let (authority, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };
        let host = authority
            .rsplit_once('@')
            .map_or(authority, |(_, host)| host);
        return format!("{scheme}://{host}{path}");
    }

    // scp-like: [user@]host:path
    if let Some((head, path)) = url.split_once(':') {
        if let Some((_, host)) = head.rsplit_once('@') {
            return format!("{host}:{path}");
        }
    }
    url.to_string()
}

/// Stable identity for a logical repository across snapshots.
#[must_use]
pub fn repo_key(repo_root: &Path, remote_url: Option<&str>) -> String {
    let path = repo_root.to_string_lossy();
    match remote_url.map(sanitize_remote_url) {
        Some(remote) if !remote.is_empty() => format!("{path}|{remote}"),
        _ => path.into_owned(),
    }
}

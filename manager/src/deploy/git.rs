//! Git repositories backing git-sourced bots

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::deploy::process::{run_command, CommandSpec, LineSink};
use crate::errors::BotError;
use crate::storage::settings::TimeoutSettings;

/// Branch and last commit of a checkout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub branch: String,
    pub commit: String,
    pub commit_message: String,
    pub commit_author: String,
    pub commit_date: String,
}

/// Commits the checkout is ahead of / behind its upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AheadBehind {
    pub ahead: u32,
    pub behind: u32,
}

/// Source control capability
#[async_trait]
pub trait Repository: Send + Sync {
    /// Clone `url` at `branch` into `target`
    async fn clone_repo(
        &self,
        url: &str,
        branch: &str,
        target: &Path,
        sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError>;

    /// Fast-forward an existing checkout
    async fn pull(&self, dir: &Path, branch: &str, sink: Option<&LineSink<'_>>)
        -> Result<(), BotError>;

    async fn info(&self, dir: &Path) -> Result<RepoInfo, BotError>;

    /// Fetch, then count commits against the upstream
    async fn ahead_behind(&self, dir: &Path) -> Result<AheadBehind, BotError>;
}

/// `git` CLI implementation
pub struct GitCli {
    timeouts: TimeoutSettings,
}

impl GitCli {
    pub fn new(timeouts: TimeoutSettings) -> Self {
        Self { timeouts }
    }

    fn git(&self, dir: Option<&Path>) -> CommandSpec {
        let spec = CommandSpec::new("git")
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(self.timeouts.quick())
            .kill_grace(self.timeouts.kill_grace());
        match dir {
            Some(dir) => spec.current_dir(dir),
            None => spec,
        }
    }
}

const LOG_SEPARATOR: char = '\u{1f}';

fn parse_log_line(branch: &str, line: &str) -> Result<RepoInfo, BotError> {
    let mut fields = line.trim_end().split(LOG_SEPARATOR);
    let mut next = || fields.next().unwrap_or_default().to_string();
    let info = RepoInfo {
        branch: branch.to_string(),
        commit: next(),
        commit_message: next(),
        commit_author: next(),
        commit_date: next(),
    };
    if info.commit.is_empty() {
        return Err(BotError::Internal("git log returned no commit".to_string()));
    }
    Ok(info)
}

fn parse_counts(output: &str) -> Result<AheadBehind, BotError> {
    let mut counts = output.split_whitespace().map(str::parse::<u32>);
    match (counts.next(), counts.next()) {
        (Some(Ok(ahead)), Some(Ok(behind))) => Ok(AheadBehind { ahead, behind }),
        _ => Err(BotError::Internal(format!(
            "unexpected rev-list output: {}",
            output.trim()
        ))),
    }
}

#[async_trait]
impl Repository for GitCli {
    async fn clone_repo(
        &self,
        url: &str,
        branch: &str,
        target: &Path,
        sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError> {
        info!("Cloning {} ({}) into {}", url, branch, target.display());
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let spec = self
            .git(None)
            .args(["clone", "--progress", "--branch", branch, "--single-branch", url])
            .arg(target.display().to_string())
            .timeout(self.timeouts.build());
        run_command(&spec, sink).await?;
        Ok(())
    }

    async fn pull(
        &self,
        dir: &Path,
        branch: &str,
        sink: Option<&LineSink<'_>>,
    ) -> Result<(), BotError> {
        info!("Pulling {} in {}", branch, dir.display());
        let spec = self
            .git(Some(dir))
            .args(["pull", "--ff-only", "origin", branch])
            .timeout(self.timeouts.build());
        run_command(&spec, sink).await?;
        Ok(())
    }

    async fn info(&self, dir: &Path) -> Result<RepoInfo, BotError> {
        let branch = run_command(
            &self
                .git(Some(dir))
                .args(["rev-parse", "--abbrev-ref", "HEAD"]),
            None,
        )
        .await?;
        let log = run_command(
            &self
                .git(Some(dir))
                .args(["log", "-1", "--format=%H%x1f%s%x1f%an%x1f%aI"]),
            None,
        )
        .await?;
        parse_log_line(branch.stdout.trim(), &log.stdout)
    }

    async fn ahead_behind(&self, dir: &Path) -> Result<AheadBehind, BotError> {
        debug!("Fetching upstream of {}", dir.display());
        run_command(&self.git(Some(dir)).args(["fetch", "--quiet", "origin"]), None).await?;
        let counts = run_command(
            &self
                .git(Some(dir))
                .args(["rev-list", "--left-right", "--count", "HEAD...@{upstream}"]),
            None,
        )
        .await?;
        parse_counts(&counts.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_line() {
        let line = "0123abcd\u{1f}Fix: handle colons\u{1f}Dana\u{1f}2026-01-02T03:04:05+00:00\n";
        let info = parse_log_line("main", line).unwrap();
        assert_eq!(info.commit, "0123abcd");
        assert_eq!(info.commit_message, "Fix: handle colons");
        assert_eq!(info.commit_author, "Dana");
        assert_eq!(info.branch, "main");
    }

    #[test]
    fn test_parse_counts() {
        assert_eq!(
            parse_counts("2\t5\n").unwrap(),
            AheadBehind {
                ahead: 2,
                behind: 5
            }
        );
        assert!(parse_counts("").is_err());
    }
}

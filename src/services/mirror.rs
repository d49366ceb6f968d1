use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};
use url::Url;

use crate::services::cache::CacheSnapshot;
use crate::services::refresh::RefreshHook;
use crate::utils::config::GithubSettings;

/// Post-swap hook that mirrors the published views into a git repository:
/// one file for the full working set and one per warmed site. Runs entirely
/// through git subprocesses; any failure is logged and swallowed so cache
/// publication is never affected.
pub struct GitMirror {
    settings: GithubSettings,
}

impl GitMirror {
    pub fn new(settings: GithubSettings) -> Self {
        GitMirror { settings }
    }

    fn remote_url(&self) -> String {
        let repo_url = &self.settings.repo_url;
        if !self.settings.token.is_empty() && !repo_url.contains('@') {
            repo_url.replacen("https://", &format!("https://{}@", self.settings.token), 1)
        } else {
            repo_url.clone()
        }
    }

    pub fn site_filename(site_url: &str) -> String {
        Url::parse(site_url)
            .ok()
            .and_then(|url| url.host_str().map(|host| host.replace('.', "_")))
            .map(|host| format!("{host}.txt"))
            .unwrap_or_else(|| "unknown_site.txt".to_string())
    }

    async fn run_git(&self, args: &[&str], cwd: Option<&Path>) -> Result<String> {
        let mut command = Command::new("git");
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command.output().await.context("failed to run git")?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Clone on first use; afterwards rebase onto the remote, falling back
    /// to a hard reset when the rebase cannot apply.
    async fn ensure_repo(&self) -> Result<()> {
        let dir = &self.settings.repo_dir;
        let branch = &self.settings.branch;

        if !dir.join(".git").exists() {
            if dir.exists() {
                warn!(dir = %dir.display(), "mirror dir exists but is not a repository, recreating");
                tokio::fs::remove_dir_all(dir).await?;
            }
            if let Some(parent) = dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let dir_arg = dir.to_string_lossy().to_string();
            self.run_git(
                &["clone", "-b", branch, "--single-branch", &self.remote_url(), &dir_arg],
                None,
            )
            .await?;
            self.run_git(&["config", "user.name", &self.settings.user], Some(dir))
                .await?;
            self.run_git(&["config", "user.email", &self.settings.email], Some(dir))
                .await?;
            return Ok(());
        }

        if let Err(err) = self
            .run_git(&["pull", "--rebase", "origin", branch], Some(dir))
            .await
        {
            warn!(%err, "git pull failed, resetting to remote");
            self.run_git(&["fetch", "origin", branch], Some(dir)).await?;
            self.run_git(&["reset", "--hard", &format!("origin/{branch}")], Some(dir))
                .await?;
        }

        Ok(())
    }

    async fn update_file_and_push(&self, filename: &str, content: &str) -> Result<()> {
        self.ensure_repo().await?;

        let dir = &self.settings.repo_dir;
        tokio::fs::write(dir.join(filename), content)
            .await
            .context("failed to write mirror file")?;

        let status = self.run_git(&["status", "--porcelain"], Some(dir)).await?;
        if status.is_empty() {
            info!(filename, "mirror already up to date");
            return Ok(());
        }

        self.run_git(&["add", filename], Some(dir)).await?;
        self.run_git(
            &["commit", "-m", &format!("Auto-update {filename}")],
            Some(dir),
        )
        .await?;
        self.run_git(&["push", "origin", &self.settings.branch], Some(dir))
            .await?;
        info!(filename, "mirror push complete");

        Ok(())
    }
}

#[async_trait]
impl RefreshHook for GitMirror {
    async fn on_refresh(&self, all_working: &CacheSnapshot) {
        if all_working.is_empty() {
            return;
        }
        if let Err(err) = self
            .update_file_and_push(&self.settings.filename, &all_working.to_raw())
            .await
        {
            warn!(%err, "mirror push for working set failed");
        }
    }

    async fn on_site(&self, site_url: &str, snapshot: &CacheSnapshot) {
        if snapshot.is_empty() {
            return;
        }
        let filename = Self::site_filename(site_url);
        if let Err(err) = self.update_file_and_push(&filename, &snapshot.to_raw()).await {
            warn!(%err, site_url, "mirror push for site list failed");
        }
    }
}

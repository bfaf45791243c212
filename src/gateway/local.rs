//! Real tool adapters: local disk, `sh -c` subprocesses and the GitHub REST API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use walkdir::WalkDir;

use super::{
    DirEntry, ExecMode, ExecOutput, ExecutionTool, FilesystemTool, RemoteRepoRef, RemoteRepoTool,
    RepoFile, SearchMatch,
};
use crate::util::truncate_output;

/// Filesystem tool backed by the local disk.
#[derive(Debug, Clone, Default)]
pub struct LocalFilesystem {
    /// Directory names skipped by `list` and `search` (e.g. `node_modules`).
    ignore: Vec<String>,
}

impl LocalFilesystem {
    pub fn new(ignore: Vec<String>) -> Self {
        Self { ignore }
    }

    fn walk(root: &Path, depth: usize, ignore: &[String]) -> Vec<walkdir::DirEntry> {
        WalkDir::new(root)
            .min_depth(1)
            .max_depth(depth.max(1))
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir()
                    && e.file_name()
                        .to_str()
                        .is_some_and(|name| ignore.iter().any(|i| i == name)))
            })
            .filter_map(|e| e.ok())
            .collect()
    }
}

#[async_trait]
impl FilesystemTool for LocalFilesystem {
    async fn mkdir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("Failed to create directory {}", path.display()))
    }

    async fn list(&self, path: &Path, depth: usize) -> Result<Vec<DirEntry>> {
        if !path.is_dir() {
            anyhow::bail!("{} is not a directory", path.display());
        }
        let root = path.to_path_buf();
        let ignore = self.ignore.clone();
        let entries = tokio::task::spawn_blocking(move || Self::walk(&root, depth, &ignore))
            .await
            .context("Directory walk panicked")?;
        Ok(entries
            .into_iter()
            .map(|e| DirEntry {
                is_dir: e.file_type().is_dir(),
                path: e.into_path(),
            })
            .collect())
    }

    async fn read(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn write(&self, path: &Path, content: &str) -> Result<usize> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(content.len())
    }

    async fn move_path(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        tokio::fs::rename(from, to)
            .await
            .with_context(|| format!("Failed to move {} to {}", from.display(), to.display()))
    }

    async fn search(&self, pattern: &str, root: &Path) -> Result<Vec<SearchMatch>> {
        let re = Regex::new(pattern).with_context(|| format!("Invalid search pattern: {}", pattern))?;
        let root = root.to_path_buf();
        let ignore = self.ignore.clone();
        tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            for entry in Self::walk(&root, usize::MAX, &ignore) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                for (idx, line) in content.lines().enumerate() {
                    if re.is_match(line) {
                        matches.push(SearchMatch {
                            path: entry.path().to_path_buf(),
                            line: idx + 1,
                            text: line.trim().to_string(),
                        });
                    }
                }
            }
            matches
        })
        .await
        .context("Search walk panicked")
    }
}

/// Execution tool running commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    timeout: Duration,
    output_limit: usize,
}

impl ShellExecutor {
    pub fn new(timeout: Duration, output_limit: usize) -> Self {
        Self {
            timeout,
            output_limit,
        }
    }
}

#[async_trait]
impl ExecutionTool for ShellExecutor {
    async fn run(&self, command: &str, cwd: &Path, mode: ExecMode) -> Result<ExecOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("SHIPWRIGHT_EXEC_MODE", mode.to_string());
        if mode == ExecMode::ReadOnly {
            // Package managers honour these and stay off the network.
            cmd.env("npm_config_offline", "true")
                .env("YARN_ENABLE_NETWORK", "0");
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn command: {}", command))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for command")?,
            Err(_) => anyhow::bail!(
                "command timed out after {} seconds: {}",
                self.timeout.as_secs(),
                command
            ),
        };

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: truncate_output(&String::from_utf8_lossy(&output.stdout), self.output_limit),
            stderr: truncate_output(&String::from_utf8_lossy(&output.stderr), self.output_limit),
        })
    }
}

const USER_AGENT: &str = "shipwright";

#[derive(Debug, Deserialize)]
struct GitHubRepoResponse {
    name: String,
    owner: GitHubOwner,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct GitHubOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    sha: String,
}

impl From<GitHubRepoResponse> for RemoteRepoRef {
    fn from(r: GitHubRepoResponse) -> Self {
        RemoteRepoRef {
            owner: r.owner.login,
            name: r.name,
            url: r.html_url,
        }
    }
}

/// Remote repository tool backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GitHubRepository {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GitHubRepository {
    pub fn new(api_base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .context("No GitHub token configured for remote repository writes")
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT);
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    fn contents_url(&self, owner: &str, repo: &str, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base,
            owner,
            repo,
            path.trim_start_matches('/')
        )
    }

    /// Blob sha of an existing file on `branch`, required to update it.
    async fn existing_sha(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>> {
        let resp = self
            .request(reqwest::Method::GET, &self.contents_url(owner, repo, path))
            .query(&[("ref", branch)])
            .send()
            .await
            .context("Failed to send contents request to GitHub")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let content = resp
            .error_for_status()
            .context("GitHub contents API returned error status")?
            .json::<ContentResponse>()
            .await
            .context("Failed to parse contents response from GitHub")?;
        Ok(Some(content.sha))
    }
}

#[async_trait]
impl RemoteRepoTool for GitHubRepository {
    async fn create_repository(&self, name: &str) -> Result<RemoteRepoRef> {
        self.token()?;
        let repo = self
            .request(reqwest::Method::POST, &format!("{}/user/repos", self.api_base))
            .json(&serde_json::json!({ "name": name, "auto_init": true }))
            .send()
            .await
            .context("Failed to send create repository request to GitHub")?
            .error_for_status()
            .context("GitHub create repository API returned error status")?
            .json::<GitHubRepoResponse>()
            .await
            .context("Failed to parse create repository response from GitHub")?;
        Ok(repo.into())
    }

    async fn repository_exists(&self, owner: &str, name: &str) -> Result<Option<RemoteRepoRef>> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("{}/repos/{}/{}", self.api_base, owner, name),
            )
            .send()
            .await
            .context("Failed to send repository request to GitHub")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let repo = resp
            .error_for_status()
            .context("GitHub repository API returned error status")?
            .json::<GitHubRepoResponse>()
            .await
            .context("Failed to parse repository response from GitHub")?;
        Ok(Some(repo.into()))
    }

    async fn push_files(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        files: &[RepoFile],
        message: &str,
    ) -> Result<usize> {
        for file in files {
            self.create_or_update_file(owner, repo, branch, file, message)
                .await?;
        }
        Ok(files.len())
    }

    async fn create_or_update_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        file: &RepoFile,
        message: &str,
    ) -> Result<()> {
        self.token()?;
        let mut body = serde_json::json!({
            "message": message,
            "content": BASE64.encode(file.content.as_bytes()),
            "branch": branch,
        });
        if let Some(sha) = self.existing_sha(owner, repo, branch, &file.path).await? {
            body["sha"] = serde_json::Value::String(sha);
        }
        self.request(
            reqwest::Method::PUT,
            &self.contents_url(owner, repo, &file.path),
        )
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to send update for {} to GitHub", file.path))?
        .error_for_status()
        .with_context(|| format!("GitHub contents API rejected {}", file.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_creates_parents_and_lists() {
        let dir = tempdir().unwrap();
        let fs = LocalFilesystem::new(vec!["node_modules".into()]);
        fs.write(&dir.path().join("codebase/src/App.tsx"), "export {}")
            .await
            .unwrap();
        fs.write(&dir.path().join("node_modules/pkg/index.js"), "x")
            .await
            .unwrap();

        let entries = fs.list(dir.path(), 8).await.unwrap();
        let files: Vec<_> = entries.iter().filter(|e| !e.is_dir).collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].path.ends_with("codebase/src/App.tsx"));
    }

    #[tokio::test]
    async fn test_search_reports_line_numbers() {
        let dir = tempdir().unwrap();
        let fs = LocalFilesystem::default();
        fs.write(&dir.path().join("a.ts"), "const a = 1;\nfetch('/api');\n")
            .await
            .unwrap();
        let matches = fs.search(r"fetch\(", dir.path()).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].line, 2);
    }

    #[tokio::test]
    async fn test_move_and_read() {
        let dir = tempdir().unwrap();
        let fs = LocalFilesystem::default();
        let from = dir.path().join("a.txt");
        let to = dir.path().join("sub/b.txt");
        fs.write(&from, "hello").await.unwrap();
        fs.move_path(&from, &to).await.unwrap();
        assert_eq!(fs.read(&to).await.unwrap(), "hello");
        assert!(fs.read(&from).await.is_err());
    }

    #[tokio::test]
    async fn test_move_reports_unusable_destination_parent() {
        let dir = tempdir().unwrap();
        let fs = LocalFilesystem::default();
        let from = dir.path().join("a.txt");
        fs.write(&from, "hello").await.unwrap();
        fs.write(&dir.path().join("blocker"), "file").await.unwrap();

        let err = fs
            .move_path(&from, &dir.path().join("blocker/b.txt"))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to create directory"));
        assert_eq!(fs.read(&from).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_shell_executor_captures_exit_code() {
        let dir = tempdir().unwrap();
        let exec = ShellExecutor::new(Duration::from_secs(10), 1000);
        let ok = exec
            .run("echo $SHIPWRIGHT_EXEC_MODE", dir.path(), ExecMode::Network)
            .await
            .unwrap();
        assert!(ok.succeeded());
        assert_eq!(ok.stdout.trim(), "network");

        let failed = exec
            .run("echo boom >&2; exit 3", dir.path(), ExecMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(failed.exit_code, 3);
        assert_eq!(failed.stderr.trim(), "boom");
    }

    #[tokio::test]
    async fn test_shell_executor_times_out() {
        let dir = tempdir().unwrap();
        let exec = ShellExecutor::new(Duration::from_millis(100), 1000);
        let err = exec
            .run("sleep 5", dir.path(), ExecMode::ReadOnly)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_github_writes_require_token() {
        let gh = GitHubRepository::new("http://127.0.0.1:9", None);
        let err = gh.create_repository("shop").await.unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn test_contents_url_trims_slashes() {
        let gh = GitHubRepository::new("https://api.github.com/", None);
        assert_eq!(
            gh.contents_url("acme", "shop", "/src/App.tsx"),
            "https://api.github.com/repos/acme/shop/contents/src/App.tsx"
        );
    }
}

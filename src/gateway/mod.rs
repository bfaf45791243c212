//! Tool capability gateway.
//!
//! Every external effect of a pipeline run goes through [`ToolGateway::dispatch`].
//! The gateway owns the three tool roles and enforces, in order:
//!
//! 1. the request's declared capability matches the tool class of its action
//! 2. the active phase permits the declared capability
//! 3. every filesystem target and execution cwd passes the path validator
//! 4. the dispatch guard of the current mode (fix mode narrows it)
//! 5. remote writes target a confirmed repository and carry a commit message
//!
//! Only then is the request forwarded. Directory creation and moves are
//! serialized so concurrent requests never race on sandbox metadata.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::architecture::ArtifactSet;
use crate::errors::GatewayError;
use crate::phase::Phase;
use crate::sandbox::SandboxRoot;

/// One of the three external capability classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Filesystem,
    Execution,
    RemoteRepo,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Filesystem => write!(f, "filesystem"),
            Capability::Execution => write!(f, "execution"),
            Capability::RemoteRepo => write!(f, "remote-repo"),
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "filesystem" | "fs" => Ok(Capability::Filesystem),
            "execution" | "exec" => Ok(Capability::Execution),
            "remote-repo" | "remote" => Ok(Capability::RemoteRepo),
            _ => anyhow::bail!(
                "Invalid capability '{}'. Valid values: filesystem, execution, remote-repo",
                s
            ),
        }
    }
}

/// Filesystem tool operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FsAction {
    Mkdir { path: PathBuf },
    List { path: PathBuf, depth: usize },
    Read { path: PathBuf },
    Write { path: PathBuf, content: String },
    Move { from: PathBuf, to: PathBuf },
    Search { pattern: String, root: PathBuf },
}

/// Execution sandbox mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    #[default]
    ReadOnly,
    Network,
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::ReadOnly => write!(f, "read-only"),
            ExecMode::Network => write!(f, "network"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecAction {
    pub command: String,
    pub cwd: PathBuf,
    #[serde(default)]
    pub mode: ExecMode,
}

/// A file pushed to the remote repository, keyed by repository-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoFile {
    pub path: String,
    pub content: String,
}

/// Remote repository tool operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RepoAction {
    CreateRepository {
        name: String,
    },
    ConfirmRepository {
        owner: String,
        name: String,
    },
    PushFiles {
        owner: String,
        repo: String,
        branch: String,
        files: Vec<RepoFile>,
        message: String,
    },
    CreateOrUpdateFile {
        owner: String,
        repo: String,
        branch: String,
        file: RepoFile,
        message: String,
    },
}

impl RepoAction {
    fn write_target(&self) -> Option<(&str, &str, &str)> {
        match self {
            RepoAction::PushFiles {
                owner,
                repo,
                message,
                ..
            }
            | RepoAction::CreateOrUpdateFile {
                owner,
                repo,
                message,
                ..
            } => Some((owner, repo, message)),
            _ => None,
        }
    }
}

/// The concrete action of an operation request. Its variant is the tool
/// class that can serve it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "action", rename_all = "kebab-case")]
pub enum ToolAction {
    Filesystem(FsAction),
    Execution(ExecAction),
    RemoteRepo(RepoAction),
}

impl ToolAction {
    /// Tool class that serves this action.
    pub fn role(&self) -> Capability {
        match self {
            ToolAction::Filesystem(_) => Capability::Filesystem,
            ToolAction::Execution(_) => Capability::Execution,
            ToolAction::RemoteRepo(_) => Capability::RemoteRepo,
        }
    }

    /// Sandbox paths the action touches (filesystem targets and execution cwd).
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            ToolAction::Filesystem(fs) => match fs {
                FsAction::Mkdir { path }
                | FsAction::List { path, .. }
                | FsAction::Read { path }
                | FsAction::Write { path, .. } => vec![path.as_path()],
                FsAction::Move { from, to } => vec![from.as_path(), to.as_path()],
                FsAction::Search { root, .. } => vec![root.as_path()],
            },
            ToolAction::Execution(exec) => vec![exec.cwd.as_path()],
            ToolAction::RemoteRepo(_) => Vec::new(),
        }
    }

    /// Whether the action changes sandbox directory metadata.
    pub fn mutates_metadata(&self) -> bool {
        matches!(
            self,
            ToolAction::Filesystem(FsAction::Mkdir { .. } | FsAction::Move { .. })
        )
    }

    /// One-line human description, used as the "failing command" in reports.
    pub fn describe(&self) -> String {
        match self {
            ToolAction::Filesystem(fs) => match fs {
                FsAction::Mkdir { path } => format!("mkdir {}", path.display()),
                FsAction::List { path, depth } => {
                    format!("list {} (depth {})", path.display(), depth)
                }
                FsAction::Read { path } => format!("read {}", path.display()),
                FsAction::Write { path, content } => {
                    format!("write {} ({} bytes)", path.display(), content.len())
                }
                FsAction::Move { from, to } => {
                    format!("move {} -> {}", from.display(), to.display())
                }
                FsAction::Search { pattern, root } => {
                    format!("search /{}/ in {}", pattern, root.display())
                }
            },
            ToolAction::Execution(exec) => {
                format!("{} (cwd {}, {})", exec.command, exec.cwd.display(), exec.mode)
            }
            ToolAction::RemoteRepo(repo) => match repo {
                RepoAction::CreateRepository { name } => format!("create repository {}", name),
                RepoAction::ConfirmRepository { owner, name } => {
                    format!("confirm repository {}/{}", owner, name)
                }
                RepoAction::PushFiles {
                    owner,
                    repo,
                    branch,
                    files,
                    ..
                } => format!(
                    "push {} file(s) to {}/{}@{}",
                    files.len(),
                    owner,
                    repo,
                    branch
                ),
                RepoAction::CreateOrUpdateFile {
                    owner,
                    repo,
                    branch,
                    file,
                    ..
                } => format!("update {} in {}/{}@{}", file.path, owner, repo, branch),
            },
        }
    }
}

/// A single unit of work submitted to the gateway.
///
/// The capability is declared by the caller and is never inferred from the
/// action by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub id: String,
    pub capability: Capability,
    pub phase: Phase,
    pub action: ToolAction,
}

impl OperationRequest {
    pub fn new(
        id: impl Into<String>,
        capability: Capability,
        phase: Phase,
        action: ToolAction,
    ) -> Self {
        Self {
            id: id.into(),
            capability,
            phase,
            action,
        }
    }

    pub fn filesystem(id: impl Into<String>, phase: Phase, action: FsAction) -> Self {
        Self::new(id, Capability::Filesystem, phase, ToolAction::Filesystem(action))
    }

    pub fn execution(
        id: impl Into<String>,
        phase: Phase,
        command: impl Into<String>,
        cwd: impl Into<PathBuf>,
        mode: ExecMode,
    ) -> Self {
        Self::new(
            id,
            Capability::Execution,
            phase,
            ToolAction::Execution(ExecAction {
                command: command.into(),
                cwd: cwd.into(),
                mode,
            }),
        )
    }

    pub fn remote(id: impl Into<String>, phase: Phase, action: RepoAction) -> Self {
        Self::new(id, Capability::RemoteRepo, phase, ToolAction::RemoteRepo(action))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub path: PathBuf,
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// A remote repository confirmed to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepoRef {
    pub owner: String,
    pub name: String,
    pub url: String,
}

impl RemoteRepoRef {
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Raw result of a forwarded request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OperationResult {
    Created { path: PathBuf },
    Listing { entries: Vec<DirEntry> },
    Content { path: PathBuf, content: String },
    Written { path: PathBuf, bytes: usize },
    Moved { from: PathBuf, to: PathBuf },
    Matches { matches: Vec<SearchMatch> },
    Exec(ExecOutput),
    Repository(RemoteRepoRef),
    Pushed { repo: String, files: usize },
}

#[async_trait]
pub trait FilesystemTool: Send + Sync {
    async fn mkdir(&self, path: &Path) -> anyhow::Result<()>;
    async fn list(&self, path: &Path, depth: usize) -> anyhow::Result<Vec<DirEntry>>;
    async fn read(&self, path: &Path) -> anyhow::Result<String>;
    async fn write(&self, path: &Path, content: &str) -> anyhow::Result<usize>;
    async fn move_path(&self, from: &Path, to: &Path) -> anyhow::Result<()>;
    async fn search(&self, pattern: &str, root: &Path) -> anyhow::Result<Vec<SearchMatch>>;
}

#[async_trait]
pub trait ExecutionTool: Send + Sync {
    async fn run(&self, command: &str, cwd: &Path, mode: ExecMode) -> anyhow::Result<ExecOutput>;
}

#[async_trait]
pub trait RemoteRepoTool: Send + Sync {
    async fn create_repository(&self, name: &str) -> anyhow::Result<RemoteRepoRef>;
    async fn repository_exists(
        &self,
        owner: &str,
        name: &str,
    ) -> anyhow::Result<Option<RemoteRepoRef>>;
    async fn push_files(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        files: &[RepoFile],
        message: &str,
    ) -> anyhow::Result<usize>;
    async fn create_or_update_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        file: &RepoFile,
        message: &str,
    ) -> anyhow::Result<()>;
}

/// Mode-specific admission check applied after the generic ones.
pub trait DispatchGuard: Send + Sync {
    fn check(&self, request: &OperationRequest, sandbox: &SandboxRoot) -> Result<(), GatewayError>;

    /// Checked once a phase's operations and conformance checks pass, before
    /// the run may leave the phase.
    fn verify_phase(&self, _phase: Phase) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// Guard of the forward pipeline: no extra restrictions.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGuard;

impl DispatchGuard for OpenGuard {
    fn check(&self, _request: &OperationRequest, _sandbox: &SandboxRoot) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// Read-only snapshot of run facts the gateway needs for admission.
#[derive(Clone, Copy)]
pub struct DispatchContext<'a> {
    /// The phase currently executing; its mask decides permission, whatever
    /// phase the request was planned for.
    pub phase: Phase,
    pub remote: Option<&'a RemoteRepoRef>,
    pub guard: &'a dyn DispatchGuard,
}

/// Single enforcement point for strict tool roles.
pub struct ToolGateway {
    sandbox: SandboxRoot,
    filesystem: Arc<dyn FilesystemTool>,
    execution: Arc<dyn ExecutionTool>,
    remote: Arc<dyn RemoteRepoTool>,
    metadata_lock: Mutex<()>,
}

impl ToolGateway {
    pub fn new(
        sandbox: SandboxRoot,
        filesystem: Arc<dyn FilesystemTool>,
        execution: Arc<dyn ExecutionTool>,
        remote: Arc<dyn RemoteRepoTool>,
    ) -> Self {
        Self {
            sandbox,
            filesystem,
            execution,
            remote,
            metadata_lock: Mutex::new(()),
        }
    }

    pub fn sandbox(&self) -> &SandboxRoot {
        &self.sandbox
    }

    /// Run every admission check without forwarding the request.
    pub fn admit(
        &self,
        request: &OperationRequest,
        ctx: &DispatchContext<'_>,
    ) -> Result<(), GatewayError> {
        let actual = request.action.role();
        if request.capability != actual {
            return Err(GatewayError::WrongToolRole {
                declared: request.capability,
                actual,
            });
        }

        if !ctx.phase.permits(request.capability) {
            return Err(GatewayError::CapabilityNotPermitted {
                phase: ctx.phase,
                capability: request.capability,
            });
        }

        for path in request.action.paths() {
            self.sandbox.validate(path)?;
        }

        ctx.guard.check(request, &self.sandbox)?;

        if let ToolAction::RemoteRepo(action) = &request.action
            && let Some((owner, repo, message)) = action.write_target()
        {
            let slug = format!("{}/{}", owner, repo);
            let confirmed = ctx
                .remote
                .is_some_and(|r| r.owner == owner && r.name == repo);
            if !confirmed {
                return Err(GatewayError::PrematureRemoteWrite { repo: slug });
            }
            if message.trim().is_empty() {
                return Err(GatewayError::MissingCommitMessage { repo: slug });
            }
        }

        Ok(())
    }

    /// Admit and forward a request to the matching tool role.
    pub async fn dispatch(
        &self,
        request: &OperationRequest,
        ctx: &DispatchContext<'_>,
    ) -> Result<OperationResult, GatewayError> {
        if let Err(err) = self.admit(request, ctx) {
            tracing::warn!(id = %request.id, phase = %ctx.phase, error = %err, "dispatch rejected");
            return Err(err);
        }
        tracing::debug!(id = %request.id, action = %request.action.describe(), "dispatch");

        let _metadata = if request.action.mutates_metadata() {
            Some(self.metadata_lock.lock().await)
        } else {
            None
        };

        let capability = request.capability;
        self.forward(&request.action)
            .await
            .map_err(|e| GatewayError::Tool {
                capability,
                message: format!("{:#}", e),
            })
    }

    async fn forward(&self, action: &ToolAction) -> anyhow::Result<OperationResult> {
        let resolve = |p: &Path| self.sandbox.resolve(p);
        match action {
            ToolAction::Filesystem(fs) => match fs {
                FsAction::Mkdir { path } => {
                    let path = resolve(path);
                    self.filesystem.mkdir(&path).await?;
                    Ok(OperationResult::Created { path })
                }
                FsAction::List { path, depth } => {
                    let entries = self.filesystem.list(&resolve(path), *depth).await?;
                    Ok(OperationResult::Listing { entries })
                }
                FsAction::Read { path } => {
                    let path = resolve(path);
                    let content = self.filesystem.read(&path).await?;
                    Ok(OperationResult::Content { path, content })
                }
                FsAction::Write { path, content } => {
                    let path = resolve(path);
                    let bytes = self.filesystem.write(&path, content).await?;
                    Ok(OperationResult::Written { path, bytes })
                }
                FsAction::Move { from, to } => {
                    let (from, to) = (resolve(from), resolve(to));
                    self.filesystem.move_path(&from, &to).await?;
                    Ok(OperationResult::Moved { from, to })
                }
                FsAction::Search { pattern, root } => {
                    let matches = self.filesystem.search(pattern, &resolve(root)).await?;
                    Ok(OperationResult::Matches { matches })
                }
            },
            ToolAction::Execution(exec) => {
                let output = self
                    .execution
                    .run(&exec.command, &resolve(&exec.cwd), exec.mode)
                    .await?;
                Ok(OperationResult::Exec(output))
            }
            ToolAction::RemoteRepo(repo) => match repo {
                RepoAction::CreateRepository { name } => {
                    let created = self.remote.create_repository(name).await?;
                    Ok(OperationResult::Repository(created))
                }
                RepoAction::ConfirmRepository { owner, name } => {
                    match self.remote.repository_exists(owner, name).await? {
                        Some(found) => Ok(OperationResult::Repository(found)),
                        None => anyhow::bail!("repository {}/{} does not exist", owner, name),
                    }
                }
                RepoAction::PushFiles {
                    owner,
                    repo,
                    branch,
                    files,
                    message,
                } => {
                    let files = self
                        .remote
                        .push_files(owner, repo, branch, files, message)
                        .await?;
                    Ok(OperationResult::Pushed {
                        repo: format!("{}/{}", owner, repo),
                        files,
                    })
                }
                RepoAction::CreateOrUpdateFile {
                    owner,
                    repo,
                    branch,
                    file,
                    message,
                } => {
                    self.remote
                        .create_or_update_file(owner, repo, branch, file, message)
                        .await?;
                    Ok(OperationResult::Pushed {
                        repo: format!("{}/{}", owner, repo),
                        files: 1,
                    })
                }
            },
        }
    }

    /// Snapshot the sandbox's files through the filesystem role.
    ///
    /// Lists the root to `depth` and reads every file, keyed by its
    /// root-relative path.
    pub async fn collect_artifacts(
        &self,
        depth: usize,
        ctx: &DispatchContext<'_>,
    ) -> Result<ArtifactSet, GatewayError> {
        let phase = ctx.phase;
        let list = OperationRequest::filesystem(
            "snapshot:list",
            phase,
            FsAction::List {
                path: PathBuf::from("."),
                depth,
            },
        );
        let entries = match self.dispatch(&list, ctx).await? {
            OperationResult::Listing { entries } => entries,
            _ => Vec::new(),
        };

        let mut artifacts = ArtifactSet::default();
        for entry in entries.into_iter().filter(|e| !e.is_dir) {
            let Some(rel) = self.sandbox.relative(&entry.path) else {
                continue;
            };
            let read = OperationRequest::filesystem(
                format!("snapshot:read:{}", rel),
                phase,
                FsAction::Read {
                    path: entry.path.clone(),
                },
            );
            if let OperationResult::Content { content, .. } = self.dispatch(&read, ctx).await? {
                artifacts.insert(rel, content);
            }
        }
        Ok(artifacts)
    }
}

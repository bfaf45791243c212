//! In-memory tool adapters used by `run --dry-run` and by tests.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    DirEntry, ExecMode, ExecOutput, ExecutionTool, FilesystemTool, RemoteRepoRef, RemoteRepoTool,
    RepoFile, SearchMatch,
};

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
struct FsTree {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, String>,
}

/// Filesystem tool over an in-memory tree keyed by absolute path.
#[derive(Debug, Default)]
pub struct MemoryFilesystem {
    tree: Mutex<FsTree>,
}

impl MemoryFilesystem {
    pub fn with_files<P: Into<PathBuf>>(files: impl IntoIterator<Item = (P, String)>) -> Self {
        let fs = Self::default();
        {
            let mut tree = locked(&fs.tree);
            for (path, content) in files {
                tree.files.insert(path.into(), content);
            }
        }
        fs
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        locked(&self.tree).files.get(path.as_ref()).cloned()
    }

    pub fn file_count(&self) -> usize {
        locked(&self.tree).files.len()
    }
}

#[async_trait]
impl FilesystemTool for MemoryFilesystem {
    async fn mkdir(&self, path: &Path) -> Result<()> {
        let mut tree = locked(&self.tree);
        if tree.files.contains_key(path) {
            anyhow::bail!("{} exists and is a file", path.display());
        }
        tree.dirs.insert(path.to_path_buf());
        Ok(())
    }

    async fn list(&self, path: &Path, depth: usize) -> Result<Vec<DirEntry>> {
        let tree = locked(&self.tree);
        let mut dirs = BTreeSet::new();
        let mut entries = Vec::new();

        let within = |p: &Path| {
            p.strip_prefix(path)
                .ok()
                .map(|rel| rel.components().count())
                .filter(|n| *n >= 1 && *n <= depth)
        };

        for dir in &tree.dirs {
            if within(dir).is_some() {
                dirs.insert(dir.clone());
            }
        }
        for file in tree.files.keys() {
            if within(file).is_some() {
                entries.push(DirEntry {
                    path: file.clone(),
                    is_dir: false,
                });
            }
            // Parents of files are implicit directories.
            for ancestor in file.ancestors().skip(1) {
                if within(ancestor).is_some() {
                    dirs.insert(ancestor.to_path_buf());
                }
            }
        }

        entries.extend(dirs.into_iter().map(|path| DirEntry { path, is_dir: true }));
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn read(&self, path: &Path) -> Result<String> {
        match locked(&self.tree).files.get(path) {
            Some(content) => Ok(content.clone()),
            None => anyhow::bail!("No such file: {}", path.display()),
        }
    }

    async fn write(&self, path: &Path, content: &str) -> Result<usize> {
        locked(&self.tree)
            .files
            .insert(path.to_path_buf(), content.to_string());
        Ok(content.len())
    }

    async fn move_path(&self, from: &Path, to: &Path) -> Result<()> {
        let mut tree = locked(&self.tree);
        let moved: Vec<PathBuf> = tree
            .files
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        if moved.is_empty() && !tree.dirs.contains(from) {
            anyhow::bail!("No such file or directory: {}", from.display());
        }
        for old in moved {
            if let (Ok(rel), Some(content)) = (old.strip_prefix(from), tree.files.remove(&old)) {
                let new = if rel.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rel)
                };
                tree.files.insert(new, content);
            }
        }
        if tree.dirs.remove(from) {
            tree.dirs.insert(to.to_path_buf());
        }
        Ok(())
    }

    async fn search(&self, pattern: &str, root: &Path) -> Result<Vec<SearchMatch>> {
        let re = Regex::new(pattern)?;
        let tree = locked(&self.tree);
        let mut matches = Vec::new();
        for (path, content) in tree.files.iter().filter(|(p, _)| p.starts_with(root)) {
            for (idx, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(SearchMatch {
                        path: path.clone(),
                        line: idx + 1,
                        text: line.trim().to_string(),
                    });
                }
            }
        }
        Ok(matches)
    }
}

/// A recorded execution call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub command: String,
    pub cwd: PathBuf,
    pub mode: ExecMode,
}

/// Execution tool that replays queued outputs per command.
///
/// Commands with no queued output succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: Mutex<HashMap<String, VecDeque<ExecOutput>>>,
    calls: Mutex<Vec<ExecCall>>,
}

impl ScriptedExecutor {
    /// Queue outputs returned, in order, by successive runs of `command`.
    pub fn queue(&self, command: &str, outputs: impl IntoIterator<Item = ExecOutput>) {
        locked(&self.script)
            .entry(command.to_string())
            .or_default()
            .extend(outputs);
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        locked(&self.calls).clone()
    }

    pub fn count(&self, command: &str) -> usize {
        locked(&self.calls)
            .iter()
            .filter(|c| c.command == command)
            .count()
    }
}

#[async_trait]
impl ExecutionTool for ScriptedExecutor {
    async fn run(&self, command: &str, cwd: &Path, mode: ExecMode) -> Result<ExecOutput> {
        locked(&self.calls).push(ExecCall {
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            mode,
        });
        let next = locked(&self.script)
            .get_mut(command)
            .and_then(|queue| queue.pop_front());
        Ok(next.unwrap_or_else(|| ExecOutput::success("")))
    }
}

/// A push recorded by [`MemoryRepository`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPush {
    pub repo: String,
    pub branch: String,
    pub files: Vec<String>,
    pub message: String,
}

/// Remote repository tool holding repositories in memory.
#[derive(Debug)]
pub struct MemoryRepository {
    owner: String,
    repos: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    pushes: Mutex<Vec<RecordedPush>>,
    network_calls: AtomicUsize,
}

impl MemoryRepository {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repos: Mutex::new(BTreeMap::new()),
            pushes: Mutex::new(Vec::new()),
            network_calls: AtomicUsize::new(0),
        }
    }

    /// Seed an existing repository.
    pub fn with_repository(self, name: &str) -> Self {
        locked(&self.repos).insert(name.to_string(), BTreeMap::new());
        self
    }

    fn reference(&self, name: &str) -> RemoteRepoRef {
        RemoteRepoRef {
            owner: self.owner.clone(),
            name: name.to_string(),
            url: format!("memory://{}/{}", self.owner, name),
        }
    }

    pub fn network_calls(&self) -> usize {
        self.network_calls.load(Ordering::SeqCst)
    }

    pub fn pushes(&self) -> Vec<RecordedPush> {
        locked(&self.pushes).clone()
    }

    pub fn file(&self, repo: &str, path: &str) -> Option<String> {
        locked(&self.repos)
            .get(repo)
            .and_then(|files| files.get(path).cloned())
    }

    fn store(&self, owner: &str, repo: &str, files: &[RepoFile]) -> Result<()> {
        if owner != self.owner {
            anyhow::bail!("owner {} is not accessible", owner);
        }
        let mut repos = locked(&self.repos);
        let Some(stored) = repos.get_mut(repo) else {
            anyhow::bail!("repository {}/{} not found", owner, repo);
        };
        for file in files {
            stored.insert(file.path.clone(), file.content.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteRepoTool for MemoryRepository {
    async fn create_repository(&self, name: &str) -> Result<RemoteRepoRef> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        let mut repos = locked(&self.repos);
        if repos.contains_key(name) {
            anyhow::bail!("repository {}/{} already exists", self.owner, name);
        }
        repos.insert(name.to_string(), BTreeMap::new());
        Ok(self.reference(name))
    }

    async fn repository_exists(&self, owner: &str, name: &str) -> Result<Option<RemoteRepoRef>> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        let exists = owner == self.owner && locked(&self.repos).contains_key(name);
        Ok(exists.then(|| self.reference(name)))
    }

    async fn push_files(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        files: &[RepoFile],
        message: &str,
    ) -> Result<usize> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        self.store(owner, repo, files)?;
        locked(&self.pushes).push(RecordedPush {
            repo: format!("{}/{}", owner, repo),
            branch: branch.to_string(),
            files: files.iter().map(|f| f.path.clone()).collect(),
            message: message.to_string(),
        });
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
        self.push_files(owner, repo, branch, std::slice::from_ref(file), message)
            .await
            .map(|_| ())
    }
}

//! Artifact storage keyed by `(domain, relative path)`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use contextsync_shared::{ContextSyncError, DomainId, Result};
use tracing::debug;

/// Durable key → blob storage for generated context files.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Relative paths of every file under `domain`, sorted. Empty when the
    /// domain has no artifacts yet.
    async fn list(&self, domain: &DomainId) -> Result<Vec<String>>;

    /// Content of one file, or `None` if it does not exist.
    async fn read(&self, domain: &DomainId, path: &str) -> Result<Option<Vec<u8>>>;

    /// Replace one file. Readers never observe a partially written file.
    async fn write(&self, domain: &DomainId, path: &str, content: &[u8]) -> Result<()>;

    /// Remove one file. Returns whether it existed.
    async fn delete(&self, domain: &DomainId, path: &str) -> Result<bool>;

    /// Every domain that currently has an artifact directory.
    async fn list_domains(&self) -> Result<Vec<DomainId>>;
}

/// Filesystem store: `<root>/<domain id>/<relative path>`.
///
/// Domains map to flat sibling directories (`Analysis`, `Analysis.Fractal`)
/// so a parent domain's directory never contains a child's files.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn domain_dir(&self, domain: &DomainId) -> PathBuf {
        self.root.join(domain.as_str())
    }

    fn file_path(&self, domain: &DomainId, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(ContextSyncError::validation(format!(
                "artifact path '{path}' must be relative and stay inside the domain"
            )));
        }
        Ok(self.domain_dir(domain).join(relative))
    }

    /// Remove empty directories from `dir` up to and including the domain directory.
    async fn prune_empty_dirs(&self, domain_dir: &Path, mut dir: PathBuf) {
        loop {
            if !dir.starts_with(domain_dir) {
                break;
            }
            // remove_dir fails on non-empty directories, which ends the walk.
            if tokio::fs::remove_dir(&dir).await.is_err() {
                break;
            }
            if dir == domain_dir {
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            }
        }
    }
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn list(&self, domain: &DomainId) -> Result<Vec<String>> {
        let base = self.domain_dir(domain);
        let mut files = Vec::new();
        let mut stack = vec![base.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ContextSyncError::io(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ContextSyncError::io(&dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| ContextSyncError::io(&path, e))?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    if is_temp_file(&entry.file_name().to_string_lossy()) {
                        continue;
                    }
                    if let Ok(relative) = path.strip_prefix(&base) {
                        let parts: Vec<_> = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy().into_owned())
                            .collect();
                        files.push(parts.join("/"));
                    }
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn read(&self, domain: &DomainId, path: &str) -> Result<Option<Vec<u8>>> {
        let full = self.file_path(domain, path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ContextSyncError::io(&full, e)),
        }
    }

    async fn write(&self, domain: &DomainId, path: &str, content: &[u8]) -> Result<()> {
        let target = self.file_path(domain, path)?;
        let parent = target
            .parent()
            .ok_or_else(|| ContextSyncError::validation(format!("artifact path '{path}' has no parent")))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ContextSyncError::io(parent, e))?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(".{file_name}.tmp"));

        // Write to temp file first
        tokio::fs::write(&temp, content)
            .await
            .map_err(|e| ContextSyncError::io(&temp, e))?;

        // Atomic rename
        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|e| ContextSyncError::io(&target, e))?;

        debug!(domain = %domain, path, bytes = content.len(), "wrote artifact");
        Ok(())
    }

    async fn delete(&self, domain: &DomainId, path: &str) -> Result<bool> {
        let full = self.file_path(domain, path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => {
                if let Some(parent) = full.parent() {
                    self.prune_empty_dirs(&self.domain_dir(domain), parent.to_path_buf())
                        .await;
                }
                debug!(domain = %domain, path, "deleted artifact");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ContextSyncError::io(&full, e)),
        }
    }

    async fn list_domains(&self) -> Result<Vec<DomainId>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ContextSyncError::io(&self.root, e)),
        };

        let mut domains = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ContextSyncError::io(&self.root, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            // Foreign directories that are not domain ids are left alone.
            if let Ok(domain) = DomainId::new(entry.file_name().to_string_lossy().into_owned()) {
                domains.push(domain);
            }
        }
        domains.sort();
        Ok(domains)
    }
}

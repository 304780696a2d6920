//! Filesystem project store.
//!
//! Each project is a directory under the store root holding the project
//! files and a `metadata.json`.

use std::{
    io::Write,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::{Compression, write::GzEncoder};
use forge_core::{
    FileMap,
    traits::{ExportFormat, ProjectStore, ProjectStoreError, ProjectSummary, StoredProject},
};
use serde_json::{Map, Value};
use tokio::fs;
use tracing::{error, info, warn};

const METADATA_FILE: &str = "metadata.json";

/// Project store backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalProjectStore {
    root: PathBuf,
}

impl LocalProjectStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, project_id: &str) -> Result<PathBuf, ProjectStoreError> {
        let valid = !project_id.is_empty()
            && project_id != "."
            && project_id != ".."
            && !project_id.contains(['/', '\\']);
        if !valid {
            return Err(ProjectStoreError::InvalidPath(project_id.to_string()));
        }
        Ok(self.root.join(project_id))
    }

    async fn existing_dir(&self, project_id: &str) -> Result<PathBuf, ProjectStoreError> {
        let dir = self.project_dir(project_id)?;
        if fs::try_exists(&dir).await? {
            Ok(dir)
        } else {
            Err(ProjectStoreError::NotFound(project_id.to_string()))
        }
    }

    /// Create a fresh project directory, suffixing the id on collision.
    async fn allocate(&self, session_id: &str) -> Result<(String, PathBuf), ProjectStoreError> {
        fs::create_dir_all(&self.root).await?;
        let base = format!("project_{}_{}", sanitize(session_id), Utc::now().timestamp());
        for attempt in 0..100 {
            let candidate = if attempt == 0 {
                base.clone()
            } else {
                format!("{base}_{attempt}")
            };
            let dir = self.root.join(&candidate);
            match fs::create_dir(&dir).await {
                Ok(()) => return Ok((candidate, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(std::io::Error::new(std::io::ErrorKind::AlreadyExists, base).into())
    }

    async fn write_project(
        dir: &Path,
        session_id: &str,
        files: &FileMap,
        metadata: Value,
    ) -> Result<(), ProjectStoreError> {
        for (path, content) in files {
            let target = dir.join(relative_path(path)?);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&target, content).await?;
        }

        let mut metadata = match metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        metadata.insert("session_id".into(), session_id.into());
        metadata.insert("created_at".into(), Utc::now().to_rfc3339().into());
        metadata.insert("file_count".into(), files.len().into());
        fs::write(
            dir.join(METADATA_FILE),
            serde_json::to_vec_pretty(&Value::Object(metadata))?,
        )
        .await?;
        Ok(())
    }

    async fn read_metadata(dir: &Path) -> Result<Value, ProjectStoreError> {
        match fs::read(dir.join(METADATA_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Map::new())),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keep ids filesystem-safe.
fn sanitize(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Project-relative form of a client path. Rejects parent traversal.
fn relative_path(path: &str) -> Result<PathBuf, ProjectStoreError> {
    let relative = Path::new(path.trim_start_matches('/'));
    let mut out = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(ProjectStoreError::InvalidPath(path.to_string())),
        }
    }
    if out.as_os_str().is_empty() || out == Path::new(METADATA_FILE) {
        return Err(ProjectStoreError::InvalidPath(path.to_string()));
    }
    Ok(out)
}

/// Every regular file below `dir`, as `/`-separated relative paths.
async fn walk(dir: &Path) -> Result<Vec<(String, PathBuf)>, ProjectStoreError> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(dir)
                    .map_err(|_| ProjectStoreError::InvalidPath(path.display().to_string()))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push((relative, path));
            }
        }
    }
    out.sort();
    Ok(out)
}

fn build_archive(
    entries: &[(String, Vec<u8>)],
    format: ExportFormat,
) -> Result<Vec<u8>, ProjectStoreError> {
    fn append<W: Write>(
        builder: &mut tar::Builder<W>,
        entries: &[(String, Vec<u8>)],
    ) -> std::io::Result<()> {
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, content.as_slice())?;
        }
        Ok(())
    }

    match format {
        ExportFormat::Tar => {
            let mut builder = tar::Builder::new(Vec::new());
            append(&mut builder, entries)?;
            Ok(builder.into_inner()?)
        }
        ExportFormat::TarGz => {
            let encoder = GzEncoder::new(Vec::new(), Compression::default());
            let mut builder = tar::Builder::new(encoder);
            append(&mut builder, entries)?;
            Ok(builder.into_inner()?.finish()?)
        }
    }
}

#[async_trait]
impl ProjectStore for LocalProjectStore {
    async fn save(
        &self,
        session_id: &str,
        files: &FileMap,
        metadata: Value,
    ) -> Result<String, ProjectStoreError> {
        let (project_id, dir) = self.allocate(session_id).await?;
        if let Err(e) = Self::write_project(&dir, session_id, files, metadata).await {
            error!(%project_id, error = %e, "Failed to save project");
            if let Err(cleanup) = fs::remove_dir_all(&dir).await {
                warn!(%project_id, error = %cleanup, "Failed to remove partial project");
            }
            return Err(e);
        }
        info!(%project_id, %session_id, files = files.len(), "Saved project");
        Ok(project_id)
    }

    async fn load(&self, project_id: &str) -> Result<StoredProject, ProjectStoreError> {
        let dir = self.existing_dir(project_id).await?;
        let metadata = Self::read_metadata(&dir).await?;

        let mut files = FileMap::new();
        for (relative, path) in walk(&dir).await? {
            if relative == METADATA_FILE {
                continue;
            }
            match String::from_utf8(fs::read(&path).await?) {
                Ok(text) => {
                    files.insert(relative, text);
                }
                Err(_) => warn!(%project_id, path = %relative, "Skipping binary project file"),
            }
        }
        info!(%project_id, files = files.len(), "Loaded project");
        Ok(StoredProject { files, metadata })
    }

    async fn list(&self, limit: usize) -> Result<Vec<ProjectSummary>, ProjectStoreError> {
        if !fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }

        let mut projects = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let project_id = entry.file_name().to_string_lossy().into_owned();
            if !fs::try_exists(dir.join(METADATA_FILE)).await? {
                continue;
            }
            let metadata = match Self::read_metadata(&dir).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(%project_id, error = %e, "Failed to read project metadata");
                    continue;
                }
            };

            let mut size = 0;
            for (_, path) in walk(&dir).await? {
                size += fs::metadata(&path).await?.len();
            }
            projects.push(ProjectSummary {
                project_id,
                session_id: metadata["session_id"].as_str().map(str::to_string),
                created_at: metadata["created_at"].as_str().map(str::to_string),
                file_count: metadata["file_count"]
                    .as_u64()
                    .and_then(|n| usize::try_from(n).ok())
                    .unwrap_or(0),
                size,
            });
        }

        projects.sort_by_key(|p| {
            std::cmp::Reverse(
                p.created_at
                    .as_deref()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok()),
            )
        });
        projects.truncate(limit);
        Ok(projects)
    }

    async fn delete(&self, project_id: &str) -> Result<bool, ProjectStoreError> {
        let dir = self.project_dir(project_id)?;
        if !fs::try_exists(&dir).await? {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).await?;
        info!(%project_id, "Deleted project");
        Ok(true)
    }

    async fn export(
        &self,
        project_id: &str,
        format: ExportFormat,
    ) -> Result<Vec<u8>, ProjectStoreError> {
        let dir = self.existing_dir(project_id).await?;
        let mut entries = Vec::new();
        for (relative, path) in walk(&dir).await? {
            entries.push((relative, fs::read(&path).await?));
        }

        tokio::task::spawn_blocking(move || build_archive(&entries, format))
            .await
            .map_err(|e| ProjectStoreError::Io(std::io::Error::other(e)))?
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;
    use serde_json::json;

    use super::*;

    fn files() -> FileMap {
        let mut files = FileMap::new();
        files.insert("/app/src/App.tsx".into(), "<header/><empty/>".into());
        files.insert("package.json".into(), "{}".into());
        files
    }

    fn archive_entries(bytes: &[u8]) -> Vec<(String, String)> {
        let mut archive = tar::Archive::new(bytes);
        let mut out: Vec<_> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                (path, content)
            })
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalProjectStore::new(dir.path());

        let id = store
            .save("s1", &files(), json!({ "title": "landing page" }))
            .await
            .unwrap();
        assert!(id.starts_with("project_s1_"));

        let project = store.load(&id).await.unwrap();
        assert_eq!(project.files.len(), 2);
        assert_eq!(project.files["app/src/App.tsx"], "<header/><empty/>");
        assert_eq!(project.metadata["session_id"], "s1");
        assert_eq!(project.metadata["title"], "landing page");
        assert_eq!(project.metadata["file_count"], 2);
    }

    #[tokio::test]
    async fn test_ids_are_unique_within_a_second() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalProjectStore::new(dir.path());
        let a = store.save("s/1", &files(), Value::Null).await.unwrap();
        let b = store.save("s/1", &files(), Value::Null).await.unwrap();
        assert_ne!(a, b);
        assert!(!a.contains('/'));
    }

    #[tokio::test]
    async fn test_list_delete_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalProjectStore::new(dir.path().join("projects"));
        assert!(store.list(10).await.unwrap().is_empty());

        let first = store.save("s1", &files(), Value::Null).await.unwrap();
        let second = store.save("s2", &FileMap::new(), Value::Null).await.unwrap();

        let listed = store.list(10).await.unwrap();
        assert_eq!(listed.len(), 2);
        let summary = listed.iter().find(|p| p.project_id == first).unwrap();
        assert_eq!(summary.session_id.as_deref(), Some("s1"));
        assert_eq!(summary.file_count, 2);
        assert!(summary.size > 0);
        assert_eq!(store.list(1).await.unwrap().len(), 1);

        assert!(store.delete(&second).await.unwrap());
        assert!(!store.delete(&second).await.unwrap());
        assert!(matches!(
            store.load(&second).await,
            Err(ProjectStoreError::NotFound(_))
        ));
        assert!(matches!(
            store.load("../etc").await,
            Err(ProjectStoreError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_save_rejects_traversal_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalProjectStore::new(dir.path());
        let mut files = FileMap::new();
        files.insert("../escape.txt".into(), "x".into());

        assert!(matches!(
            store.save("s1", &files, Value::Null).await,
            Err(ProjectStoreError::InvalidPath(_))
        ));
        assert!(store.list(10).await.unwrap().is_empty());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_export_formats() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalProjectStore::new(dir.path());
        let id = store.save("s1", &files(), Value::Null).await.unwrap();

        let tar = store.export(&id, ExportFormat::Tar).await.unwrap();
        let entries = archive_entries(&tar);
        let paths: Vec<_> = entries.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, ["app/src/App.tsx", "metadata.json", "package.json"]);
        assert_eq!(entries[0].1, "<header/><empty/>");

        let gz = store.export(&id, ExportFormat::TarGz).await.unwrap();
        let mut unpacked = Vec::new();
        GzDecoder::new(gz.as_slice()).read_to_end(&mut unpacked).unwrap();
        assert_eq!(archive_entries(&unpacked), entries);

        assert!(matches!(
            store.export("missing", ExportFormat::Tar).await,
            Err(ProjectStoreError::NotFound(_))
        ));
    }
}

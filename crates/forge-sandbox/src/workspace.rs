//! Reading a sandbox's project sources.

use forge_core::{FileMap, ProjectSnapshot};
use tracing::{debug, warn};

use crate::{error::SandboxError, orchestrator::SandboxOrchestrator};

/// Extensions of files shown to the model and the client.
pub const SOURCE_EXTENSIONS: &[&str] = &[".js", ".jsx", ".ts", ".tsx", ".css", ".json", ".html", ".md"];

/// Manifest used when a sandbox has no `package.json`.
pub const DEFAULT_MANIFEST: &str = r#"{
  "name": "react-app",
  "private": true,
  "version": "0.0.0",
  "type": "module",
  "scripts": {
    "dev": "vite",
    "build": "vite build",
    "preview": "vite preview"
  },
  "dependencies": {
    "react": "^18.2.0",
    "react-dom": "^18.2.0"
  },
  "devDependencies": {
    "@vitejs/plugin-react": "^4.2.0",
    "vite": "^5.0.0"
  }
}"#;

fn is_source_file(path: &str) -> bool {
    SOURCE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

impl SandboxOrchestrator {
    /// Current source files and manifest of a sandbox.
    ///
    /// Files that are not valid UTF-8 are skipped.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::DownloadFailed` if the source tree cannot be
    /// listed.
    pub async fn load_code(&self, sandbox_id: &str) -> Result<ProjectSnapshot, SandboxError> {
        let root = self.config().source_root();
        let listed = self
            .backend()
            .list_files(sandbox_id, &root)
            .await
            .map_err(|e| SandboxError::DownloadFailed {
                sandbox_id: sandbox_id.to_string(),
                reason: e.to_string(),
            })?;

        let paths: Vec<String> = listed.into_iter().filter(|p| is_source_file(p)).collect();
        let mut files = FileMap::new();
        for (path, bytes) in self.download(sandbox_id, &paths).await {
            match String::from_utf8(bytes) {
                Ok(text) => {
                    files.insert(path, text);
                }
                Err(_) => warn!(%sandbox_id, %path, "Skipping binary file"),
            }
        }

        let manifest_path = self.config().manifest_path();
        let manifest = self
            .download(sandbox_id, std::slice::from_ref(&manifest_path))
            .await
            .remove(&manifest_path)
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_else(|| {
                debug!(%sandbox_id, "No package.json, using default manifest");
                DEFAULT_MANIFEST.to_string()
            });

        debug!(%sandbox_id, files = files.len(), "Loaded sandbox code");
        Ok(ProjectSnapshot { files, manifest })
    }
}

//! Filesystem layout for downloaded models.
//!
//! All model artifacts live under `<data-root>/sherpa-onnx/models/<kind>/`,
//! one directory per model id. The data root is injected so tests can
//! redirect the whole tree into a sandbox.

use std::path::{Component, Path, PathBuf};

use crate::core::metadata::{ModelMetadata, ModuleKind};
use crate::errors::{RuntimeError, RuntimeResult};

/// Directory name that anchors everything this crate writes.
pub const APP_DIR_NAME: &str = "sherpa-onnx";

/// Subdirectory holding per-kind model trees.
pub const MODELS_DIR_NAME: &str = "models";

/// Suffixes recognised as compressed archives when choosing a staging path.
pub const ARCHIVE_SUFFIXES: &[&str] = &[
    ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tb2", ".tar", ".zip", ".gz", ".bz2",
];

/// Resolves module, model and file paths under a fixed data root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    data_root: PathBuf,
}

impl PathResolver {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// `<data-root>/sherpa-onnx`.
    pub fn app_root(&self) -> PathBuf {
        self.data_root.join(APP_DIR_NAME)
    }

    /// Location of the optional managed manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.app_root().join("manifest.json")
    }

    /// Root directory shared by all models of one kind.
    pub fn module_root(&self, kind: ModuleKind) -> PathBuf {
        self.app_root().join(MODELS_DIR_NAME).join(kind.as_dir_name())
    }

    /// Directory holding the files of one model.
    pub fn model_root(&self, metadata: &ModelMetadata) -> RuntimeResult<PathBuf> {
        if metadata.model_id.trim().is_empty() {
            return Err(RuntimeError::Precondition(
                "model id must not be empty".to_string(),
            ));
        }
        self.contain(self.module_root(metadata.module_kind).join(&metadata.model_id))
    }

    /// Absolute path of one logical model file.
    pub fn model_file_path(&self, metadata: &ModelMetadata, name: &str) -> RuntimeResult<PathBuf> {
        if name.trim().is_empty() {
            return Err(RuntimeError::Precondition(
                "file name must not be empty".to_string(),
            ));
        }
        self.contain(self.model_root(metadata)?.join(name))
    }

    /// Where the downloaded artifact is staged before extraction.
    ///
    /// Archives land next to the model directory (they extract into it);
    /// plain files go straight into the model directory.
    pub fn staging_path(&self, metadata: &ModelMetadata) -> RuntimeResult<PathBuf> {
        let file_name = url_file_name(&metadata.download_url).ok_or_else(|| {
            RuntimeError::Precondition(format!(
                "download url '{}' has no file name",
                metadata.download_url
            ))
        })?;

        let base = if is_archive_name(&file_name) {
            self.module_root(metadata.module_kind)
        } else {
            self.model_root(metadata)?
        };
        self.contain(base.join(file_name))
    }

    /// Normalise `path` and assert it stays under the data root.
    fn contain(&self, path: PathBuf) -> RuntimeResult<PathBuf> {
        let normalized = normalize(&path);
        let root = normalize(&self.data_root);
        if normalized.starts_with(&root) {
            Ok(normalized)
        } else {
            Err(RuntimeError::Security(format!(
                "{} escapes data root {}",
                path.display(),
                self.data_root.display()
            )))
        }
    }
}

/// Whether a file name carries a recognised compressed suffix.
pub fn is_archive_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ARCHIVE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

/// Last path segment of a URL, query and fragment stripped.
pub fn url_file_name(url: &str) -> Option<String> {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .map(str::to_string)
}

/// Lexically normalise a path: fold `.` away and resolve `..` against
/// preceding components without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

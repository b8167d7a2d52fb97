//! Notebook identity, path helpers and managed-notebook detection.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Extension of the live-script files produced by conversion.
pub const LIVE_SCRIPT_EXTENSION: &str = "mlx";

/// The notebook a channel or workflow is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookRef {
    /// Host-assigned identity (panel id); key of the channel registry.
    pub id: String,
    /// Notebook path, relative to the server root or absolute.
    pub path: PathBuf,
    /// `language` from the notebook's kernelspec metadata.
    #[serde(default)]
    pub kernel_language: Option<String>,
}

impl NotebookRef {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            kernel_language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.kernel_language = Some(language.into());
        self
    }

    /// Notebook path resolved against the server root when it is relative.
    pub fn absolute_path(&self, server_root: Option<&Path>) -> PathBuf {
        match server_root {
            Some(root) if self.path.is_relative() => root.join(&self.path),
            _ => self.path.clone(),
        }
    }

    /// `<dir>/<stem>.mlx` next to the notebook.
    pub fn default_live_script_path(&self, server_root: Option<&Path>) -> PathBuf {
        self.absolute_path(server_root)
            .with_extension(LIVE_SCRIPT_EXTENSION)
    }
}

/// Append `.mlx` unless the name already carries it.
pub fn with_live_script_extension(name: &str) -> String {
    let suffix = format!(".{}", LIVE_SCRIPT_EXTENSION);
    if name.to_ascii_lowercase().ends_with(&suffix) {
        name.to_string()
    } else {
        format!("{}{}", name, suffix)
    }
}

/// Decides whether a notebook gets a channel at all.
pub trait NotebookClassifier: Send + Sync {
    fn is_managed(&self, notebook: &NotebookRef) -> bool;
}

/// Manages `.ipynb` notebooks whose kernelspec language matches.
pub struct KernelLanguageClassifier {
    language: String,
}

impl KernelLanguageClassifier {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
        }
    }
}

impl NotebookClassifier for KernelLanguageClassifier {
    fn is_managed(&self, notebook: &NotebookRef) -> bool {
        let is_ipynb = notebook
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("ipynb"));
        let language_matches = notebook
            .kernel_language
            .as_deref()
            .is_some_and(|lang| lang.eq_ignore_ascii_case(&self.language));
        is_ipynb && language_matches
    }
}

//! Skill source tree snapshot.
//!
//! Loading reads every regular file under the skill root once. Files with a
//! scannable extension keep their text for the auditor; everything
//! contributes to the source digest that identifies the audited version,
//! except the excluded directories (the skill's declared output) which
//! change from run to run.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Extensions of compiled or otherwise opaque artifacts.
const BINARY_EXTENSIONS: &[&str] = &["so", "dll", "dylib", "pyc", "pyo", "exe", "class", "wasm", "o", "a"];

/// Directories never descended into.
const SKIPPED_DIRS: &[&str] = &[".git"];

/// How a file was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Scannable source text.
    Text,
    /// Compiled artifact the auditor cannot inspect.
    Binary,
    /// Text file above the scan size limit.
    Oversized,
    /// File with an extension outside the scan set (digest only).
    Other,
}

/// One file in the tree.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the skill root.
    pub path: PathBuf,
    /// Capture kind.
    pub kind: FileKind,
    /// File contents for [`FileKind::Text`], empty otherwise.
    pub contents: String,
}

/// Errors while reading a source tree.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// A path could not be read.
    #[error("cannot read {path}: {source}")]
    Access {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Snapshot of a skill directory.
#[derive(Debug, Clone)]
pub struct SourceTree {
    root: PathBuf,
    files: Vec<SourceFile>,
    escaping_links: Vec<(PathBuf, PathBuf)>,
    digest: String,
}

impl SourceTree {
    /// Load a skill directory.
    ///
    /// `extensions` selects which files are read as scannable text;
    /// `max_file_bytes` caps how much text a single file may contribute.
    /// Directories in `excluded` (relative to `root`) are neither scanned nor
    /// digested.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Access`] when the root or any entry cannot be
    /// read.
    pub fn load(
        root: &Path,
        extensions: &[String],
        max_file_bytes: u64,
        excluded: &[PathBuf],
    ) -> Result<Self, SourceError> {
        let canonical_root = std::fs::canonicalize(root).map_err(|source| SourceError::Access {
            path: root.to_path_buf(),
            source,
        })?;

        let mut files = Vec::new();
        let mut escaping_links = Vec::new();
        let mut hasher = Sha256::new();
        let mut stack = vec![canonical_root.clone()];
        let mut entries: Vec<PathBuf> = Vec::new();

        while let Some(dir) = stack.pop() {
            let read = std::fs::read_dir(&dir).map_err(|source| SourceError::Access {
                path: dir.clone(),
                source,
            })?;
            for entry in read {
                let entry = entry.map_err(|source| SourceError::Access {
                    path: dir.clone(),
                    source,
                })?;
                let path = entry.path();
                let meta =
                    std::fs::symlink_metadata(&path).map_err(|source| SourceError::Access {
                        path: path.clone(),
                        source,
                    })?;

                if meta.file_type().is_symlink() {
                    let relative = relative_to(&canonical_root, &path);
                    match std::fs::canonicalize(&path) {
                        Ok(target) if target.starts_with(&canonical_root) => {}
                        Ok(target) => escaping_links.push((relative, target)),
                        // Dangling link: record the raw target.
                        Err(_) => {
                            let target = std::fs::read_link(&path).unwrap_or_default();
                            let climbs = target
                                .components()
                                .any(|c| matches!(c, std::path::Component::ParentDir));
                            if target.is_absolute() || climbs {
                                escaping_links.push((relative, target));
                            }
                        }
                    }
                    continue;
                }

                if meta.is_dir() {
                    let skip = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| SKIPPED_DIRS.contains(&n))
                        || excluded.contains(&relative_to(&canonical_root, &path));
                    if !skip {
                        stack.push(path);
                    }
                } else if meta.is_file() {
                    entries.push(path);
                }
            }
        }

        entries.sort();
        for path in entries {
            let bytes = std::fs::read(&path).map_err(|source| SourceError::Access {
                path: path.clone(),
                source,
            })?;
            let relative = relative_to(&canonical_root, &path);

            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(&bytes);
            hasher.update([0u8]);

            let extension = relative
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
                .unwrap_or_default();

            let byte_len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
            let (kind, contents) = if BINARY_EXTENSIONS.contains(&extension.as_str()) {
                (FileKind::Binary, String::new())
            } else if !extensions.iter().any(|e| e == &extension) {
                (FileKind::Other, String::new())
            } else if byte_len > max_file_bytes {
                (FileKind::Oversized, String::new())
            } else {
                (FileKind::Text, String::from_utf8_lossy(&bytes).into_owned())
            };

            files.push(SourceFile {
                path: relative,
                kind,
                contents,
            });
        }

        escaping_links.sort();
        Ok(Self {
            root: canonical_root,
            files,
            escaping_links,
            digest: hex::encode(hasher.finalize()),
        })
    }

    /// Build a tree from in-memory text files.
    ///
    /// Every file is treated as scannable text; the digest covers the given
    /// paths and contents in sorted order.
    pub fn from_files(root: impl Into<PathBuf>, files: Vec<(PathBuf, String)>) -> Self {
        let mut files = files;
        files.sort_by(|a, b| a.0.cmp(&b.0));
        let mut hasher = Sha256::new();
        for (path, contents) in &files {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(contents.as_bytes());
            hasher.update([0u8]);
        }
        Self {
            root: root.into(),
            files: files
                .into_iter()
                .map(|(path, contents)| SourceFile {
                    path,
                    kind: FileKind::Text,
                    contents,
                })
                .collect(),
            escaping_links: Vec::new(),
            digest: hex::encode(hasher.finalize()),
        }
    }

    /// Canonical skill root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Captured files in path order.
    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    /// Symlinks that resolve outside the root, as `(link, target)` pairs.
    pub fn escaping_links(&self) -> &[(PathBuf, PathBuf)] {
        &self.escaping_links
    }

    /// Hex SHA-256 digest over all file paths and contents.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

fn relative_to(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}

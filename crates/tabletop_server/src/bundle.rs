//! Rule bundle provider.
//!
//! The server only needs two facts about the installed game rules: where they
//! live on disk (the engine's working directory) and a fingerprint that
//! changes whenever their content does.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ServerError;

/// Source of the active rule bundle.
pub trait BundleProvider: Send + Sync {
    /// Directory the rule engine is started in.
    fn directory(&self) -> PathBuf;

    /// Recomputes the bundle fingerprint.
    fn fingerprint(&self) -> Result<String, ServerError>;
}

/// A bundle that is simply a directory tree.
///
/// The fingerprint is the hex SHA-256 over every regular file, visited in
/// sorted relative-path order, hashing the path followed by the contents.
#[derive(Debug, Clone)]
pub struct DirectoryBundle {
    root: PathBuf,
}

impl DirectoryBundle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collect(&self, dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), ServerError> {
        let entries = fs::read_dir(dir).map_err(|e| {
            ServerError::Bundle(format!("Cannot read {}: {e}", dir.display()))
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| ServerError::Bundle(e.to_string()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|e| ServerError::Bundle(e.to_string()))?;
            if file_type.is_dir() {
                self.collect(&path, files)?;
            } else if file_type.is_file() {
                files.push(path);
            }
        }
        Ok(())
    }
}

impl BundleProvider for DirectoryBundle {
    fn directory(&self) -> PathBuf {
        self.root.clone()
    }

    fn fingerprint(&self) -> Result<String, ServerError> {
        let mut files = Vec::new();
        self.collect(&self.root, &mut files)?;

        let mut relative: Vec<(String, PathBuf)> = files
            .into_iter()
            .map(|path| {
                let rel = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                (rel, path)
            })
            .collect();
        relative.sort();

        let mut hasher = Sha256::new();
        for (rel, path) in relative {
            let contents = fs::read(&path).map_err(|e| {
                ServerError::Bundle(format!("Cannot read {}: {e}", path.display()))
            })?;
            hasher.update(rel.as_bytes());
            hasher.update([0u8]);
            hasher.update((contents.len() as u64).to_le_bytes());
            hasher.update(&contents);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("lua")).unwrap();
        fs::write(dir.path().join("lua/core.lua"), "return 1").unwrap();
        fs::write(dir.path().join("init.lua"), "print('hi')").unwrap();

        let bundle = DirectoryBundle::new(dir.path());
        let first = bundle.fingerprint().unwrap();
        assert_eq!(first.len(), 64);
        assert_eq!(first, bundle.fingerprint().unwrap());

        fs::write(dir.path().join("lua/core.lua"), "return 2").unwrap();
        assert_ne!(first, bundle.fingerprint().unwrap());
    }

    #[test]
    fn test_file_boundaries_are_part_of_fingerprint() {
        let split = tempfile::tempdir().unwrap();
        fs::write(split.path().join("a.lua"), "1").unwrap();
        fs::write(split.path().join("b.lua"), "2").unwrap();

        // same bytes as the two files above when streamed back to back
        let merged = tempfile::tempdir().unwrap();
        fs::write(merged.path().join("a.lua"), "1b.lua\x002").unwrap();

        assert_ne!(
            DirectoryBundle::new(split.path()).fingerprint().unwrap(),
            DirectoryBundle::new(merged.path()).fingerprint().unwrap()
        );
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let bundle = DirectoryBundle::new("/nonexistent/bundle/dir");
        assert!(matches!(bundle.fingerprint(), Err(ServerError::Bundle(_))));
    }
}

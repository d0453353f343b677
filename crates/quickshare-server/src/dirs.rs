use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// The directory holding the database and key material.
///
/// ```text
/// <root>/quickshare.db     redb database
/// <root>/quickshare.key    generated master key (no passphrase configured)
/// <root>/quickshare.salt   salt for a passphrase-derived master key
/// ```
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Use `configured` when set, otherwise the platform data dir
    /// (`~/.local/share/quickshare/` on Linux). Created if missing.
    pub fn resolve(configured: Option<&Path>) -> Result<Self> {
        let root = match configured {
            Some(dir) => dir.to_owned(),
            None => ProjectDirs::from("", "", "quickshare")
                .context("could not determine platform data directory")?
                .data_dir()
                .to_owned(),
        };
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create data dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database(&self) -> PathBuf {
        self.root.join("quickshare.db")
    }

    pub fn key_file(&self) -> PathBuf {
        self.root.join("quickshare.key")
    }

    pub fn salt_file(&self) -> PathBuf {
        self.root.join("quickshare.salt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn configured_dir_is_created() {
        let tmp = tempdir().unwrap();
        let nested = tmp.path().join("a/b");
        let dir = DataDir::resolve(Some(&nested)).unwrap();
        assert!(nested.is_dir());
        assert_eq!(dir.root(), nested);
        assert_eq!(dir.database(), nested.join("quickshare.db"));
    }
}

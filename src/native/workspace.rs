use std::{
    io,
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::core::domain::{BuildConfig, CaseId};

const HASH_PREFIX_LEN: usize = 12;
const CASE_HASH_LEN: usize = 8;

/// Scratch directory owned by a single run. Every (case, config) unit gets
/// its own subdirectory, so no two units ever share a path.
#[derive(Debug)]
pub struct RunWorkspace {
    root: PathBuf,
    keep: bool,
    removed: bool,
}

impl RunWorkspace {
    pub fn create(base: &Path, run_id: Uuid, keep: bool) -> io::Result<Self> {
        let root = base.join(format!("ubdiff-{}", run_id));
        std::fs::create_dir_all(&root)?;
        tracing::debug!(root = %root.display(), keep, "Created run workspace");
        Ok(RunWorkspace {
            root,
            keep,
            removed: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<case>-<hash8>/<config>-<hash12>`. The case hash is taken over
    /// the raw id, so ids that sanitize alike still get separate directories.
    /// The config hash covers the compiler and flags, so a renamed
    /// configuration never reuses a stale directory.
    pub fn unit_dir(&self, case: &CaseId, config: &BuildConfig) -> PathBuf {
        let case_hash = hex::encode(Sha256::digest(case.0.as_bytes()));
        let config_hash = config.content_hash();
        let case_dir = format!("{}-{}", sanitize(&case.0), &case_hash[..CASE_HASH_LEN]);
        let config_dir = format!(
            "{}-{}",
            sanitize(&config.name.0),
            &config_hash[..HASH_PREFIX_LEN.min(config_hash.len())]
        );
        self.root.join(case_dir).join(config_dir)
    }

    pub async fn prepare_unit(&self, case: &CaseId, config: &BuildConfig) -> io::Result<PathBuf> {
        let dir = self.unit_dir(case, config);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Removes the workspace unless artifacts are being kept.
    pub fn close(mut self) -> io::Result<()> {
        self.remove()
    }

    fn remove(&mut self) -> io::Result<()> {
        if self.keep || self.removed {
            return Ok(());
        }
        self.removed = true;
        match std::fs::remove_dir_all(&self.root) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }
}

impl Drop for RunWorkspace {
    fn drop(&mut self) {
        if let Err(err) = self.remove() {
            tracing::warn!(root = %self.root.display(), "Failed to remove workspace: {}", err);
        }
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_dirs_are_distinct_per_key() {
        let base = tempfile::tempdir().unwrap();
        let workspace = RunWorkspace::create(base.path(), Uuid::new_v4(), false).unwrap();
        let o0 = BuildConfig::new("gcc_o0", "g++", &["-O0"]);
        let o2 = BuildConfig::new("gcc_o2", "g++", &["-O2"]);

        let a = workspace.unit_dir(&"test_shift".into(), &o0);
        let b = workspace.unit_dir(&"test_shift".into(), &o2);
        let c = workspace.unit_dir(&"test_accumulate".into(), &o0);

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(workspace.root()));
        let leaf = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(leaf.starts_with("gcc_o0-"));
        assert_eq!(leaf.len(), "gcc_o0-".len() + 12);
    }

    #[test]
    fn test_ids_that_sanitize_alike_get_separate_dirs() {
        let base = tempfile::tempdir().unwrap();
        let workspace = RunWorkspace::create(base.path(), Uuid::new_v4(), false).unwrap();
        let o2 = BuildConfig::new("gcc_o2", "g++", &["-O2"]);

        let plus = workspace.unit_dir(&"test+1".into(), &o2);
        let underscore = workspace.unit_dir(&"test_1".into(), &o2);

        assert_ne!(plus, underscore);
        assert_ne!(plus.parent(), underscore.parent());
        let case_dir = underscore.parent().unwrap().file_name().unwrap();
        assert!(case_dir.to_string_lossy().starts_with("test_1-"));
    }

    #[test]
    fn test_hostile_ids_stay_inside_root() {
        let base = tempfile::tempdir().unwrap();
        let workspace = RunWorkspace::create(base.path(), Uuid::new_v4(), false).unwrap();
        let config = BuildConfig::new("../../etc", "g++", &[]);

        let dir = workspace.unit_dir(&"..".into(), &config);

        assert!(dir.starts_with(workspace.root()));
        assert!(!dir.components().any(|c| c == std::path::Component::ParentDir));
    }

    #[tokio::test]
    async fn test_close_removes_tree() {
        let base = tempfile::tempdir().unwrap();
        let workspace = RunWorkspace::create(base.path(), Uuid::new_v4(), false).unwrap();
        let dir = workspace
            .prepare_unit(&"case".into(), &BuildConfig::new("o0", "cc", &["-O0"]))
            .await
            .unwrap();
        std::fs::write(dir.join("a.out"), b"binary").unwrap();
        let root = workspace.root().to_path_buf();

        workspace.close().unwrap();

        assert!(!root.exists());
    }

    #[test]
    fn test_keep_preserves_tree_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let workspace = RunWorkspace::create(base.path(), Uuid::new_v4(), true).unwrap();
        let root = workspace.root().to_path_buf();

        drop(workspace);

        assert!(root.exists());
    }

    #[test]
    fn test_drop_removes_tree() {
        let base = tempfile::tempdir().unwrap();
        let workspace = RunWorkspace::create(base.path(), Uuid::new_v4(), false).unwrap();
        let root = workspace.root().to_path_buf();

        drop(workspace);

        assert!(!root.exists());
    }
}

use anyhow::{Context, Result};
use rand::Rng;
use std::path::{Path, PathBuf};

/// Layout of the per-host werf directory (`~/.werf` by default):
/// `builds/<project>/` persistent build scratch, `tmp/<random>/` per-invocation
/// temp roots, `locks/` advisory lock files.
#[derive(Debug, Clone)]
pub struct WerfHome {
    root: PathBuf,
}

impl WerfHome {
    /// Resolve the home directory: explicit option, then `WERF_HOME`,
    /// then `~/.werf`.
    pub fn resolve(home_dir: Option<&Path>) -> Result<Self> {
        let root = match home_dir {
            Some(dir) => dir.to_path_buf(),
            None => match std::env::var_os("WERF_HOME") {
                Some(dir) => PathBuf::from(dir),
                None => dirs::home_dir()
                    .context("cannot determine home directory")?
                    .join(".werf"),
            },
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-project persistent build scratch, created on demand.
    pub fn project_build_dir(&self, project_name: &str) -> Result<PathBuf> {
        let dir = self.root.join("builds").join(project_name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating build dir {}", dir.display()))?;
        Ok(dir)
    }

    pub fn locks_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join("locks");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating locks dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Create a fresh per-invocation temp root under `tmp/`.
    pub fn create_tmp_dir(&self, tmp_dir: Option<&Path>) -> Result<ProjectTmpDir> {
        let base = match tmp_dir {
            Some(dir) => dir.to_path_buf(),
            None => self.root.join("tmp"),
        };
        std::fs::create_dir_all(&base)
            .with_context(|| format!("creating tmp base {}", base.display()))?;

        let suffix: String = rand::thread_rng()
            .sample_iter(rand::distributions::Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        let path = base.join(format!("werf-{suffix}"));
        std::fs::create_dir(&path)
            .with_context(|| format!("creating tmp dir {}", path.display()))?;

        Ok(ProjectTmpDir { path })
    }
}

/// Per-invocation temp root. Released (deleted) on success; left behind on
/// failure so failed build state can be inspected.
#[derive(Debug)]
pub struct ProjectTmpDir {
    path: PathBuf,
}

impl ProjectTmpDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            tracing::warn!(dir = %self.path.display(), error = %e, "failed to release tmp dir");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_home_dir_wins() {
        let tmp = TempDir::new().unwrap();
        let home = WerfHome::resolve(Some(tmp.path())).unwrap();
        assert_eq!(home.root(), tmp.path());
    }

    #[test]
    fn build_dir_is_per_project() {
        let tmp = TempDir::new().unwrap();
        let home = WerfHome::resolve(Some(tmp.path())).unwrap();
        let dir = home.project_build_dir("myapp").unwrap();
        assert!(dir.ends_with("builds/myapp"));
        assert!(dir.is_dir());
    }

    #[test]
    fn tmp_dirs_are_unique_and_released() {
        let tmp = TempDir::new().unwrap();
        let home = WerfHome::resolve(Some(tmp.path())).unwrap();
        let a = home.create_tmp_dir(None).unwrap();
        let b = home.create_tmp_dir(None).unwrap();
        assert_ne!(a.path(), b.path());

        let path = a.path().to_path_buf();
        a.release();
        assert!(!path.exists());
        assert!(b.path().exists());
    }
}

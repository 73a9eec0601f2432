//! Canonical paths under `.fixloop/` and scaffolding for a fresh repository.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::io::config::{FixloopConfig, write_config};

/// Name of the state directory at the repository root. Entirely git-ignored.
pub const STATE_DIR_NAME: &str = ".fixloop";

const STATE_GITIGNORE: &str = "*\n";

/// All canonical paths within `.fixloop/` for a project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub memory_dir: PathBuf,
    pub record_path: PathBuf,
    pub heuristics_path: PathBuf,
    pub tiers_path: PathBuf,
    pub iterations_dir: PathBuf,
    pub diagnostics_dir: PathBuf,
    pub stop_path: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(STATE_DIR_NAME);
        let memory_dir = state_dir.join("memory");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            gitignore_path: state_dir.join(".gitignore"),
            config_path: state_dir.join("config.toml"),
            memory_dir: memory_dir.clone(),
            record_path: memory_dir.join("iteration_record.json"),
            heuristics_path: memory_dir.join("heuristics.json"),
            tiers_path: state_dir.join("tiers.json"),
            iterations_dir: state_dir.join("iterations"),
            diagnostics_dir: state_dir.join("diagnostics"),
            stop_path: state_dir.join("STOP"),
        }
    }

    pub fn iteration_dir(&self, run_id: &str, iter: u32) -> PathBuf {
        self.iterations_dir.join(run_id).join(iter.to_string())
    }
}

/// Create `.fixloop/` with its `.gitignore` and a default `config.toml`.
///
/// Existing files are kept unless `force` is set; the `.gitignore` is always ensured.
pub fn init_state_dir(root: &Path, force: bool) -> Result<StatePaths> {
    let paths = StatePaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "{} exists but is not a directory",
            paths.state_dir.display()
        ));
    }
    for dir in [&paths.state_dir, &paths.memory_dir, &paths.iterations_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    ensure_gitignore(&paths.gitignore_path)?;
    if force || !paths.config_path.exists() {
        debug!(path = %paths.config_path.display(), "writing default config");
        write_config(&paths.config_path, &FixloopConfig::default())?;
    }
    Ok(paths)
}

fn ensure_gitignore(path: &Path) -> Result<()> {
    let existing = fs::read_to_string(path).unwrap_or_default();
    if existing.lines().any(|line| line.trim() == "*") {
        return Ok(());
    }
    fs::write(path, STATE_GITIGNORE).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable() {
        let paths = StatePaths::new("/repo");
        assert!(paths.config_path.ends_with(".fixloop/config.toml"));
        assert!(paths.record_path.ends_with(".fixloop/memory/iteration_record.json"));
        assert!(
            paths
                .iteration_dir("run-1", 3)
                .ends_with(".fixloop/iterations/run-1/3")
        );
    }

    #[test]
    fn init_writes_gitignore_and_config_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_state_dir(temp.path(), false).expect("init");
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            "*\n"
        );
        fs::write(&paths.config_path, "[loop]\nmax_loops = 2\n").expect("edit config");
        init_state_dir(temp.path(), false).expect("re-init");
        assert!(
            fs::read_to_string(&paths.config_path)
                .expect("read")
                .contains("max_loops = 2")
        );
    }
}

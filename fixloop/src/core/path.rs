//! Repository-relative path validation for agent-supplied paths.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, anyhow};

/// Validate an agent-supplied path and return it relative to the repository root.
///
/// Rejects absolute paths, parent traversal, and anything under `.git/` or the
/// fixloop state directory.
pub fn confined_relative_path(raw: &str, state_dir_name: &str) -> Result<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("path must not be empty"));
    }
    let path = Path::new(trimmed);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                return Err(anyhow!("path '{trimmed}' escapes the repository"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("path '{trimmed}' must be relative"));
            }
        }
    }
    let Some(Component::Normal(first)) = out.components().next() else {
        return Err(anyhow!("path '{trimmed}' names no file"));
    };
    if first == ".git" || first == state_dir_name {
        return Err(anyhow!("path '{trimmed}' is reserved"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_relative_paths() {
        assert_eq!(
            confined_relative_path("./src/lib.rs", ".fixloop").expect("ok"),
            PathBuf::from("src/lib.rs")
        );
    }

    #[test]
    fn rejects_escapes_and_reserved_dirs() {
        for raw in ["", "/etc/passwd", "../x", "src/../../x", ".git/config", ".fixloop/state.json", "."] {
            assert!(
                confined_relative_path(raw, ".fixloop").is_err(),
                "expected rejection for {raw:?}"
            );
        }
    }
}

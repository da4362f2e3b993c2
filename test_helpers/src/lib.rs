//! Testing infrastructure for the mosaicking workspace.
//!
//! Provides workspace-root discovery, a persistent `test_output/` directory
//! for artifacts worth inspecting by hand (mosaics, weight maps), and the
//! synthetic data generators in [`synthetic`] that the engine tests are
//! built on.
//!
//! # Output Organization
//! ```text
//! test_output/
//! ├── mosaic/           # Mosaics and weight maps written by end-to-end tests
//! └── ...               # Anything else a test wants to keep
//! ```
//!
//! # Usage
//! ```rust
//! use test_helpers::output_path;
//!
//! let mosaic_path = output_path("mosaic/two_field.fits");
//! assert!(mosaic_path.starts_with(test_helpers::get_output_dir()));
//! ```

pub mod synthetic;

use once_cell::sync::Lazy;
use std::env;
use std::path::{Path, PathBuf};

/// Errors raised while locating test infrastructure
#[derive(thiserror::Error, Debug)]
pub enum TestHelperError {
    /// No `Cargo.toml` with a `[workspace]` table above the current directory
    #[error("Failed to find project root: {0}")]
    ProjectRootNotFound(String),
}

/// Locate the workspace root by walking up from the current directory.
///
/// The root is the first directory whose `Cargo.toml` declares a
/// `[workspace]` table, so this works from any member crate's test run.
pub fn find_project_root() -> Result<PathBuf, TestHelperError> {
    let mut current_dir = env::current_dir().map_err(|e| {
        TestHelperError::ProjectRootNotFound(format!("Failed to get current directory: {e}"))
    })?;

    loop {
        let cargo_toml = current_dir.join("Cargo.toml");
        if cargo_toml.exists() {
            let content = std::fs::read_to_string(&cargo_toml).map_err(|e| {
                TestHelperError::ProjectRootNotFound(format!("Failed to read Cargo.toml: {e}"))
            })?;

            if content.contains("[workspace]") {
                return Ok(current_dir);
            }
        }

        if !current_dir.pop() {
            break;
        }
    }

    Err(TestHelperError::ProjectRootNotFound(
        "Workspace root not found".to_string(),
    ))
}

static PROJECT_ROOT: Lazy<PathBuf> =
    Lazy::new(|| find_project_root().expect("Failed to find project root directory"));

/// `<workspace>/test_output`, created on first use
pub fn get_output_dir() -> PathBuf {
    let output_dir = PROJECT_ROOT.join("test_output");

    if !output_dir.exists() {
        std::fs::create_dir_all(&output_dir).expect("Failed to create output directory");
    }

    output_dir
}

/// Path of an artifact inside the test output directory.
///
/// Parent directories of `path` are created so the result can be written
/// to immediately.
pub fn output_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let full = get_output_dir().join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create output subdirectory");
    }
    full
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_root_has_workspace_manifest() {
        let root = find_project_root().expect("Failed to find project root");
        assert!(root.join("Cargo.toml").exists());
        assert!(root.join("mosaic").is_dir());
    }

    #[test]
    fn test_output_path_creates_parent() {
        let path = output_path("helpers_selftest/nested/file.txt");
        assert!(path.parent().unwrap().is_dir());
        assert!(path.starts_with(get_output_dir()));
    }
}

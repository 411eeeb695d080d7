use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("home directory not found, set $HOME")]
    HomeNotFound,
}

/// Centralized path construction for the `~/.ptymux/` directory layout.
///
/// Single source of truth for every path under `~/.ptymux/`. Use `resolve()` in
/// production code and `from_dir()` in tests.
#[derive(Debug, Clone)]
pub struct PtymuxPaths {
    base_dir: PathBuf,
}

impl PtymuxPaths {
    /// Resolve paths from the user's home directory (`~/.ptymux`).
    pub fn resolve() -> Result<Self, PathError> {
        let home = dirs::home_dir().ok_or(PathError::HomeNotFound)?;
        Ok(Self {
            base_dir: home.join(".ptymux"),
        })
    }

    /// Resolve from the home directory, falling back to `/tmp/.ptymux` when
    /// `$HOME` cannot be determined (minimal containers, cron).
    pub fn resolve_or_tmp() -> Self {
        Self::resolve().unwrap_or_else(|_| Self::from_dir(PathBuf::from("/tmp/.ptymux")))
    }

    /// Create paths from an explicit base directory. Use in tests.
    pub fn from_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// The base `~/.ptymux` directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    // --- Top-level files ---

    pub fn user_config(&self) -> PathBuf {
        self.base_dir.join("config.toml")
    }

    pub fn server_pid_file(&self) -> PathBuf {
        self.base_dir.join("server.pid")
    }

    pub fn server_log_file(&self) -> PathBuf {
        self.base_dir.join("server.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths() -> PtymuxPaths {
        PtymuxPaths::from_dir(PathBuf::from("/home/user/.ptymux"))
    }

    #[test]
    fn test_resolve_returns_ok_when_home_set() {
        // HOME is set in CI and dev environments
        let result = PtymuxPaths::resolve();
        assert!(result.is_ok());
        let paths = result.unwrap();
        assert!(paths.base_dir().to_string_lossy().contains(".ptymux"));
    }

    #[test]
    fn test_resolve_or_tmp_always_yields_ptymux_dir() {
        let paths = PtymuxPaths::resolve_or_tmp();
        assert!(paths.base_dir().ends_with(".ptymux"));
    }

    #[test]
    fn test_from_dir() {
        let paths = PtymuxPaths::from_dir(PathBuf::from("/tmp/test-ptymux"));
        assert_eq!(paths.base_dir(), Path::new("/tmp/test-ptymux"));
    }

    #[test]
    fn test_user_config() {
        assert_eq!(
            test_paths().user_config(),
            PathBuf::from("/home/user/.ptymux/config.toml")
        );
    }

    #[test]
    fn test_server_pid_file() {
        assert_eq!(
            test_paths().server_pid_file(),
            PathBuf::from("/home/user/.ptymux/server.pid")
        );
    }

    #[test]
    fn test_server_log_file() {
        assert_eq!(
            test_paths().server_log_file(),
            PathBuf::from("/home/user/.ptymux/server.log")
        );
    }
}

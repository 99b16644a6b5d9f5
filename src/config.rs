//! Runtime configuration resolved from environment variables.

use std::path::{Component, Path, PathBuf};

use crate::error::{AppError, AppResult};

/// Root folder that every scenario/lookup database path is resolved against.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_root: PathBuf,
    /// Default project folder for `scan` requests that do not name one.
    pub project_folder: String,
}

impl Default for Config {
    fn default() -> Self {
        Self { data_root: PathBuf::from("data"), project_folder: "Watershed".to_string() }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let data_root = std::env::var("HYDROLENS_DATA_ROOT").unwrap_or_else(|_| "data".to_string());
        let project_folder = std::env::var("HYDROLENS_PROJECT").unwrap_or_else(|_| "Watershed".to_string());
        Self { data_root: PathBuf::from(data_root), project_folder }
    }

    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self { data_root: root.as_ref().to_path_buf(), ..Self::default() }
    }

    /// Join a request-supplied relative path onto the data root.
    /// Absolute paths and parent-directory components are rejected so a
    /// request can never address files outside the configured root.
    pub fn resolve(&self, rel: &str) -> AppResult<PathBuf> {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute() {
            return Err(AppError::validation("absolute_path", "The folder path cannot be absolute."));
        }
        for comp in rel_path.components() {
            match comp {
                Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                    return Err(AppError::validation(
                        "path_traversal",
                        "Paths may not reference locations outside the data root.",
                    ));
                }
                _ => {}
            }
        }
        Ok(self.data_root.join(rel_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_keeps_paths_under_root() {
        let cfg = Config::with_root("/srv/data");
        assert_eq!(cfg.resolve("proj/a.db3").unwrap(), PathBuf::from("/srv/data/proj/a.db3"));
        assert!(cfg.resolve("../etc/passwd").is_err());
        assert!(cfg.resolve("/etc/passwd").is_err());
        assert!(cfg.resolve("a/../../b").is_err());
    }
}

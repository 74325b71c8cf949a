//! XDG directory helpers for config/data locations.

use std::cell::RefCell;
use std::path::PathBuf;

/// Base directory for persistent data (store, logs).
///
/// Uses `GATEMESH_DATA_DIR` if set, otherwise `$XDG_DATA_HOME/gatemesh` or
/// `~/.local/share/gatemesh`.
pub(crate) fn data_dir() -> PathBuf {
    if let Some(dir) = thread_local_data_dir_override() {
        return dir;
    }

    if let Ok(dir) = std::env::var("GATEMESH_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("gatemesh")
}

/// Directory for `config.toml`.
///
/// Uses `GATEMESH_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/gatemesh`
/// or `~/.config/gatemesh`.
pub(crate) fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GATEMESH_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("gatemesh")
}

pub(crate) fn store_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("gate.sqlite")
}

pub(crate) fn log_dir(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("logs")
}

/// Redirect `data_dir()` for the current thread. Tests use this to keep
/// stores inside a tempdir without touching the environment.
#[doc(hidden)]
pub struct DataDirOverride {
    prev: Option<PathBuf>,
}

impl DataDirOverride {
    pub fn new(path: Option<PathBuf>) -> Self {
        let prev = DATA_DIR_OVERRIDE.with(|cell| cell.replace(path));
        Self { prev }
    }
}

impl Drop for DataDirOverride {
    fn drop(&mut self) {
        let prev = self.prev.take();
        DATA_DIR_OVERRIDE.with(|cell| {
            cell.replace(prev);
        });
    }
}

fn thread_local_data_dir_override() -> Option<PathBuf> {
    DATA_DIR_OVERRIDE.with(|cell| cell.borrow().clone())
}

thread_local! {
    static DATA_DIR_OVERRIDE: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_is_scoped() {
        let original = data_dir();
        {
            let _guard = DataDirOverride::new(Some(PathBuf::from("/tmp/gatemesh-test")));
            assert_eq!(data_dir(), PathBuf::from("/tmp/gatemesh-test"));
        }
        assert_eq!(data_dir(), original);
    }
}

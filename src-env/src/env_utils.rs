//! Environment variable utilities for rtfx
//!
//! This module resolves where impulse-response kernels are stored: one
//! user-writable directory and any number of read-only packaged directories.

use crate::constants::{
    APP_DIR, DEFAULT_XDG_DATA_DIRS, FLATPAK_IRS_DIR, IRS_SUBDIR, RTFX_IRS_DIR,
};
use std::env;
use std::path::{Path, PathBuf};

/// Error type for environment variable issues
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error(
        "Neither RTFX_IRS_DIR, XDG_DATA_HOME nor HOME is set; cannot locate the impulse response directory"
    )]
    NoDataHome,

    #[error("RTFX_IRS_DIR points to a path that is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Failed to create impulse response directory {0}: {1}")]
    IrsDirCreationFailed(PathBuf, std::io::Error),
}

/// Get the user impulse-response directory, creating it if necessary
///
/// Resolution order:
/// 1. `RTFX_IRS_DIR`
/// 2. `$XDG_DATA_HOME/rtfx/irs`
/// 3. `$HOME/.local/share/rtfx/irs`
///
/// # Errors
///
/// Returns an error if:
/// - none of the variables above is set
/// - the resolved path exists but is not a directory
/// - the directory cannot be created
///
/// # Example
///
/// ```no_run
/// use rtfx_env::env_utils::get_irs_dir;
///
/// let irs = get_irs_dir()?;
/// println!("Impulse responses: {}", irs.display());
/// # Ok::<(), rtfx_env::env_utils::EnvError>(())
/// ```
pub fn get_irs_dir() -> Result<PathBuf, EnvError> {
    let path = if let Some(dir) = non_empty_var(RTFX_IRS_DIR) {
        PathBuf::from(dir)
    } else if let Some(data_home) = non_empty_var("XDG_DATA_HOME") {
        Path::new(&data_home).join(APP_DIR).join(IRS_SUBDIR)
    } else if let Some(home) = non_empty_var("HOME") {
        Path::new(&home)
            .join(".local")
            .join("share")
            .join(APP_DIR)
            .join(IRS_SUBDIR)
    } else {
        return Err(EnvError::NoDataHome);
    };

    ensure_dir(&path)?;
    Ok(path)
}

/// Create `path` if missing and check that it is a directory
pub fn ensure_dir(path: &Path) -> Result<(), EnvError> {
    if path.exists() {
        if !path.is_dir() {
            return Err(EnvError::NotADirectory(path.to_path_buf()));
        }
        return Ok(());
    }
    std::fs::create_dir_all(path).map_err(|e| EnvError::IrsDirCreationFailed(path.to_path_buf(), e))
}

/// Read-only packaged impulse-response directories, in search order
///
/// Every entry of `XDG_DATA_DIRS` contributes `<dir>/rtfx/irs`. Inside a
/// flatpak sandbox the preset extension directory is appended. Directories
/// are returned whether or not they exist; callers skip missing ones.
pub fn system_irs_dirs() -> Vec<PathBuf> {
    let data_dirs =
        non_empty_var("XDG_DATA_DIRS").unwrap_or_else(|| DEFAULT_XDG_DATA_DIRS.to_string());

    let mut dirs: Vec<PathBuf> = data_dirs
        .split(':')
        .filter(|d| !d.is_empty())
        .map(|d| Path::new(d).join(APP_DIR).join(IRS_SUBDIR))
        .collect();

    if is_flatpak() {
        dirs.push(PathBuf::from(FLATPAK_IRS_DIR));
    }

    dirs.dedup();
    dirs
}

/// True when running inside a flatpak sandbox
pub fn is_flatpak() -> bool {
    non_empty_var("FLATPAK_ID").is_some() || Path::new("/.flatpak-info").exists()
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

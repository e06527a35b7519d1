//! Environment and storage-location helpers for rtfx.

pub mod constants;
pub mod env_utils;

pub use env_utils::{EnvError, get_irs_dir, is_flatpak, system_irs_dirs};

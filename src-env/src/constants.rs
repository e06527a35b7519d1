/// Overrides the user impulse-response directory
pub const RTFX_IRS_DIR: &str = "RTFX_IRS_DIR";

/// Application directory below the XDG data directories
pub const APP_DIR: &str = "rtfx";

/// Impulse-response subdirectory below [`APP_DIR`]
pub const IRS_SUBDIR: &str = "irs";

/// Searched when `XDG_DATA_DIRS` is unset
pub const DEFAULT_XDG_DATA_DIRS: &str = "/usr/local/share:/usr/share";

/// Preset extension mount point inside a flatpak sandbox
pub const FLATPAK_IRS_DIR: &str = "/app/extensions/Presets/irs";

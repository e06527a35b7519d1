// ============================================================================
// Kernel storage and acquisition
// ============================================================================
//
// Kernels live as `.irs` (WAV) or `.sofa` (spatial dataset) files in a
// writable user directory and in read-only packaged directories. Packaged
// directories may be narrowed to a community package sub-directory per
// pipeline direction.

use super::resample::resample_kernel;
use super::spatial::{SpatialSelection, SpatialSource};
use super::{Kernel, wav};
use crate::config::HostConfig;
use crate::error::KernelError;
use crate::graph::PipelineType;
use crate::util::search_filename;
use std::fs;
use std::path::{Path, PathBuf};

pub const IRS_EXT: &str = "irs";
pub const SOFA_EXT: &str = "sofa";

/// Depth of the recursive search inside packaged directories
const SEARCH_DEPTH: usize = 3;

/// Locates, loads and persists kernels
#[derive(Debug, Clone)]
pub struct KernelManager {
    user_dir: PathBuf,
    system_dirs: Vec<PathBuf>,
    community_package: Option<String>,
}

impl KernelManager {
    pub fn new(user_dir: impl Into<PathBuf>, system_dirs: Vec<PathBuf>) -> Self {
        Self {
            user_dir: user_dir.into(),
            system_dirs,
            community_package: None,
        }
    }

    /// Storage locations from the host configuration, falling back to the
    /// environment for unset entries
    pub fn from_config(config: &HostConfig, pipeline: PipelineType) -> Result<Self, KernelError> {
        let user_dir = match &config.irs_dir {
            Some(dir) => dir.clone(),
            None => rtfx_env::get_irs_dir()?,
        };
        let system_dirs = config
            .system_irs_dirs
            .clone()
            .unwrap_or_else(rtfx_env::system_irs_dirs);
        let package = match pipeline {
            PipelineType::Input => config.community_package_input.clone(),
            PipelineType::Output => config.community_package_output.clone(),
        };
        Ok(Self::new(user_dir, system_dirs).with_community_package(package))
    }

    pub fn with_community_package(mut self, package: Option<String>) -> Self {
        self.community_package = package.filter(|p| !p.is_empty());
        self
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    /// Full path of a kernel file, `.irs` preferred over `.sofa`
    pub fn search(&self, name: &str) -> Option<PathBuf> {
        for ext in [IRS_EXT, SOFA_EXT] {
            let filename = format!("{name}.{ext}");
            let local = self.user_dir.join(&filename);
            if local.is_file() {
                return Some(local);
            }
            for dir in &self.system_dirs {
                let root = match &self.community_package {
                    Some(package) => dir.join(package),
                    None => dir.clone(),
                };
                if let Some(path) = search_filename(&root, &filename, SEARCH_DEPTH) {
                    return Some(path);
                }
            }
        }
        None
    }

    /// Load a kernel, reporting failure through the returned error only
    pub fn try_load(&self, name: &str, selection: &SpatialSelection) -> Result<Kernel, KernelError> {
        if name.is_empty() {
            return Err(KernelError::EmptyName);
        }
        let path = self
            .search(name)
            .ok_or_else(|| KernelError::NotFound(name.to_string()))?;

        let mut kernel = if has_extension(&path, SOFA_EXT) {
            SpatialSource::open(&path)?.select(name, selection)?
        } else {
            let data = wav::read_channels(&path)?;
            if data.channels.first().is_none_or(|c| c.is_empty()) {
                return Err(KernelError::Empty);
            }
            Kernel::from_channels(name, data.rate, data.channels)?
        };
        kernel.path = Some(path);
        kernel.validate()?;

        log::debug!(
            "Loaded kernel '{}': {} Hz, {} samples, {:.3}s, {} channels",
            name,
            kernel.rate,
            kernel.len(),
            kernel.duration(),
            kernel.channel_count()
        );
        Ok(kernel)
    }

    /// Load a kernel
    ///
    /// On failure a single warning is logged and an invalid (default)
    /// kernel is returned.
    pub fn load(&self, name: &str) -> Kernel {
        self.load_spatial(name, &SpatialSelection::default())
    }

    /// Load a kernel, selecting the nearest measurement for spatial datasets
    pub fn load_spatial(&self, name: &str, selection: &SpatialSelection) -> Kernel {
        match self.try_load(name, selection) {
            Ok(kernel) => kernel,
            Err(KernelError::EmptyName) => {
                log::warn!("Kernel name is empty");
                Kernel::default()
            }
            Err(KernelError::NotFound(_)) => {
                log::warn!("Kernel '{}' not found", name);
                Kernel::default()
            }
            Err(e) => {
                log::warn!("Kernel '{}' is invalid: {}", name, e);
                Kernel::default()
            }
        }
    }

    /// Write a kernel as 32-bit float WAV into the user directory
    pub fn save(&self, kernel: &Kernel, name: &str) -> Result<PathBuf, KernelError> {
        if name.is_empty() {
            return Err(KernelError::EmptyName);
        }
        kernel.validate()?;
        fs::create_dir_all(&self.user_dir).map_err(|e| KernelError::io(&self.user_dir, e))?;

        let path = self.user_dir.join(format!("{name}.{IRS_EXT}"));
        wav::write_channels(&path, kernel.rate, &kernel.channels())?;
        log::debug!("Saved kernel '{}' to {}", name, path.display());
        Ok(path)
    }

    /// Cascade two stored kernels and save the result as `output`
    ///
    /// Both inputs are resampled to the higher of their rates first.
    pub fn combine(&self, first: &str, second: &str, output: &str) -> Result<Kernel, KernelError> {
        if output.is_empty() {
            return Err(KernelError::EmptyName);
        }
        let selection = SpatialSelection::default();
        let a = self.try_load(first, &selection)?;
        let b = self.try_load(second, &selection)?;

        let rate = a.rate.max(b.rate);
        let a = resample_kernel(&a, rate)?;
        let b = resample_kernel(&b, rate)?;

        let mut combined = super::combine(&a, &b, output)?;
        combined.path = Some(self.save(&combined, output)?);
        log::info!(
            "Combined kernels '{}' and '{}' into '{}' ({} samples at {} Hz)",
            first,
            second,
            output,
            combined.len(),
            rate
        );
        Ok(combined)
    }

    /// Copy an external kernel file into the user directory
    ///
    /// WAV files must hold 1, 2 or 4 non-empty channels and are stored as
    /// `.irs`; spatial datasets keep `.sofa`. Returns the stored name, which
    /// gets a ` (n)` suffix when the name is taken.
    pub fn import(&self, source: &Path) -> Result<String, KernelError> {
        let meta = fs::metadata(source).map_err(|e| KernelError::io(source, e))?;
        if !meta.is_file() {
            return Err(KernelError::Invalid(format!(
                "{} is not a regular file",
                source.display()
            )));
        }

        let spatial = has_extension(source, SOFA_EXT);
        if spatial {
            SpatialSource::open(source)?;
        } else {
            let (channels, frames) = wav::probe(source)?;
            if !matches!(channels, 1 | 2 | 4) {
                return Err(KernelError::UnsupportedChannels(channels));
            }
            if frames == 0 {
                return Err(KernelError::Empty);
            }
        }

        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or(KernelError::EmptyName)?;
        let ext = if spatial { SOFA_EXT } else { IRS_EXT };

        fs::create_dir_all(&self.user_dir).map_err(|e| KernelError::io(&self.user_dir, e))?;
        let name = self.free_name(stem);
        let target = self.user_dir.join(format!("{name}.{ext}"));
        fs::copy(source, &target).map_err(|e| KernelError::io(&target, e))?;
        log::info!("Imported {} as '{}'", source.display(), name);
        Ok(name)
    }

    fn free_name(&self, stem: &str) -> String {
        let taken = |name: &str| {
            [IRS_EXT, SOFA_EXT]
                .iter()
                .any(|ext| self.user_dir.join(format!("{name}.{ext}")).exists())
        };
        if !taken(stem) {
            return stem.to_string();
        }
        (1..)
            .map(|n| format!("{stem} ({n})"))
            .find(|name| !taken(name))
            .unwrap_or_else(|| stem.to_string())
    }

    /// Names of the kernels in the user directory, sorted
    pub fn list(&self) -> Result<Vec<String>, KernelError> {
        let entries = match fs::read_dir(&self.user_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KernelError::io(&self.user_dir, e)),
        };
        let mut names: Vec<String> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && (has_extension(p, IRS_EXT) || has_extension(p, SOFA_EXT)))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Delete a kernel from the user directory
    pub fn remove(&self, name: &str) -> Result<(), KernelError> {
        if name.is_empty() {
            return Err(KernelError::EmptyName);
        }
        let mut removed = false;
        for ext in [IRS_EXT, SOFA_EXT] {
            let path = self.user_dir.join(format!("{name}.{ext}"));
            if path.is_file() {
                fs::remove_file(&path).map_err(|e| KernelError::io(&path, e))?;
                removed = true;
            }
        }
        if removed {
            log::debug!("Removed kernel '{}'", name);
            Ok(())
        } else {
            Err(KernelError::NotFound(name.to_string()))
        }
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, KernelManager) {
        let dir = tempfile::tempdir().unwrap();
        let m = KernelManager::new(dir.path().join("user"), vec![dir.path().join("system")]);
        (dir, m)
    }

    #[test]
    fn test_save_then_load() {
        let (_dir, m) = manager();
        let k = Kernel::stereo("a", 48000, vec![0.5, -0.25, 0.125], vec![1.0, 0.0, -1.0]);
        m.save(&k, "a").unwrap();
        let loaded = m.load("a");
        assert_eq!(loaded.left, k.left);
        assert_eq!(loaded.right, k.right);
        assert_eq!(loaded.rate, 48000);
        assert!(loaded.path.is_some());
    }

    #[test]
    fn test_true_stereo_saved_as_four_channels() {
        let (_dir, m) = manager();
        let k = Kernel::true_stereo("ts", 44100, vec![1.0], vec![0.5], vec![0.25], vec![0.75]);
        let path = m.save(&k, "ts").unwrap();
        assert_eq!(wav::probe(&path).unwrap(), (4, 1));
        assert_eq!(m.load("ts"), Kernel { path: Some(path), ..k });
    }

    #[test]
    fn test_missing_and_empty_names() {
        let (_dir, m) = manager();
        assert!(!m.load("nope").is_valid());
        assert!(matches!(
            m.try_load("nope", &SpatialSelection::default()),
            Err(KernelError::NotFound(_))
        ));
        assert!(matches!(
            m.try_load("", &SpatialSelection::default()),
            Err(KernelError::EmptyName)
        ));
    }

    #[test]
    fn test_search_in_community_package() {
        let (dir, m) = manager();
        let nested = dir.path().join("system").join("pack").join("rooms").join("small");
        fs::create_dir_all(&nested).unwrap();
        wav::write_channels(&nested.join("box.irs"), 48000, &[&[1.0_f32][..], &[1.0_f32][..]])
            .unwrap();

        let m = m.with_community_package(Some("pack".into()));
        assert_eq!(m.search("box"), Some(nested.join("box.irs")));
        let other = m.clone().with_community_package(Some("other".into()));
        assert_eq!(other.search("box"), None);
    }

    #[test]
    fn test_user_dir_wins_over_packages() {
        let (dir, m) = manager();
        let sys = dir.path().join("system");
        fs::create_dir_all(&sys).unwrap();
        wav::write_channels(&sys.join("x.irs"), 48000, &[&[1.0_f32][..]]).unwrap();
        let k = Kernel::stereo("x", 48000, vec![0.5], vec![0.5]);
        let saved = m.save(&k, "x").unwrap();
        assert_eq!(m.search("x"), Some(saved));
    }

    #[test]
    fn test_list_and_remove() {
        let (_dir, m) = manager();
        assert!(m.list().unwrap().is_empty());
        let k = Kernel::stereo("k", 48000, vec![1.0], vec![1.0]);
        m.save(&k, "b").unwrap();
        m.save(&k, "a").unwrap();
        assert_eq!(m.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
        m.remove("a").unwrap();
        assert_eq!(m.list().unwrap(), vec!["b".to_string()]);
        assert!(matches!(m.remove("a"), Err(KernelError::NotFound(_))));
    }
}

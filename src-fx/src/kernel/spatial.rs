// ============================================================================
// Spatial (HRTF) datasets
// ============================================================================
//
// Directionally indexed impulse responses following the AES69
// SimpleFreeFieldHRIR layout: `Data.IR` is M measurements × 2 receivers × N
// samples, `SourcePosition` holds one position per measurement. SOFA files
// (HDF5 containers) are read through libmysofa; the same layout decoded to
// JSON is read directly.

use super::{Kernel, SpatialMetadata};
use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use sofar::reader::{Filter, OpenOptions, Sofar};
use std::io::Read;
use std::path::Path;

const HDF5_MAGIC: &[u8] = b"\x89HDF";

/// Rate libmysofa resamples SOFA measurements to
pub const SOFA_RATE: u32 = 48000;

/// Coordinate system of `SourcePosition`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionType {
    /// azimuth (deg), elevation (deg), radius (m)
    #[default]
    Spherical,
    /// x, y, z (m)
    Cartesian,
}

/// Requested source direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialSelection {
    /// Degrees, counter-clockwise from the front
    pub azimuth: f32,
    /// Degrees, positive above the horizontal plane
    pub elevation: f32,
    /// Metres; 0 or less matches on direction only
    pub radius: f32,
}

/// One HRIR dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialDataset {
    #[serde(rename = "SamplingRate")]
    pub sampling_rate: f64,

    #[serde(rename = "SourcePosition")]
    pub source_position: Vec<[f32; 3]>,

    #[serde(rename = "SourcePositionType", default)]
    pub position_type: PositionType,

    #[serde(rename = "Data.IR")]
    pub ir: Vec<Vec<Vec<f32>>>,

    #[serde(rename = "ListenerDescription", default)]
    pub listener_description: Option<String>,

    #[serde(rename = "Title", default)]
    pub title: Option<String>,
}

/// Nearest-neighbour index over the measurement positions
pub struct SpatialLookup {
    points: Vec<[f32; 3]>,
    directions: Vec<[f32; 3]>,
}

fn spherical_to_cartesian(azimuth: f32, elevation: f32, radius: f32) -> [f32; 3] {
    let (az, el) = (azimuth.to_radians(), elevation.to_radians());
    [
        radius * el.cos() * az.cos(),
        radius * el.cos() * az.sin(),
        radius * el.sin(),
    ]
}

fn cartesian_to_spherical(p: [f32; 3]) -> [f32; 3] {
    let radius = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
    if radius == 0.0 {
        return [0.0, 0.0, 0.0];
    }
    let azimuth = p[1].atan2(p[0]).to_degrees().rem_euclid(360.0);
    let elevation = (p[2] / radius).clamp(-1.0, 1.0).asin().to_degrees();
    [azimuth, elevation, radius]
}

fn distance_sq(a: [f32; 3], b: [f32; 3]) -> f32 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)
}

fn unit(p: [f32; 3]) -> [f32; 3] {
    let norm = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
    if norm == 0.0 {
        p
    } else {
        [p[0] / norm, p[1] / norm, p[2] / norm]
    }
}

impl SpatialLookup {
    /// Index every measurement position once
    pub fn new(dataset: &SpatialDataset) -> Self {
        let points: Vec<[f32; 3]> = dataset
            .source_position
            .iter()
            .map(|&p| match dataset.position_type {
                PositionType::Spherical => spherical_to_cartesian(p[0], p[1], p[2]),
                PositionType::Cartesian => p,
            })
            .collect();
        let directions = points.iter().map(|&p| unit(p)).collect();
        Self { points, directions }
    }

    /// Index of the measurement closest to `selection`
    pub fn nearest(&self, selection: &SpatialSelection) -> Option<usize> {
        let (candidates, target) = if selection.radius > 0.0 {
            (
                &self.points,
                spherical_to_cartesian(selection.azimuth, selection.elevation, selection.radius),
            )
        } else {
            (
                &self.directions,
                spherical_to_cartesian(selection.azimuth, selection.elevation, 1.0),
            )
        };
        candidates
            .iter()
            .enumerate()
            .min_by(|a, b| distance_sq(*a.1, target).total_cmp(&distance_sq(*b.1, target)))
            .map(|(i, _)| i)
    }
}

impl SpatialDataset {
    /// Read and validate a dataset
    pub fn load(path: &Path) -> Result<Self, KernelError> {
        let bytes = std::fs::read(path).map_err(|e| KernelError::io(path, e))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KernelError> {
        if bytes.starts_with(HDF5_MAGIC) {
            return Err(KernelError::Spatial(
                "HDF5 container; open SOFA files with SpatialSource::open".to_string(),
            ));
        }
        let dataset: SpatialDataset = serde_json::from_slice(bytes)
            .map_err(|e| KernelError::Spatial(format!("malformed dataset: {e}")))?;
        dataset.validate()?;
        Ok(dataset)
    }

    fn validate(&self) -> Result<(), KernelError> {
        if !(self.sampling_rate > 0.0) {
            return Err(KernelError::Spatial("sampling rate must be positive".into()));
        }
        if self.ir.is_empty() {
            return Err(KernelError::Spatial("no measurements".into()));
        }
        if self.ir.len() != self.source_position.len() {
            return Err(KernelError::Spatial(format!(
                "{} measurements but {} source positions",
                self.ir.len(),
                self.source_position.len()
            )));
        }
        let n = self.ir[0].first().map(Vec::len).unwrap_or(0);
        if n == 0 {
            return Err(KernelError::Spatial("empty impulse responses".into()));
        }
        for (m, receivers) in self.ir.iter().enumerate() {
            if receivers.len() != 2 {
                return Err(KernelError::Spatial(format!(
                    "measurement {m} has {} receivers, expected 2",
                    receivers.len()
                )));
            }
            if receivers.iter().any(|r| r.len() != n) {
                return Err(KernelError::Spatial(format!(
                    "measurement {m} has unequal impulse lengths"
                )));
            }
        }
        Ok(())
    }

    pub fn measurements(&self) -> usize {
        self.ir.len()
    }

    /// Position of a measurement as azimuth/elevation/radius
    pub fn position(&self, index: usize) -> Option<[f32; 3]> {
        let p = *self.source_position.get(index)?;
        Some(match self.position_type {
            PositionType::Spherical => p,
            PositionType::Cartesian => cartesian_to_spherical(p),
        })
    }

    /// Kernel of one measurement (receiver 0 = left ear, 1 = right ear)
    pub fn kernel(&self, name: &str, index: usize) -> Option<Kernel> {
        let receivers = self.ir.get(index)?;
        let [azimuth, elevation, radius] = self.position(index)?;
        let rate = self.sampling_rate.round() as u32;
        let mut kernel = Kernel::stereo(name, rate, receivers[0].clone(), receivers[1].clone());
        kernel.spatial = Some(SpatialMetadata {
            azimuth,
            elevation,
            radius,
            measurement_index: Some(index),
        });
        Some(kernel)
    }

    /// Kernel of the measurement nearest to `selection`
    pub fn select(&self, name: &str, selection: &SpatialSelection) -> Result<Kernel, KernelError> {
        let lookup = SpatialLookup::new(self);
        let index = lookup
            .nearest(selection)
            .ok_or_else(|| KernelError::Spatial("no measurements".into()))?;
        let kernel = self
            .kernel(name, index)
            .ok_or_else(|| KernelError::Spatial(format!("measurement {index} missing")))?;
        log::debug!(
            "spatial kernel '{}': measurement {} for az {} el {} r {}",
            name,
            index,
            selection.azimuth,
            selection.elevation,
            selection.radius
        );
        Ok(kernel)
    }
}

// ============================================================================
// SOFA files
// ============================================================================

/// A SOFA file opened through libmysofa
pub struct SofaFile {
    sofa: Sofar,
    filter_len: usize,
}

impl SofaFile {
    /// Open and validate a SOFA file, resampled to [`SOFA_RATE`]
    pub fn open(path: &Path) -> Result<Self, KernelError> {
        let sofa = OpenOptions::new()
            .sample_rate(SOFA_RATE as f32)
            .open(path)
            .map_err(|e| KernelError::Spatial(format!("{}: {e}", path.display())))?;
        let filter_len = sofa.filter_len();
        if filter_len == 0 {
            return Err(KernelError::Spatial("empty impulse responses".into()));
        }
        Ok(Self { sofa, filter_len })
    }

    /// Kernel of the measurement nearest to `selection`
    ///
    /// libmysofa returns the onset delays separately; they are put back as
    /// leading zeros so the interaural time difference survives.
    pub fn select(&self, name: &str, selection: &SpatialSelection) -> Kernel {
        let radius = if selection.radius > 0.0 {
            selection.radius
        } else {
            1.0
        };
        let [x, y, z] = spherical_to_cartesian(selection.azimuth, selection.elevation, radius);
        let mut filter = Filter::new(self.filter_len);
        self.sofa.filter_nointerp(x, y, z, &mut filter);

        let delayed = |ir: &[f32], delay: f32| {
            let pad = (delay.max(0.0) * SOFA_RATE as f32).round() as usize;
            let mut out = vec![0.0; pad + ir.len()];
            out[pad..].copy_from_slice(ir);
            out
        };
        let mut left = delayed(&filter.left, filter.ldelay);
        let mut right = delayed(&filter.right, filter.rdelay);
        let len = left.len().max(right.len());
        left.resize(len, 0.0);
        right.resize(len, 0.0);

        log::debug!(
            "spatial kernel '{}': SOFA lookup for az {} el {} r {}",
            name,
            selection.azimuth,
            selection.elevation,
            selection.radius
        );
        let mut kernel = Kernel::stereo(name, SOFA_RATE, left, right);
        kernel.spatial = Some(SpatialMetadata {
            azimuth: selection.azimuth,
            elevation: selection.elevation,
            radius: selection.radius,
            measurement_index: None,
        });
        kernel
    }
}

/// A spatial dataset in either on-disk form
pub enum SpatialSource {
    Sofa(SofaFile),
    Decoded(SpatialDataset),
}

impl SpatialSource {
    /// Open a dataset, telling SOFA from JSON by the HDF5 signature
    pub fn open(path: &Path) -> Result<Self, KernelError> {
        let mut head = [0u8; 4];
        let read = std::fs::File::open(path)
            .and_then(|mut f| f.read(&mut head))
            .map_err(|e| KernelError::io(path, e))?;
        if &head[..read] == HDF5_MAGIC {
            SofaFile::open(path).map(Self::Sofa)
        } else {
            SpatialDataset::load(path).map(Self::Decoded)
        }
    }

    pub fn select(&self, name: &str, selection: &SpatialSelection) -> Result<Kernel, KernelError> {
        match self {
            Self::Sofa(sofa) => Ok(sofa.select(name, selection)),
            Self::Decoded(dataset) => dataset.select(name, selection),
        }
    }
}

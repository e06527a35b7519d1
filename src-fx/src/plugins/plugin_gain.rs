// ============================================================================
// Gain Plugin - Simple volume stage
// ============================================================================

use super::plugin::{
    AudioBuffers, CommonSettings, Effect, EffectSettings, PluginInfo, Reaction, StreamFormat,
};
use crate::error::{EngineError, PluginError};
use crate::util::{apply_gain, db_to_linear, linear_to_db};
use serde::{Deserialize, Serialize};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration parameters for the gain plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GainSettings {
    #[serde(flatten)]
    pub common: CommonSettings,
    /// Gain in dB (0.0 = unity, negative = attenuation, positive = boost)
    pub gain_db: f32,
}

impl EffectSettings for GainSettings {
    fn common(&self) -> &CommonSettings {
        &self.common
    }
}

// ============================================================================
// Plugin Implementation
// ============================================================================

/// Multiplies both channels by a gain factor
///
/// Has no deferred state: the first worker pass after `setup` marks it ready.
pub struct Gain {
    /// Current gain in dB
    gain_db: f32,
    /// Linear gain multiplier (cached from gain_db)
    gain_linear: f32,
}

impl Default for Gain {
    fn default() -> Self {
        Self::new()
    }
}

impl Gain {
    pub fn new() -> Self {
        Self {
            gain_db: 0.0,
            gain_linear: 1.0,
        }
    }

    /// Set gain in dB
    pub fn set_gain_db(&mut self, gain_db: f32) {
        self.gain_db = gain_db;
        self.gain_linear = db_to_linear(gain_db);
    }

    /// Set gain as linear multiplier
    pub fn set_gain_linear(&mut self, gain: f32) {
        self.gain_linear = gain;
        self.gain_db = linear_to_db(gain);
    }

    pub fn gain_db(&self) -> f32 {
        self.gain_db
    }

    pub fn gain_linear(&self) -> f32 {
        self.gain_linear
    }
}

impl Effect for Gain {
    type Settings = GainSettings;
    type Job = ();
    type Resources = ();

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "Gain".to_string(),
            version: "1.0.0".to_string(),
            author: "rtfx".to_string(),
            description: "Simple gain/volume control plugin".to_string(),
        }
    }

    fn prepare(&mut self, _format: StreamFormat) -> Option<()> {
        None
    }

    fn build(_job: ()) -> Result<(), PluginError> {
        Ok(())
    }

    fn install(&mut self, _resources: ()) -> Option<()> {
        None
    }

    fn apply_settings(&mut self, settings: &GainSettings, _key: &str) -> Reaction {
        self.set_gain_db(settings.gain_db);
        Reaction::None
    }

    fn process(&mut self, buffers: AudioBuffers<'_>) -> Result<(), EngineError> {
        if buffers.left.len() != buffers.right.len() {
            return Err(EngineError::SizeMismatch {
                expected: buffers.left.len(),
                got: buffers.right.len(),
            });
        }
        apply_gain(buffers.left, self.gain_linear);
        apply_gain(buffers.right, self.gain_linear);
        Ok(())
    }

    fn release(&mut self) -> Option<()> {
        None
    }
}

use std::path::Path;

use serde::{Deserialize, Serialize};
use transcode_bus::{BusConfig, EncodingProfile, TranscodeError};

/// Contents of the `--config` file. Missing sections fall back to defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub bus: BusConfig,
    pub profile: EncodingProfile,
}

impl TranscoderConfig {
    pub fn from_json(json: &str) -> Result<Self, TranscodeError> {
        let config: TranscoderConfig = serde_json::from_str(json)
            .map_err(|e| TranscodeError::config(format!("invalid config: {}", e)))?;
        config.profile.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, TranscodeError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            TranscodeError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }
}

//! Persisted voice service profile.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Device credentials and service switches, persisted as a JSON document.
///
/// The profile is applied into the engine configuration before `prepare`;
/// an incomplete profile keeps the speech side released.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceProfile {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_type_id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub secret: String,
    /// When set the server decides utterance end and local VAD_END is
    /// suppressed.
    #[serde(default)]
    pub cloud_vad_enable: bool,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to access profile: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed profile: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl VoiceProfile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let profile = serde_json::from_str(&raw)?;
        debug!(path = %path.as_ref().display(), "voice profile loaded");
        Ok(profile)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ProfileError> {
        fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        debug!(path = %path.as_ref().display(), "voice profile saved");
        Ok(())
    }

    /// True when every credential field is present.
    pub fn is_complete(&self) -> bool {
        !self.device_id.is_empty()
            && !self.device_type_id.is_empty()
            && !self.key.is_empty()
            && !self.secret.is_empty()
    }

    /// Feed the credential entries into an engine configuration sink.
    pub fn apply(&self, mut sink: impl FnMut(&str, &str)) {
        sink("device_id", &self.device_id);
        sink("device_type_id", &self.device_type_id);
        sink("key", &self.key);
        sink("secret", &self.secret);
    }
}

// Publishing pipeline description rendered from a job payload

use crate::errors::ExecutionError;
use serde::Deserialize;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresetKind {
    #[default]
    Copy,
    Encode,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AudioReplaceMode {
    #[default]
    None,
    ExternalLoop,
    VideoOnly,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PresetSpec {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: PresetKind,
    pub video_bitrate: Option<String>,
    pub audio_bitrate: Option<String>,
    pub force_encode: bool,
    pub audio_replace: AudioReplaceMode,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AssetSpec {
    pub audio_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationSpec {
    pub endpoint: String,
}

/// Execution parameters carried in `Job::payload`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelinePayload {
    pub preset: Option<PresetSpec>,
    pub asset: Option<AssetSpec>,
    pub destination: Option<DestinationSpec>,
}

impl PipelinePayload {
    /// A payload that is not a JSON object cannot be retried into shape
    pub fn from_value(payload: &serde_json::Value) -> Result<Self, ExecutionError> {
        if payload.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(payload.clone())
            .map_err(|e| ExecutionError::Permanent(format!("Invalid job payload: {}", e)))
    }

    pub fn summary(&self) -> PipelineSummary<'_> {
        PipelineSummary(self)
    }
}

/// `ffmpeg <flags> // preset=<preset> // <audio> -> <destination>`
pub struct PipelineSummary<'a>(&'a PipelinePayload);

impl fmt::Display for PipelineSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = self.0;
        let mut flags = vec!["-re"];

        let preset_part = match &payload.preset {
            Some(preset) if preset.kind == PresetKind::Encode => format!(
                "encode-v{}-a{}",
                preset.video_bitrate.as_deref().unwrap_or("auto"),
                preset.audio_bitrate.as_deref().unwrap_or("auto")
            ),
            Some(preset) => preset.name.clone().unwrap_or_else(|| "copy".to_string()),
            None => "copy".to_string(),
        };

        if let Some(preset) = &payload.preset {
            if preset.kind == PresetKind::Copy && !preset.force_encode {
                flags.push("-c copy");
            }
            match preset.audio_replace {
                AudioReplaceMode::ExternalLoop => flags.push("-stream_loop -1 -i external_audio.mp3"),
                AudioReplaceMode::VideoOnly => flags.push("-an"),
                AudioReplaceMode::None => {}
            }
        }

        let audio_part = match &payload.asset {
            Some(asset) if !asset.audio_only => "audio",
            _ => "video-only",
        };
        let destination = payload
            .destination
            .as_ref()
            .map(|d| d.endpoint.as_str())
            .unwrap_or("unknown-dest");

        write!(
            f,
            "ffmpeg {} // preset={} // {} -> {}",
            flags.join(" "),
            preset_part,
            audio_part,
            destination
        )
    }
}

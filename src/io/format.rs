//! Checkpoint serialization formats

use serde::{Deserialize, Serialize};

/// Supported checkpoint serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointFormat {
    /// JSON format (human-readable, larger file size)
    Json,

    /// YAML format (human-readable)
    Yaml,

    /// SafeTensors format (efficient binary)
    #[default]
    SafeTensors,
}

impl CheckpointFormat {
    /// File extension for this format
    pub fn extension(&self) -> &str {
        match self {
            CheckpointFormat::Json => "json",
            CheckpointFormat::Yaml => "yaml",
            CheckpointFormat::SafeTensors => "safetensors",
        }
    }

    /// Detect format from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(CheckpointFormat::Json),
            "yaml" | "yml" => Some(CheckpointFormat::Yaml),
            "safetensors" => Some(CheckpointFormat::SafeTensors),
            _ => None,
        }
    }

    pub const ALL: [CheckpointFormat; 3] = [
        CheckpointFormat::SafeTensors,
        CheckpointFormat::Json,
        CheckpointFormat::Yaml,
    ];
}

/// Options for writing checkpoints
#[derive(Debug, Clone)]
pub struct SaveConfig {
    pub format: CheckpointFormat,

    /// Pretty-print text formats
    pub pretty: bool,
}

impl SaveConfig {
    pub fn new(format: CheckpointFormat) -> Self {
        Self {
            format,
            pretty: true,
        }
    }

    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self::new(CheckpointFormat::SafeTensors)
    }
}

//! Codec configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compression::{CompressionLevel, LEVEL_RANGE};
use crate::error::{Error, Result};
use crate::format::RangePolicy;
use crate::quantize::{FixedPointQuantizer, OverflowPolicy, DEFAULT_PARALLEL_THRESHOLD};

/// Codec configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Statistic used to size each layer's integer bits
    #[serde(default)]
    pub range_policy: RangePolicy,

    /// Handling of values outside the int8 range
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Zstd level for archive entries
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,

    /// Element count above which tensors are processed on the rayon pool
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            range_policy: RangePolicy::default(),
            overflow: OverflowPolicy::default(),
            zstd_level: default_zstd_level(),
            parallel_threshold: default_parallel_threshold(),
        }
    }
}

fn default_zstd_level() -> i32 {
    CompressionLevel::Default.into()
}

fn default_parallel_threshold() -> usize {
    DEFAULT_PARALLEL_THRESHOLD
}

impl CodecConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: CodecConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !LEVEL_RANGE.contains(&self.zstd_level) {
            return Err(Error::Serialization(format!(
                "zstd_level {} outside {:?}",
                self.zstd_level, LEVEL_RANGE
            )));
        }
        Ok(())
    }

    /// Quantizer configured with this overflow policy and parallel threshold.
    pub fn quantizer(&self) -> FixedPointQuantizer {
        FixedPointQuantizer::new(self.overflow).with_parallel_threshold(self.parallel_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reproduce_reference_behaviour() {
        let config = CodecConfig::default();
        assert_eq!(config.range_policy, RangePolicy::MaxElement);
        assert_eq!(config.overflow, OverflowPolicy::Saturate);
        assert_eq!(config.zstd_level, 3);
        assert_eq!(config.parallel_threshold, 10000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: CodecConfig =
            serde_json::from_str(r#"{"range_policy": "max_abs", "overflow": "wrap"}"#).unwrap();
        assert_eq!(config.range_policy, RangePolicy::MaxAbs);
        assert_eq!(config.overflow, OverflowPolicy::Wrap);
        assert_eq!(config.zstd_level, 3);
    }

    #[test]
    fn from_file_validates_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codec.json");

        fs::write(&path, r#"{"zstd_level": 19}"#).unwrap();
        assert_eq!(CodecConfig::from_json_file(&path).unwrap().zstd_level, 19);

        fs::write(&path, r#"{"zstd_level": 40}"#).unwrap();
        assert!(CodecConfig::from_json_file(&path).is_err());

        fs::write(&path, r#"{"overflow": "explode"}"#).unwrap();
        assert!(CodecConfig::from_json_file(&path).is_err());
    }
}

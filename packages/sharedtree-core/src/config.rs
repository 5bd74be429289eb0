use serde::{Deserialize, Serialize};

use crate::change::family::DEFAULT_MAX_CROSS_FIELD_PASSES;
use crate::codec::{TreeCompressionStrategy, FIELD_BATCH_FORMAT_VERSION};
use crate::error::{Error, Result};
use crate::schema::SchemaFormatVersion;

/// Whether content is checked against the stored schema before it is applied.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SchemaValidationMode {
    #[default]
    Enforce,
    Skip,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CoreConfig {
    pub schema_validation: SchemaValidationMode,
    pub tree_encoding: TreeCompressionStrategy,
    pub field_batch_format: u32,
    pub schema_format: SchemaFormatVersion,
    pub max_cross_field_passes: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            schema_validation: SchemaValidationMode::Enforce,
            tree_encoding: TreeCompressionStrategy::Compressed,
            field_batch_format: FIELD_BATCH_FORMAT_VERSION,
            schema_format: SchemaFormatVersion::V2,
            max_cross_field_passes: DEFAULT_MAX_CROSS_FIELD_PASSES,
        }
    }
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.field_batch_format != FIELD_BATCH_FORMAT_VERSION {
            return Err(Error::UnsupportedVersion {
                format: "field batch",
                version: config.field_batch_format,
            });
        }
        Ok(config)
    }

    pub fn validates_schema(&self) -> bool {
        self.schema_validation == SchemaValidationMode::Enforce
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = CoreConfig::from_json_str(r#"{"schemaValidation": "skip"}"#).unwrap();
        assert_eq!(config.schema_validation, SchemaValidationMode::Skip);
        assert_eq!(config.tree_encoding, TreeCompressionStrategy::Compressed);
        assert_eq!(config.schema_format, SchemaFormatVersion::V2);
        assert!(!config.validates_schema());
    }

    #[test]
    fn rejects_unknown_fields_and_versions() {
        assert!(matches!(
            CoreConfig::from_json_str(r#"{"verbose": true}"#),
            Err(Error::Json(_))
        ));
        assert!(matches!(
            CoreConfig::from_json_str(r#"{"fieldBatchFormat": 3}"#),
            Err(Error::UnsupportedVersion { version: 3, .. })
        ));
        assert!(matches!(
            CoreConfig::from_json_str(r#"{"schemaFormat": 7}"#),
            Err(Error::Json(_))
        ));
    }
}

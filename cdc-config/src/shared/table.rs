use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// A source table captured and replicated into a target table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TableConfig {
    /// Name of the captured table in the source database.
    pub source: String,
    /// Name of the table written in the target store. Defaults to the source name.
    #[serde(default)]
    pub target: Option<String>,
    /// Columns recorded in change images. Empty means every column.
    #[serde(default)]
    pub columns: Vec<String>,
}

impl TableConfig {
    /// Returns the target table name.
    pub fn target_table(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.source)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source.trim().is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "tables.source".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }

        if self.target_table().trim().is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "tables.target".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

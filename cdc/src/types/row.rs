use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bail;
use crate::error::{CdcResult, ErrorKind};

/// Column values of a row, keyed by column name.
pub type RowImage = BTreeMap<String, Value>;

/// Builds a [`RowImage`] from `(column, value)` pairs.
pub fn row_image<I, K, V>(columns: I) -> RowImage
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    columns
        .into_iter()
        .map(|(column, value)| (column.into(), value.into()))
        .collect()
}

/// Canonical, comparable encoding of a row's key column values.
///
/// Two images produce the same key exactly when their key columns hold equal values, which is
/// what target writes and in-memory tables are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey(String);

impl RowKey {
    /// Extracts the key of `image` for the given key columns.
    ///
    /// Fails when a key column is missing or null, since such a row cannot be addressed.
    pub fn from_image(image: &RowImage, key_columns: &[String]) -> CdcResult<RowKey> {
        let mut values = Vec::with_capacity(key_columns.len());
        for column in key_columns {
            match image.get(column) {
                Some(Value::Null) | None => bail!(
                    ErrorKind::InvalidData,
                    "Row image is missing a key column",
                    format!("Key column '{column}' is absent or null")
                ),
                Some(value) => values.push(value),
            }
        }

        Ok(RowKey(serde_json::to_string(&values)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn keys(columns: &[&str]) -> Vec<String> {
        columns.iter().map(|column| column.to_string()).collect()
    }

    #[test]
    fn key_ignores_non_key_columns() {
        let a = row_image([("id", json!(1)), ("name", json!("A"))]);
        let b = row_image([("id", json!(1)), ("name", json!("B"))]);

        assert_eq!(
            RowKey::from_image(&a, &keys(&["id"])).unwrap(),
            RowKey::from_image(&b, &keys(&["id"])).unwrap()
        );
    }

    #[test]
    fn key_follows_key_column_order() {
        let image = row_image([("tenant", json!("t1")), ("id", json!(7))]);

        let key = RowKey::from_image(&image, &keys(&["tenant", "id"])).unwrap();

        assert_eq!(key.as_str(), r#"["t1",7]"#);
    }

    #[test]
    fn null_key_column_is_rejected() {
        let image = row_image([("id", Value::Null)]);

        let err = RowKey::from_image(&image, &keys(&["id"])).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Normalized activity row as written to the destination table
///
/// `activity_id` is the only column the loader interprets; the rest are
/// written as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRow {
    pub activity_id: i64,
    #[serde(flatten)]
    pub columns: BTreeMap<String, Value>,
}

impl ActivityRow {
    pub fn new(activity_id: i64) -> Self {
        Self {
            activity_id,
            columns: BTreeMap::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a column, ignoring attempts to overwrite the identifier
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        if name == "activity_id" {
            return;
        }
        self.columns.insert(name, value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.get(name)
    }
}

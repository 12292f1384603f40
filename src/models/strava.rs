use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default page size for activity listing
pub const DEFAULT_PER_PAGE: u32 = 100;

/// Largest page size the activities endpoint accepts
pub const MAX_PER_PAGE: u32 = 200;

// ==================================================================================================
// Activities
// ==================================================================================================

/// Raw activity as returned by `GET /athlete/activities`
///
/// Only the identifier is typed; every other field is kept verbatim for the
/// transform stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: i64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ActivityRecord {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Field lookup that treats the typed `id` like any other column
    pub fn get(&self, key: &str) -> Option<Value> {
        if key == "id" {
            return Some(Value::from(self.id));
        }
        self.fields.get(key).cloned()
    }
}

// ==================================================================================================
// Pagination
// ==================================================================================================

/// One page of the activities listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number
    pub page: u32,
    pub per_page: u32,
    /// Only activities starting after this epoch second
    pub after: Option<i64>,
    /// Only activities starting before this epoch second
    pub before: Option<i64>,
}

impl PageRequest {
    pub fn new(page: u32, per_page: u32, after: Option<i64>, before: Option<i64>) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, MAX_PER_PAGE),
            after,
            before,
        }
    }

    /// Query string parameters for the request
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("page", self.page.to_string()),
            ("per_page", self.per_page.to_string()),
        ];
        if let Some(after) = self.after {
            params.push(("after", after.to_string()));
        }
        if let Some(before) = self.before {
            params.push(("before", before.to_string()));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_record_from_api_json() {
        let json = r#"{"id": 987654321, "name": "Morning Run", "distance": 5012.3}"#;
        let record: ActivityRecord = serde_json::from_str(json).unwrap();

        assert_eq!(record.id, 987_654_321);
        assert_eq!(record.get("name"), Some(Value::from("Morning Run")));
        assert_eq!(record.get("id"), Some(Value::from(987_654_321i64)));
        assert!(!record.fields.contains_key("id"));
    }

    #[test]
    fn test_activity_record_requires_id() {
        let json = r#"{"name": "No id"}"#;
        assert!(serde_json::from_str::<ActivityRecord>(json).is_err());
    }

    #[test]
    fn test_page_request_bounds() {
        let req = PageRequest::new(0, 500, None, None);
        assert_eq!(req.page, 1);
        assert_eq!(req.per_page, MAX_PER_PAGE);

        let req = PageRequest::new(3, 0, None, None);
        assert_eq!(req.per_page, 1);
    }

    #[test]
    fn test_page_request_query_pairs() {
        let req = PageRequest::new(2, 100, Some(1_700_000_000), None);
        assert_eq!(
            req.query_pairs(),
            vec![
                ("page", "2".to_string()),
                ("per_page", "100".to_string()),
                ("after", "1700000000".to_string()),
            ]
        );
    }
}

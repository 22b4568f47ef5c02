//! Projections and sort specifications
//!
//! When a sort spec accompanies a projection, the projected document is
//! wrapped as `{"sortKey": ..., "doc": ...}` so the sort operator can order
//! buffered results without re-reading the store.

use std::cmp::Ordering;

use serde_json::Value;

use crate::document::path_get;
use crate::encoding::compare_values;

/// Which fields of a document survive projection
#[derive(Debug, Clone, Default)]
pub struct Projection {
    /// `None` projects the full document
    fields: Option<Vec<String>>,
}

impl Projection {
    /// The identity projection
    pub fn identity() -> Self {
        Projection { fields: None }
    }

    /// Keep only the listed field paths (plus `_id` when present)
    pub fn fields(fields: Vec<String>) -> Self {
        Projection {
            fields: Some(fields),
        }
    }

    /// Apply to a document value
    pub fn apply(&self, doc: &Value) -> Value {
        match &self.fields {
            None => doc.clone(),
            Some(fields) => {
                let mut out = Value::Object(serde_json::Map::new());
                if let Some(id) = path_get(doc, "_id") {
                    crate::document::path_set(&mut out, "_id", id.clone());
                }
                for field in fields {
                    if let Some(v) = path_get(doc, field) {
                        crate::document::path_set(&mut out, field, v.clone());
                    }
                }
                out
            }
        }
    }

    pub fn describe(&self) -> String {
        match &self.fields {
            None => "project(*)".to_string(),
            Some(fields) => format!("project({})", fields.join(", ")),
        }
    }
}

/// Sort direction for one field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Ordered list of sort fields
#[derive(Debug, Clone)]
pub struct SortSpec {
    fields: Vec<(String, SortOrder)>,
}

impl SortSpec {
    pub fn new(fields: Vec<(String, SortOrder)>) -> Self {
        SortSpec { fields }
    }

    pub fn fields(&self) -> &[(String, SortOrder)] {
        &self.fields
    }

    /// Compare two sort-key objects (field name to value)
    pub fn compare_keys(&self, a: &Value, b: &Value) -> Ordering {
        for (field, order) in &self.fields {
            let av = a.get(field).unwrap_or(&Value::Null);
            let bv = b.get(field).unwrap_or(&Value::Null);
            let cmp = match order {
                SortOrder::Ascending => compare_values(av, bv),
                SortOrder::Descending => compare_values(bv, av),
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    }

    /// Compare two `{"sortKey": ..., "doc": ...}` wrappers
    pub fn compare_wrapped(&self, a: &Value, b: &Value) -> Ordering {
        let null = Value::Null;
        let a_key = a.get("sortKey").unwrap_or(&null);
        let b_key = b.get("sortKey").unwrap_or(&null);
        self.compare_keys(a_key, b_key)
    }

    /// Extract the sort-key object from a document
    pub fn sort_key_of(&self, doc: &Value) -> Value {
        let mut key = serde_json::Map::new();
        for (field, _) in &self.fields {
            let v = path_get(doc, field).cloned().unwrap_or(Value::Null);
            key.insert(field.clone(), v);
        }
        Value::Object(key)
    }

    pub fn describe(&self) -> String {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|(f, o)| match o {
                SortOrder::Ascending => f.clone(),
                SortOrder::Descending => format!("-{f}"),
            })
            .collect();
        format!("sort({})", parts.join(", "))
    }
}

/// Project a document, wrapping it with its sort key when a spec is given
pub fn project_document(doc: &Value, projection: &Projection, ordering: Option<&SortSpec>) -> Value {
    let projected = projection.apply(doc);
    match ordering {
        None => projected,
        Some(spec) => {
            let mut out = serde_json::Map::new();
            out.insert("sortKey".to_string(), spec.sort_key_of(doc));
            out.insert("doc".to_string(), projected);
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_projection_keeps_id_and_fields() {
        let doc = json!({"_id": "x", "a": {"b": 1}, "c": 2, "d": 3});
        let projected = Projection::fields(vec!["a.b".into(), "c".into()]).apply(&doc);
        assert_eq!(projected, json!({"_id": "x", "a": {"b": 1}, "c": 2}));
    }

    #[test]
    fn test_identity_projection() {
        let doc = json!({"a": 1});
        assert_eq!(Projection::identity().apply(&doc), doc);
    }

    #[test]
    fn test_sort_key_wrapping_and_compare() {
        let spec = SortSpec::new(vec![("a".into(), SortOrder::Descending)]);
        let d1 = project_document(&json!({"_id": 1, "a": 1}), &Projection::identity(), Some(&spec));
        let d2 = project_document(&json!({"_id": 2, "a": 2}), &Projection::identity(), Some(&spec));
        assert_eq!(d1["doc"], json!({"_id": 1, "a": 1}));
        assert_eq!(d1["sortKey"], json!({"a": 1}));
        assert_eq!(spec.compare_wrapped(&d2, &d1), Ordering::Less);
    }

    #[test]
    fn test_missing_sort_field_sorts_as_null() {
        let spec = SortSpec::new(vec![("a".into(), SortOrder::Ascending)]);
        let with = spec.sort_key_of(&json!({"a": 0}));
        let without = spec.sort_key_of(&json!({"b": 1}));
        assert_eq!(spec.compare_keys(&without, &with), Ordering::Less);
    }
}

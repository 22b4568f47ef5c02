//! Index descriptors and entry computation

use serde_json::{json, Value};
use uuid::Uuid;

use crate::encoding::encode_key_part;
use crate::query::PathExpression;

use super::Namespace;

/// Direction of one indexed field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexDirection {
    Ascending,
    Descending,
}

impl IndexDirection {
    fn from_number(n: i64) -> Self {
        if n < 0 {
            IndexDirection::Descending
        } else {
            IndexDirection::Ascending
        }
    }

    fn as_number(self) -> i64 {
        match self {
            IndexDirection::Ascending => 1,
            IndexDirection::Descending => -1,
        }
    }
}

/// Lifecycle state of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Ready,
    Building,
}

impl IndexStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexStatus::Ready => "ready",
            IndexStatus::Building => "building",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(IndexStatus::Ready),
            "building" => Some(IndexStatus::Building),
            _ => None,
        }
    }
}

/// A secondary index over one or more field paths
///
/// Each index entry is the concatenation of the encoded indexed values
/// followed by the owning document's primary key part. Entries are encoded
/// ascending; direction only affects sort selection.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub keys: Vec<(String, IndexDirection)>,
    pub status: IndexStatus,
    pub build_id: Option<Uuid>,
}

impl IndexInfo {
    pub fn new(name: impl Into<String>, keys: Vec<(String, IndexDirection)>) -> Self {
        IndexInfo {
            name: name.into(),
            keys,
            status: IndexStatus::Ready,
            build_id: None,
        }
    }

    /// Number of indexed fields
    pub fn size(&self) -> usize {
        self.keys.len()
    }

    pub fn is_compound(&self) -> bool {
        self.size() > 1
    }

    /// The `key` field of the catalog document, used for equality checks
    pub fn key_spec(&self) -> Value {
        Value::Array(
            self.keys
                .iter()
                .map(|(field, dir)| json!([field, dir.as_number()]))
                .collect(),
        )
    }

    /// Render as a catalog document for `ns`
    pub fn to_document(&self, ns: &Namespace) -> Value {
        let mut doc = json!({
            "_id": self.name,
            "name": self.name,
            "ns": ns.to_string(),
            "key": self.key_spec(),
            "status": self.status.as_str(),
        });
        if let Some(build_id) = self.build_id {
            doc["build id"] = json!(build_id.to_string());
        }
        doc
    }

    /// Parse a catalog document
    pub fn from_document(doc: &Value) -> Option<IndexInfo> {
        let name = doc.get("name")?.as_str()?.to_string();
        let mut keys = Vec::new();
        for entry in doc.get("key")?.as_array()? {
            let pair = entry.as_array()?;
            let field = pair.first()?.as_str()?.to_string();
            let dir = IndexDirection::from_number(pair.get(1)?.as_i64()?);
            keys.push((field, dir));
        }
        let status = IndexStatus::parse(doc.get("status")?.as_str()?)?;
        let build_id = doc
            .get("build id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        Some(IndexInfo {
            name,
            keys,
            status,
            build_id,
        })
    }

    /// All value-part combinations this document produces in the index,
    /// without the trailing primary key. A missing field indexes as null;
    /// array fields fan out into one combination per element.
    pub fn entry_value_parts(&self, doc: &Value) -> Vec<Vec<u8>> {
        let mut combos: Vec<Vec<u8>> = vec![Vec::new()];
        for (field, _) in &self.keys {
            let mut values = PathExpression::new(field.clone()).values(doc);
            if values.is_empty() {
                values.push(Value::Null);
            }
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in &values {
                    let mut extended = combo.clone();
                    extended.extend_from_slice(&encode_key_part(value));
                    next.push(extended);
                }
            }
            combos = next;
        }
        combos
    }

    /// Full index entries for this document: value parts plus primary key
    pub fn entries_for(&self, doc: &Value, pk_part: &[u8]) -> Vec<Vec<u8>> {
        self.entry_value_parts(doc)
            .into_iter()
            .map(|mut entry| {
                entry.extend_from_slice(pk_part);
                entry
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple(name: &str, field: &str) -> IndexInfo {
        IndexInfo::new(name, vec![(field.to_string(), IndexDirection::Ascending)])
    }

    #[test]
    fn test_document_roundtrip() {
        let mut index = simple("t_1", "t");
        index.status = IndexStatus::Building;
        index.build_id = Some(Uuid::new_v4());
        let ns = Namespace::new("app", "things");
        let doc = index.to_document(&ns);
        assert_eq!(doc["ns"], json!("app.things"));
        let parsed = IndexInfo::from_document(&doc).unwrap();
        assert_eq!(parsed, index);
    }

    #[test]
    fn test_array_field_fans_out() {
        let index = simple("t_1", "t");
        let doc = json!({"_id": 1, "t": [1, 2, 3]});
        let pk = encode_key_part(&json!(1));
        let entries = index.entries_for(&doc, &pk);
        assert_eq!(entries.len(), 3);
        for (i, entry) in entries.iter().enumerate() {
            let mut expected = encode_key_part(&json!(i as i64 + 1));
            expected.extend_from_slice(&pk);
            assert_eq!(entry, &expected);
        }
    }

    #[test]
    fn test_missing_field_indexes_as_null() {
        let index = simple("x_1", "x");
        let parts = index.entry_value_parts(&json!({"_id": 1}));
        assert_eq!(parts, vec![encode_key_part(&Value::Null)]);
    }

    #[test]
    fn test_compound_entries_are_cartesian() {
        let index = IndexInfo::new(
            "a_1_b_1",
            vec![
                ("a".to_string(), IndexDirection::Ascending),
                ("b".to_string(), IndexDirection::Ascending),
            ],
        );
        let doc = json!({"a": [1, 2], "b": ["x"]});
        let parts = index.entry_value_parts(&doc);
        assert_eq!(parts.len(), 2);
        let mut first = encode_key_part(&json!(1));
        first.extend_from_slice(&encode_key_part(&json!("x")));
        assert_eq!(parts[0], first);
    }
}

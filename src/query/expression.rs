//! Path expressions
//!
//! A path expression maps a document to zero or more values by walking a
//! dot-separated field path. Arrays encountered along the way fan out: each
//! element is searched for the remaining path, and an array at the final
//! position expands into its elements. This is what makes an index over an
//! array field produce one entry per element.

use serde_json::Value;

use crate::document::DocRef;
use crate::error::QueryResult;

/// Dot-separated field path with array expansion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpression {
    path: String,
    expand_arrays: bool,
}

impl PathExpression {
    pub fn new(path: impl Into<String>) -> Self {
        PathExpression {
            path: path.into(),
            expand_arrays: true,
        }
    }

    /// A path that yields a final array as a single value instead of
    /// expanding it
    pub fn without_expansion(path: impl Into<String>) -> Self {
        PathExpression {
            path: path.into(),
            expand_arrays: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The name of the index that would hold this expression's values, if
    /// one exists. Only expanding paths are indexable.
    pub fn index_key(&self) -> Option<&str> {
        self.expand_arrays.then_some(self.path.as_str())
    }

    /// All values this expression produces for `doc`
    pub fn values(&self, doc: &Value) -> Vec<Value> {
        let segments: Vec<&str> = self.path.split('.').collect();
        let mut out = Vec::new();
        collect(doc, &segments, self.expand_arrays, &mut out);
        out
    }

    /// Evaluate against a document reference
    pub async fn evaluate(&self, doc: &DocRef) -> QueryResult<Vec<Value>> {
        Ok(self.values(&doc.value().await?))
    }

    pub fn describe(&self) -> String {
        format!("path({})", self.path)
    }
}

fn collect(value: &Value, segments: &[&str], expand: bool, out: &mut Vec<Value>) {
    match segments.split_first() {
        Some((first, rest)) => match value {
            Value::Object(map) => {
                if let Some(next) = map.get(*first) {
                    collect(next, rest, expand, out);
                }
            }
            Value::Array(items) => {
                for item in items {
                    collect(item, segments, expand, out);
                }
            }
            _ => {}
        },
        None => match value {
            Value::Array(items) if expand => out.extend(items.iter().cloned()),
            other => out.push(other.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_path() {
        let doc = json!({"a": {"b": 5}});
        assert_eq!(PathExpression::new("a.b").values(&doc), vec![json!(5)]);
        assert!(PathExpression::new("a.missing").values(&doc).is_empty());
    }

    #[test]
    fn test_final_array_expands() {
        let doc = json!({"t": [1, 2, 3]});
        assert_eq!(
            PathExpression::new("t").values(&doc),
            vec![json!(1), json!(2), json!(3)]
        );
        assert_eq!(
            PathExpression::without_expansion("t").values(&doc),
            vec![json!([1, 2, 3])]
        );
    }

    #[test]
    fn test_array_of_subdocuments() {
        let doc = json!({"items": [{"q": 1}, {"q": 2}, {"other": 3}]});
        assert_eq!(
            PathExpression::new("items.q").values(&doc),
            vec![json!(1), json!(2)]
        );
    }

    #[test]
    fn test_index_key_requires_expansion() {
        assert_eq!(PathExpression::new("t").index_key(), Some("t"));
        assert_eq!(PathExpression::without_expansion("t").index_key(), None);
    }
}
